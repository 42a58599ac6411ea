//! The CA rotation state machine.
//!
//! ```text
//! standby ─init─► init ─update_clients─► update_clients ─update_servers─► update_servers ─standby─► standby
//!   ▲               │                          │                                │
//!   └───────────────┴────────────rollback──────┴──────────rollback──────────────┘
//! ```
//!
//! At most one rotation is in flight per authority; the phase field is the
//! whole of that state.

use serde::{Deserialize, Serialize};

use drawbridge_domain::{GatewayError, GatewayResult};

/// The phase an authority currently sits in
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RotationPhase {
    Standby,
    Init,
    UpdateClients,
    UpdateServers,
}

/// The phase a rotate call requests
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RotationRequest {
    Init,
    UpdateClients,
    UpdateServers,
    Rollback,
    Standby,
}

/// What the store must do to the key sets when a transition is taken
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RotationEffect {
    /// Generate successor keys into the additional set
    GenerateSuccessors,
    /// No key material change, only the phase advances
    AdvancePhase,
    /// Promote the additional set to active, purging predecessors
    PromoteSuccessors,
    /// Drop the additional set, reverting to predecessor keys
    DropSuccessors,
}

pub fn transition(
    current: RotationPhase,
    request: RotationRequest,
) -> GatewayResult<(RotationPhase, RotationEffect)> {
    use RotationEffect::*;
    use RotationPhase::*;

    match (current, request) {
        (Standby, RotationRequest::Init) => Ok((Init, GenerateSuccessors)),
        (Init, RotationRequest::UpdateClients) => Ok((UpdateClients, AdvancePhase)),
        (UpdateClients, RotationRequest::UpdateServers) => Ok((UpdateServers, AdvancePhase)),
        (UpdateServers, RotationRequest::Standby) => Ok((Standby, PromoteSuccessors)),
        (Init | UpdateClients | UpdateServers, RotationRequest::Rollback) => {
            Ok((Standby, DropSuccessors))
        }
        (current, request) => Err(GatewayError::InvalidArgument(format!(
            "rotation {request} is not valid from phase {current}"
        ))),
    }
}
