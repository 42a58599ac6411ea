//! Tunnel wire frames.
//!
//! The envelope is a length-delimited postcard enum; control messages are
//! JSON inside the envelope so both ends can evolve their schema by tagged
//! fields (unknown tags are ignored).

use serde::{Deserialize, Serialize};

use drawbridge_domain::resource::ConnectionType;

use crate::{TunnelError, TunnelResult};

/// Bytes buffered into a stream before the multiplexer must produce a frame
pub const BUFSIZE: usize = 16 * 1024;

/// Hard cap on a single frame, enforced by the length-delimited codec
pub const MAX_FRAME: usize = 2 * BUFSIZE;

#[derive(Serialize, Deserialize, Debug)]
pub enum TunnelFrame {
    /// JSON-encoded [ControlMsg]
    Control(Vec<u8>),
    /// The remote side opened stream `id`
    Open { id: u32 },
    Data { id: u32, payload: Vec<u8> },
    Close { id: u32 },
}

impl TunnelFrame {
    pub fn encode(&self) -> TunnelResult<Vec<u8>> {
        postcard::to_stdvec(self).map_err(|err| TunnelError::Codec(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> TunnelResult<Self> {
        postcard::from_bytes(bytes).map_err(|err| TunnelError::Codec(err.to_string()))
    }

    pub fn control(msg: &ControlMsg) -> TunnelResult<Self> {
        let payload =
            serde_json::to_vec(msg).map_err(|err| TunnelError::Codec(err.to_string()))?;
        Ok(Self::Control(payload))
    }
}

/// Control messages exchanged on the tunnel connection, outside any stream.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMsg {
    /// First message from the agent after the handshake
    Hello {
        server_id: String,
        cluster: String,
        conn_type: ConnectionType,
    },

    /// Periodic liveness signal from the agent
    Heartbeat,

    /// Proxy roster pushed to agents so they connect to proxies they have
    /// not discovered yet
    DiscoveryRequest { proxies: Vec<DiscoveryProxy> },

    /// Schema evolution: message types this build does not know are ignored
    #[serde(other)]
    Unknown,
}

impl ControlMsg {
    pub fn from_json(payload: &[u8]) -> TunnelResult<Self> {
        serde_json::from_slice(payload).map_err(|err| TunnelError::Codec(err.to_string()))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct DiscoveryProxy {
    pub version: String,
    pub metadata: DiscoveryProxyMetadata,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct DiscoveryProxyMetadata {
    pub name: String,
}

impl DiscoveryProxy {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            metadata: DiscoveryProxyMetadata { name: name.into() },
        }
    }
}
