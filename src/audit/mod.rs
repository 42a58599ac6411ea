//! Audit events and the delivery sink.
//!
//! Events carry a stable `type` string and numeric `code`. Delivery is
//! at-least-once and ordered within a session id; there is no total order
//! across the cluster.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use drawbridge_domain::id::SessionId;

pub mod sink;

pub use sink::{AuditEmitter, AuditSink, MemoryAuditSink};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    UserLogin {
        user: String,
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    CertIssued {
        user: String,
        usage: String,
    },
    HostJoined {
        host_id: String,
        node_name: String,
        role: String,
    },
    ResourceUpserted {
        kind: String,
        name: String,
        user: String,
    },
    ResourceDeleted {
        kind: String,
        name: String,
        user: String,
    },
    SessionStart {
        session_id: SessionId,
        user: String,
        host: String,
    },
    SessionJoin {
        session_id: SessionId,
        user: String,
    },
    SessionEnd {
        session_id: SessionId,
        user: String,
    },
    LockCreated {
        name: String,
        user: String,
    },
    RotationStep {
        ca_type: String,
        phase: String,
    },
    AccessDenied {
        user: String,
        reason: String,
    },
    /// Marker inserted when buffered events had to be discarded
    EventsDropped {
        dropped: u64,
    },
}

impl AuditEvent {
    /// Stable numeric code
    pub fn code(&self) -> u16 {
        match self {
            Self::UserLogin { success: true, .. } => 1000,
            Self::UserLogin { success: false, .. } => 1001,
            Self::CertIssued { .. } => 1010,
            Self::HostJoined { .. } => 1020,
            Self::ResourceUpserted { .. } => 1030,
            Self::ResourceDeleted { .. } => 1031,
            Self::SessionStart { .. } => 2000,
            Self::SessionJoin { .. } => 2001,
            Self::SessionEnd { .. } => 2002,
            Self::LockCreated { .. } => 3000,
            Self::RotationStep { .. } => 3010,
            Self::AccessDenied { .. } => 3020,
            Self::EventsDropped { .. } => 3090,
        }
    }

    /// Stable type string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UserLogin { .. } => "user.login",
            Self::CertIssued { .. } => "cert.issued",
            Self::HostJoined { .. } => "host.joined",
            Self::ResourceUpserted { .. } => "resource.upserted",
            Self::ResourceDeleted { .. } => "resource.deleted",
            Self::SessionStart { .. } => "session.start",
            Self::SessionJoin { .. } => "session.join",
            Self::SessionEnd { .. } => "session.end",
            Self::LockCreated { .. } => "lock.created",
            Self::RotationStep { .. } => "ca.rotation",
            Self::AccessDenied { .. } => "access.denied",
            Self::EventsDropped { .. } => "events.dropped",
        }
    }

    /// Session events are never dropped and keep FIFO order per session
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::SessionStart { session_id, .. }
            | Self::SessionJoin { session_id, .. }
            | Self::SessionEnd { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }
}

/// The envelope written to storage
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EmittedEvent {
    #[serde(flatten)]
    pub event: AuditEvent,
    pub code: u16,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

impl EmittedEvent {
    pub fn new(event: AuditEvent) -> Self {
        Self {
            code: event.code(),
            time: OffsetDateTime::now_utc(),
            event,
        }
    }
}
