//! Session lifecycle and resource heartbeats.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

pub mod heartbeat;
pub mod tracker;

pub use heartbeat::{HeartbeatConfig, HeartbeatDriver, HeartbeatHandle};
pub use tracker::{SessionState, SessionTracker, StoredTracker};

/// Live session handles on this process, for fail-closed termination when
/// strict locking loses freshness.
#[derive(Default)]
pub struct ActiveSessions {
    tokens: Mutex<Vec<CancellationToken>>,
}

impl ActiveSessions {
    pub fn register(&self, token: CancellationToken) {
        let mut tokens = self.tokens.lock().expect("sessions lock");
        tokens.retain(|token| !token.is_cancelled());
        tokens.push(token);
    }

    pub fn terminate_all(&self) {
        let mut tokens = self.tokens.lock().expect("sessions lock");
        for token in tokens.drain(..) {
            token.cancel();
        }
    }

    pub fn live_count(&self) -> usize {
        let tokens = self.tokens.lock().expect("sessions lock");
        tokens.iter().filter(|token| !token.is_cancelled()).count()
    }
}
