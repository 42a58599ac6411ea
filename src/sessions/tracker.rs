//! The session tracker.
//!
//! Created on session start and refreshed by extending its backend expiry;
//! state transitions form `pending → active → terminated` and are broadcast
//! to every waiter. A tracker whose backend record disappears is detached:
//! the refresh loop aborts immediately.

use std::sync::Arc;
use std::time::Duration;

use drawbridge_backend::Backend;
use drawbridge_domain::id::SessionId;
use drawbridge_domain::resource::ResourceKind;
use drawbridge_domain::{GatewayError, GatewayResult};
use drawbridge_tunnel::retry::LinearBackoff;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::resources;

pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);
const RETRY_STEP: Duration = Duration::from_secs(60);
const RETRY_CAP: Duration = Duration::from_secs(3 * 60);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Debug, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Terminated,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct StoredTracker {
    pub id: SessionId,
    pub kind: String,
    pub participants: Vec<String>,
    pub state: SessionState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub host: String,
    #[serde(default)]
    pub moderators_required: u32,
}

pub struct SessionTracker<B> {
    backend: B,
    state_tx: watch::Sender<SessionState>,
    resource: std::sync::Mutex<StoredTracker>,
    cancel: CancellationToken,
}

impl<B: Backend + Clone> SessionTracker<B> {
    /// Create and persist the tracker, then start the refresh loop.
    pub async fn create(
        backend: B,
        kind: &str,
        host: &str,
        user: &str,
        moderators_required: u32,
        cancel: CancellationToken,
    ) -> GatewayResult<Arc<Self>> {
        let now = OffsetDateTime::now_utc();
        let resource = StoredTracker {
            id: SessionId::random(),
            kind: kind.to_string(),
            participants: vec![user.to_string()],
            state: SessionState::Pending,
            created_at: now,
            expires_at: now + SESSION_TTL,
            host: host.to_string(),
            moderators_required,
        };

        persist(&backend, &resource).await?;
        info!(session_id = %resource.id, kind, host, "session tracker created");

        let (state_tx, _) = watch::channel(SessionState::Pending);
        let tracker = Arc::new(Self {
            backend,
            state_tx,
            resource: std::sync::Mutex::new(resource),
            cancel,
        });

        tracker.clone().spawn_refresh();
        Ok(tracker)
    }

    pub fn id(&self) -> SessionId {
        self.resource.lock().expect("tracker lock").id
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn snapshot(&self) -> StoredTracker {
        self.resource.lock().expect("tracker lock").clone()
    }

    /// Monotone observation of state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Advance the state. Transitions only move forward; a repeated or
    /// backwards transition is rejected.
    pub async fn set_state(&self, next: SessionState) -> GatewayResult<()> {
        let resource = {
            let mut resource = self.resource.lock().expect("tracker lock");
            if next <= resource.state {
                return Err(GatewayError::InvalidArgument(format!(
                    "session state cannot move from {} to {next}",
                    resource.state
                )));
            }
            resource.state = next;
            resource.clone()
        };

        persist(&self.backend, &resource).await?;
        let _ = self.state_tx.send(next);

        if next == SessionState::Terminated {
            self.cancel.cancel();
        }
        Ok(())
    }

    pub async fn add_participant(&self, user: &str) -> GatewayResult<()> {
        let resource = {
            let mut resource = self.resource.lock().expect("tracker lock");
            if resource.state == SessionState::Terminated {
                return Err(GatewayError::InvalidArgument(
                    "session already terminated".to_string(),
                ));
            }
            if !resource.participants.iter().any(|p| p == user) {
                resource.participants.push(user.to_string());
            }
            resource.clone()
        };
        persist(&self.backend, &resource).await
    }

    /// Block until the session reaches its terminal state
    pub async fn wait_terminated(&self) {
        let mut rx = self.subscribe();
        while *rx.borrow() != SessionState::Terminated {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn_refresh(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let wait = SESSION_TTL / 3;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.cancel.cancelled() => return,
                }

                if self.refresh_with_backoff().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Extend the expiry; on failure retry with linear backoff bounded by
    /// the current expiry. A missing backend record detaches the session.
    async fn refresh_with_backoff(&self) -> GatewayResult<()> {
        let mut backoff = LinearBackoff::new(RETRY_STEP, RETRY_CAP);

        loop {
            let resource = {
                let mut resource = self.resource.lock().expect("tracker lock");
                resource.expires_at = OffsetDateTime::now_utc() + SESSION_TTL;
                resource.clone()
            };

            let key = resources::resource_key(ResourceKind::SessionTracker, &resource.id.to_string());
            match self.backend.get(&key).await {
                Err(drawbridge_backend::BackendError::NotFound(_)) => {
                    warn!(session_id = %resource.id, "tracker record gone, detaching");
                    self.cancel.cancel();
                    return Err(GatewayError::NotFound("session tracker".to_string()));
                }
                Err(err) => debug!(?err, "tracker read failed before refresh"),
                Ok(_) => {}
            }

            match persist(&self.backend, &resource).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if OffsetDateTime::now_utc() >= resource.expires_at {
                        warn!(session_id = %resource.id, "tracker expired during refresh retries");
                        self.cancel.cancel();
                        return Err(err);
                    }
                    let delay = backoff.next_delay();
                    debug!(?err, ?delay, "tracker refresh failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(GatewayError::Canceled),
                    }
                }
            }
        }
    }
}

async fn persist<B: Backend>(backend: &B, resource: &StoredTracker) -> GatewayResult<()> {
    resources::upsert(
        backend,
        ResourceKind::SessionTracker,
        &resource.id.to_string(),
        resource,
        Some(resource.expires_at),
    )
    .await?;
    Ok(())
}

/// Fetch a tracker record, for the auth service's `get_session_tracker`
pub async fn get_session_tracker<B: Backend>(
    backend: &B,
    id: SessionId,
) -> GatewayResult<StoredTracker> {
    resources::get(backend, ResourceKind::SessionTracker, &id.to_string()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawbridge_backend::memory::MemoryBackend;

    #[test_log::test(tokio::test)]
    async fn lifecycle_broadcasts_exactly_one_terminal_transition() {
        let backend = MemoryBackend::new();
        let tracker = SessionTracker::create(
            backend.clone(),
            "ssh",
            "edge-1",
            "alice",
            0,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut early = tracker.subscribe();
        let mut late = tracker.subscribe();

        tracker.set_state(SessionState::Active).await.unwrap();
        tracker.set_state(SessionState::Terminated).await.unwrap();

        // repeated/backwards transitions are rejected
        assert!(tracker.set_state(SessionState::Terminated).await.is_err());
        assert!(tracker.set_state(SessionState::Active).await.is_err());

        let mut terminal_seen = 0;
        for rx in [&mut early, &mut late] {
            while *rx.borrow_and_update() != SessionState::Terminated {
                rx.changed().await.unwrap();
            }
            terminal_seen += 1;
        }
        assert_eq!(2, terminal_seen);

        let stored = get_session_tracker(&backend, tracker.id()).await.unwrap();
        assert_eq!(SessionState::Terminated, stored.state);
    }

    #[test_log::test(tokio::test)]
    async fn participants_accumulate_without_duplicates() {
        let backend = MemoryBackend::new();
        let tracker = SessionTracker::create(
            backend.clone(),
            "kube",
            "kube0",
            "alice",
            1,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        tracker.add_participant("bob").await.unwrap();
        tracker.add_participant("bob").await.unwrap();

        let stored = get_session_tracker(&backend, tracker.id()).await.unwrap();
        assert_eq!(vec!["alice", "bob"], stored.participants);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn missing_record_detaches_the_tracker() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let tracker = SessionTracker::create(
            backend.clone(),
            "ssh",
            "edge-1",
            "alice",
            0,
            cancel.clone(),
        )
        .await
        .unwrap();

        // simulate an external delete of the tracker record
        resources::remove(
            &backend,
            ResourceKind::SessionTracker,
            &tracker.id().to_string(),
        )
        .await
        .unwrap();

        // past the first refresh point the loop must abort immediately
        tokio::time::advance(SESSION_TTL / 3 + Duration::from_secs(1)).await;
        tokio::time::timeout(Duration::from_secs(60), cancel.cancelled())
            .await
            .expect("detached tracker cancels itself");
    }
}
