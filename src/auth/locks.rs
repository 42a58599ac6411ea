//! The lock watcher.
//!
//! Proxies and services keep a local cache of lock resources and consult it
//! on every session-affecting operation. In strict mode, losing confidence
//! in the cache's freshness fails closed: covered sessions terminate until
//! confirmation resumes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use drawbridge_backend::Backend;
use drawbridge_domain::resource::{Lock, LockingMode, ResourceKind};
use drawbridge_domain::{GatewayError, GatewayResult};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::resources;
use super::watch::{WatchDispatcher, WatchEvent};

pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// What an operation is about; every populated lock-target field must match
/// one of these for the lock to bite.
#[derive(Clone, Default, Debug)]
pub struct LockQuery {
    pub user: Option<String>,
    pub roles: Vec<String>,
    pub login: Option<String>,
    pub node: Option<String>,
    pub mfa_device: Option<String>,
    pub access_requests: Vec<String>,
}

impl LockQuery {
    pub fn for_user(user: &str, roles: &[String]) -> Self {
        Self {
            user: Some(user.to_string()),
            roles: roles.to_vec(),
            ..Default::default()
        }
    }
}

fn lock_applies(lock: &Lock, query: &LockQuery, now: OffsetDateTime) -> bool {
    if !lock.in_force(now) {
        return false;
    }
    let target = &lock.target;
    if target.is_empty() {
        return false;
    }

    let field_matches = [
        target
            .user
            .as_ref()
            .map(|user| query.user.as_ref() == Some(user)),
        target.role.as_ref().map(|role| query.roles.contains(role)),
        target
            .login
            .as_ref()
            .map(|login| query.login.as_ref() == Some(login)),
        target
            .node
            .as_ref()
            .map(|node| query.node.as_ref() == Some(node)),
        target
            .mfa_device
            .as_ref()
            .map(|device| query.mfa_device.as_ref() == Some(device)),
        target
            .access_request
            .as_ref()
            .map(|request| query.access_requests.contains(request)),
    ];

    field_matches.into_iter().flatten().all(|matched| matched)
}

struct LockCache {
    locks: RwLock<HashMap<String, Lock>>,
}

#[derive(Clone)]
pub struct LockWatcher {
    mode: LockingMode,
    cache: Arc<LockCache>,
    stale_rx: watch::Receiver<bool>,
}

impl LockWatcher {
    /// Spawn the watcher: initial list, then event-driven cache updates
    /// with periodic freshness re-lists.
    pub fn spawn<B: Backend + Clone>(
        backend: B,
        dispatcher: &WatchDispatcher,
        mode: LockingMode,
        stale_threshold: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let cache = Arc::new(LockCache {
            locks: RwLock::new(HashMap::new()),
        });
        let (stale_tx, stale_rx) = watch::channel(false);

        tokio::spawn({
            let cache = cache.clone();
            let mut stream = dispatcher.subscribe([ResourceKind::Lock]);
            async move {
                let mut refresh = tokio::time::interval(stale_threshold / 2);
                refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut last_confirmed = tokio::time::Instant::now();

                loop {
                    tokio::select! {
                        event = stream.recv() => {
                            match event {
                                Some(WatchEvent::Init) | Some(WatchEvent::Reset) => {
                                    match relist(&backend, &cache).await {
                                        Ok(()) => last_confirmed = tokio::time::Instant::now(),
                                        Err(err) => warn!(?err, "lock re-list failed"),
                                    }
                                }
                                Some(WatchEvent::Put { kind: _, name, value }) => {
                                    if let Ok(lock) = resources::decode::<Lock>(ResourceKind::Lock, &value) {
                                        cache.locks.write().expect("lock cache").insert(name, lock);
                                    }
                                    last_confirmed = tokio::time::Instant::now();
                                }
                                Some(WatchEvent::Delete { kind: _, name }) => {
                                    cache.locks.write().expect("lock cache").remove(&name);
                                    last_confirmed = tokio::time::Instant::now();
                                }
                                None => {
                                    warn!("lock watch stream lost");
                                    // keep running on periodic re-lists only
                                }
                            }
                        }
                        _ = refresh.tick() => {
                            match relist(&backend, &cache).await {
                                Ok(()) => last_confirmed = tokio::time::Instant::now(),
                                Err(err) => warn!(?err, "lock freshness re-list failed"),
                            }
                        }
                        _ = cancel.cancelled() => {
                            info!("lock watcher shutting down");
                            return;
                        }
                    }

                    let stale = last_confirmed.elapsed() > stale_threshold;
                    if *stale_tx.borrow() != stale {
                        let _ = stale_tx.send(stale);
                    }
                }
            }
        });

        Self {
            mode,
            cache,
            stale_rx,
        }
    }

    pub fn mode(&self) -> LockingMode {
        self.mode
    }

    pub fn is_stale(&self) -> bool {
        *self.stale_rx.borrow()
    }

    /// Session managers watch this to terminate covered sessions when
    /// strict-mode freshness is lost.
    pub fn stale_signal(&self) -> watch::Receiver<bool> {
        self.stale_rx.clone()
    }

    /// Check the query against the cached lock set. Strict mode fails
    /// closed when freshness cannot be confirmed.
    pub fn check(&self, query: &LockQuery) -> GatewayResult<()> {
        if matches!(self.mode, LockingMode::Strict) && self.is_stale() {
            return Err(GatewayError::Locked(
                "lock freshness cannot be confirmed".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let locks = self.cache.locks.read().expect("lock cache");
        for lock in locks.values() {
            if lock_applies(lock, query, now) {
                let message = lock
                    .message
                    .clone()
                    .unwrap_or_else(|| lock.name.clone());
                return Err(GatewayError::Locked(message));
            }
        }
        Ok(())
    }
}

async fn relist<B: Backend>(backend: &B, cache: &LockCache) -> GatewayResult<()> {
    let locks: Vec<Lock> = resources::list(backend, ResourceKind::Lock).await?;
    let mut map = cache.locks.write().expect("lock cache");
    map.clear();
    for lock in locks {
        map.insert(lock.name.clone(), lock);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawbridge_backend::memory::MemoryBackend;
    use drawbridge_domain::resource::LockTarget;

    fn lock_named(name: &str, user: &str) -> Lock {
        Lock {
            name: name.to_string(),
            target: LockTarget {
                user: Some(user.to_string()),
                ..Default::default()
            },
            message: Some(format!("{user} is locked out")),
            expires: None,
        }
    }

    #[test]
    fn lock_matching_rules() {
        let now = OffsetDateTime::now_utc();
        let lock = lock_named("ban-alice", "alice");

        assert!(lock_applies(
            &lock,
            &LockQuery::for_user("alice", &[]),
            now
        ));
        assert!(!lock_applies(&lock, &LockQuery::for_user("bob", &[]), now));

        // a target with two fields requires both to match
        let lock = Lock {
            target: LockTarget {
                user: Some("alice".to_string()),
                login: Some("root".to_string()),
                ..Default::default()
            },
            ..lock_named("ban-alice-root", "alice")
        };
        let mut query = LockQuery::for_user("alice", &[]);
        assert!(!lock_applies(&lock, &query, now));
        query.login = Some("root".to_string());
        assert!(lock_applies(&lock, &query, now));
    }

    /// Backend whose listings can be made to fail, to starve freshness
    #[derive(Clone)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_lists: Arc<std::sync::atomic::AtomicBool>,
    }

    impl drawbridge_backend::Backend for FlakyBackend {
        async fn get(&self, key: &str) -> drawbridge_backend::BackendResult<drawbridge_backend::Item> {
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: &str,
            value: Vec<u8>,
            expires: Option<OffsetDateTime>,
        ) -> drawbridge_backend::BackendResult<u64> {
            self.inner.put(key, value, expires).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&[u8]>,
            value: Vec<u8>,
            expires: Option<OffsetDateTime>,
        ) -> drawbridge_backend::BackendResult<u64> {
            self.inner.compare_and_swap(key, expected, value, expires).await
        }

        async fn delete(&self, key: &str) -> drawbridge_backend::BackendResult<()> {
            self.inner.delete(key).await
        }

        async fn range(
            &self,
            prefix: &str,
        ) -> drawbridge_backend::BackendResult<Vec<drawbridge_backend::Item>> {
            if self.fail_lists.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(drawbridge_backend::BackendError::Closed);
            }
            self.inner.range(prefix).await
        }

        fn events(&self) -> drawbridge_backend::EventSubscription {
            self.inner.events()
        }
    }

    #[test_log::test(tokio::test)]
    async fn strict_mode_fails_closed_when_freshness_is_lost() {
        let fail_lists = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let backend = FlakyBackend {
            inner: MemoryBackend::new(),
            fail_lists: fail_lists.clone(),
        };

        let cancel = CancellationToken::new();
        let dispatcher = WatchDispatcher::spawn(&backend, cancel.child_token());
        let watcher = LockWatcher::spawn(
            backend.clone(),
            &dispatcher,
            LockingMode::Strict,
            Duration::from_millis(200),
            cancel.child_token(),
        );

        let query = LockQuery::for_user("alice", &[]);
        watcher.check(&query).unwrap();

        // freshness confirmation stops
        fail_lists.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut stale = watcher.stale_signal();
        tokio::time::timeout(Duration::from_secs(10), async {
            while !*stale.borrow_and_update() {
                stale.changed().await.unwrap();
            }
        })
        .await
        .expect("staleness must be reported");

        // strict mode now denies everything, lock or not
        let denied = watcher.check(&query).unwrap_err();
        assert!(matches!(denied, GatewayError::Locked(_)));

        // confirmation resumes
        fail_lists.store(false, std::sync::atomic::Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(10), async {
            while *stale.borrow_and_update() {
                stale.changed().await.unwrap();
            }
        })
        .await
        .expect("freshness must recover");
        watcher.check(&query).unwrap();

        cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn lock_events_update_the_cache() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let dispatcher = WatchDispatcher::spawn(&backend, cancel.child_token());
        let watcher = LockWatcher::spawn(
            backend.clone(),
            &dispatcher,
            LockingMode::BestEffort,
            DEFAULT_STALE_THRESHOLD,
            cancel.child_token(),
        );

        let query = LockQuery::for_user("alice", &[]);
        watcher.check(&query).unwrap();

        resources::upsert(
            &backend,
            ResourceKind::Lock,
            "ban-alice",
            &lock_named("ban-alice", "alice"),
            None,
        )
        .await
        .unwrap();

        // wait for the watch event to land
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if watcher.check(&query).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lock must become visible");

        let err = watcher.check(&query).unwrap_err();
        assert!(matches!(err, GatewayError::Locked(_)));

        cancel.cancel();
    }
}
