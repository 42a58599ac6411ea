//! In-memory backend driver, used by single-process deployments and the
//! test suites.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::{Backend, BackendError, BackendEvent, BackendResult, EventSubscription, Item};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

struct Inner {
    items: RwLock<BTreeMap<String, Item>>,
    revision: AtomicU64,
    events: broadcast::Sender<BackendEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                items: RwLock::new(BTreeMap::new()),
                revision: AtomicU64::new(0),
                events,
            }),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> u64 {
        self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn live(item: &Item, now: OffsetDateTime) -> bool {
        match item.expires {
            Some(expires) => expires > now,
            None => true,
        }
    }

    fn notify(&self, event: BackendEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }

    /// Drop expired records, emitting delete events for them
    pub fn purge_expired(&self, now: OffsetDateTime) {
        let expired: Vec<String> = {
            let items = self.inner.items.read().expect("backend lock");
            items
                .values()
                .filter(|item| !Self::live(item, now))
                .map(|item| item.key.clone())
                .collect()
        };

        if expired.is_empty() {
            return;
        }

        let mut items = self.inner.items.write().expect("backend lock");
        for key in expired {
            if items.remove(&key).is_some() {
                self.notify(BackendEvent::Delete { key });
            }
        }
    }
}

impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Item> {
        let now = OffsetDateTime::now_utc();
        let items = self.inner.items.read().expect("backend lock");
        items
            .get(key)
            .filter(|item| Self::live(item, now))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expires: Option<OffsetDateTime>,
    ) -> BackendResult<u64> {
        let revision = self.next_revision();
        let item = Item {
            key: key.to_string(),
            value,
            expires,
            revision,
        };

        {
            let mut items = self.inner.items.write().expect("backend lock");
            items.insert(key.to_string(), item.clone());
        }

        self.notify(BackendEvent::Put(item));
        Ok(revision)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        expires: Option<OffsetDateTime>,
    ) -> BackendResult<u64> {
        let now = OffsetDateTime::now_utc();
        let revision = self.next_revision();
        let item = Item {
            key: key.to_string(),
            value,
            expires,
            revision,
        };

        {
            let mut items = self.inner.items.write().expect("backend lock");
            let current = items.get(key).filter(|item| Self::live(item, now));

            match (expected, current) {
                (None, None) => {}
                (Some(expected), Some(current)) if current.value == expected => {}
                _ => return Err(BackendError::CompareFailed(key.to_string())),
            }

            items.insert(key.to_string(), item.clone());
        }

        self.notify(BackendEvent::Put(item));
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let removed = {
            let mut items = self.inner.items.write().expect("backend lock");
            items.remove(key)
        };

        match removed {
            Some(_) => {
                self.notify(BackendEvent::Delete {
                    key: key.to_string(),
                });
                Ok(())
            }
            None => Err(BackendError::NotFound(key.to_string())),
        }
    }

    async fn range(&self, prefix: &str) -> BackendResult<Vec<Item>> {
        let now = OffsetDateTime::now_utc();
        let items = self.inner.items.read().expect("backend lock");
        Ok(items
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, item)| Self::live(item, now))
            .map(|(_, item)| item.clone())
            .collect())
    }

    fn events(&self) -> EventSubscription {
        EventSubscription::new(self.inner.events.subscribe())
    }
}
