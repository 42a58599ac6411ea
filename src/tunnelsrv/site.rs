//! Sites and the remote connections that realize them.
//!
//! A site is the runtime representation of a cluster inside the tunnel
//! server. Each inbound agent transport becomes a [RemoteConn], owned by
//! this server instance for its whole life.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::resource::ConnectionType;
use drawbridge_tunnel::mux::MuxHandle;
use tokio::time::Instant;
use tracing::{debug, info};

struct HeartbeatState {
    last: Instant,
    /// Promoted on the first heartbeat
    ready: bool,
    /// Consecutive sweep intervals the heartbeat was overdue
    missed: u32,
}

pub struct RemoteConn {
    pub server_id: String,
    pub conn_type: ConnectionType,
    handle: MuxHandle,
    heartbeat: Mutex<HeartbeatState>,
    valid: AtomicBool,
    /// Invalid but kept alive for an attached session
    close_pending: AtomicBool,
    sessions: AtomicUsize,
    established: Instant,
}

impl RemoteConn {
    pub fn new(server_id: String, conn_type: ConnectionType, handle: MuxHandle) -> Self {
        Self {
            server_id,
            conn_type,
            handle,
            heartbeat: Mutex::new(HeartbeatState {
                last: Instant::now(),
                ready: false,
                missed: 0,
            }),
            valid: AtomicBool::new(true),
            close_pending: AtomicBool::new(false),
            sessions: AtomicUsize::new(0),
            established: Instant::now(),
        }
    }

    pub fn handle(&self) -> &MuxHandle {
        &self.handle
    }

    /// A heartbeat resets the missed counter and revalidates the connection
    pub fn record_heartbeat(&self) {
        let mut state = self.heartbeat.lock().expect("heartbeat lock");
        state.last = Instant::now();
        state.ready = true;
        state.missed = 0;
        self.valid.store(true, Ordering::SeqCst);
        self.close_pending.store(false, Ordering::SeqCst);
    }

    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst) && !self.handle.is_closed()
    }

    pub fn is_ready(&self) -> bool {
        self.heartbeat.lock().expect("heartbeat lock").ready
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.heartbeat.lock().expect("heartbeat lock").last
    }

    pub fn attach_session(self: &Arc<Self>) -> SessionGuard {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        SessionGuard { conn: self.clone() }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.handle.cancellation().cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// One sweep step. Returns true when the connection should be removed.
    fn sweep(&self, offline_threshold: Duration, missed_threshold: u32) -> bool {
        if self.is_closed() {
            return true;
        }

        let overdue = {
            let mut state = self.heartbeat.lock().expect("heartbeat lock");
            if state.last.elapsed() > offline_threshold {
                state.missed += 1;
            } else {
                state.missed = 0;
            }
            state.missed
        };

        if overdue > missed_threshold {
            self.mark_invalid();
            if self.session_count() == 0 {
                debug!(server_id = %self.server_id, "closing tunnel after missed heartbeats");
                self.close();
                return true;
            }
            // a session is attached: keep until it ends
            self.close_pending.store(true, Ordering::SeqCst);
        }

        false
    }

    fn on_session_released(&self) {
        if self.close_pending.load(Ordering::SeqCst) && self.session_count() == 0 {
            debug!(server_id = %self.server_id, "closing tunnel after last session ended");
            self.close();
        }
    }
}

/// Keeps the connection's session count while a dialed stream lives
pub struct SessionGuard {
    conn: Arc<RemoteConn>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.conn.sessions.fetch_sub(1, Ordering::SeqCst);
        self.conn.on_session_released();
    }
}

pub struct Site {
    pub cluster: ClusterName,
    conns: RwLock<Vec<Arc<RemoteConn>>>,
}

impl Site {
    pub fn new(cluster: ClusterName) -> Self {
        Self {
            cluster,
            conns: RwLock::new(vec![]),
        }
    }

    pub fn add(&self, conn: Arc<RemoteConn>) {
        info!(cluster = %self.cluster, server_id = %conn.server_id, "tunnel registered");
        self.conns.write().expect("site lock").push(conn);
    }

    pub fn conns(&self) -> Vec<Arc<RemoteConn>> {
        self.conns.read().expect("site lock").clone()
    }

    pub fn conn_count(&self) -> usize {
        self.conns.read().expect("site lock").len()
    }

    /// Overlapping connections to the same server id: the most recently
    /// heartbeated healthy one wins; when all are invalid the newest invalid
    /// one is returned so the caller observes the most recent error.
    pub fn pick(&self, server_id: &str) -> Option<Arc<RemoteConn>> {
        let conns = self.conns.read().expect("site lock");
        let candidates: Vec<&Arc<RemoteConn>> = conns
            .iter()
            .filter(|conn| conn.server_id == server_id)
            .collect();

        if let Some(healthy) = candidates
            .iter()
            .filter(|conn| conn.is_valid() && conn.is_ready())
            .max_by_key(|conn| conn.last_heartbeat())
        {
            return Some((*healthy).clone());
        }

        candidates
            .into_iter()
            .max_by_key(|conn| conn.established)
            .cloned()
    }

    /// Apply the missed-heartbeat policy once and drop dead connections
    pub fn sweep(&self, offline_threshold: Duration, missed_threshold: u32) {
        let mut conns = self.conns.write().expect("site lock");
        conns.retain(|conn| !conn.sweep(offline_threshold, missed_threshold));
    }
}
