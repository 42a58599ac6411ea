//! Proxy resync: periodically pushes the current proxy roster to every
//! connected agent so agents can open tunnels to proxies they have not yet
//! discovered.

use std::sync::Arc;

use drawbridge_tunnel::frame::{ControlMsg, DiscoveryProxy};
use drawbridge_tunnel::retry::seventh_jitter;
use itertools::Itertools;
use tracing::{debug, trace};

use super::TunnelServer;

/// The deduplicated roster, stable-sorted by name
pub fn discovery_request(proxies: &[String], version: &str) -> ControlMsg {
    ControlMsg::DiscoveryRequest {
        proxies: proxies
            .iter()
            .unique()
            .sorted()
            .map(|name| DiscoveryProxy::new(name.clone(), version))
            .collect(),
    }
}

pub(super) fn spawn_resync(server: Arc<TunnelServer>) {
    tokio::spawn(async move {
        loop {
            let delay = seventh_jitter(server.config().resync_interval);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = server.cancel.cancelled() => return,
            }

            let roster = server.proxies();
            if roster.is_empty() {
                continue;
            }
            let request = discovery_request(&roster, &server.config().proxy_version);

            for site in server.get_sites() {
                for conn in site.conns() {
                    if !conn.is_valid() {
                        continue;
                    }
                    if let Err(err) = conn.handle().send_control(&request).await {
                        debug!(?err, server_id = %conn.server_id, "discovery push failed");
                    } else {
                        trace!(server_id = %conn.server_id, "discovery request sent");
                    }
                }
            }
        }
    });
}
