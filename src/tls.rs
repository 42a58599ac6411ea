//! TLS assembly for the proxy's multi-protocol port.
//!
//! The server certificate is signed by the host authority (the rotation
//! phase decides which key presents); the client verifier trusts the user
//! authority set and advertises the bounded AcceptableCAs list. Fresh
//! configs are swapped in without restarting listeners.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rustls::ServerConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use drawbridge_domain::cert::server_cert;
use drawbridge_domain::{GatewayError, GatewayResult};
use drawbridge_tunnel::alpn;

use crate::ca::{trust::HintedClientVerifier, CaStore, CaType};

pub fn init_tls_ring() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build the proxy server config against the store's current trust state.
/// The certificate is valid for twice the rotation rate.
pub fn proxy_server_config(
    ca: &CaStore,
    hostname: &str,
    rotation_rate: Duration,
) -> GatewayResult<Arc<ServerConfig>> {
    let not_after = time::Duration::try_from(rotation_rate)
        .map_err(|_| GatewayError::BadParameter("rotation rate".to_string()))?
        * 2;

    let server_cert = ca.sign_host_server_cert(server_cert(
        "drawbridge",
        vec![hostname.to_string()],
        not_after,
    )?)?;

    let verifier = HintedClientVerifier::new(
        ca.root_cert_store(CaType::User)?,
        ca.acceptable_ca_subjects()?,
    )?
    .optional();

    let private_key_der = server_cert.private_key_der()?;
    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(vec![server_cert.der], private_key_der)
        .map_err(|err| GatewayError::BadParameter(format!("server tls: {err}")))?;

    config.alpn_protocols = alpn::registry();
    Ok(Arc::new(config))
}

/// Produce the initial config and keep regenerating it: periodically (the
/// certificate rotation rate) and on demand via `reload`.
pub fn spawn_tls_reloader(
    ca: Arc<CaStore>,
    hostname: String,
    rotation_rate: Duration,
    cancel: CancellationToken,
) -> GatewayResult<(Arc<ArcSwap<ServerConfig>>, tokio::sync::mpsc::Sender<()>)> {
    info!(hostname, "generating proxy server certificate");
    let swap = Arc::new(ArcSwap::new(proxy_server_config(
        &ca,
        &hostname,
        rotation_rate,
    )?));

    let (reload_tx, mut reload_rx) = tokio::sync::mpsc::channel::<()>(1);

    tokio::spawn({
        let swap = swap.clone();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(rotation_rate) => {}
                    reload = reload_rx.recv() => {
                        if reload.is_none() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }

                match proxy_server_config(&ca, &hostname, rotation_rate) {
                    Ok(config) => {
                        info!("proxy TLS config regenerated");
                        swap.store(config);
                    }
                    Err(err) => error!(?err, "unable to regenerate proxy TLS config"),
                }
            }
        }
    });

    Ok((swap, reload_tx))
}
