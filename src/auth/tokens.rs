//! Join tokens.
//!
//! An agent joins with `(cluster_address, token, role)`. Static tokens come
//! from configuration; dynamic tokens are single-use with a TTL. Only the
//! blake3 hash of the secret is persisted.

use drawbridge_backend::Backend;
use drawbridge_domain::resource::{HostRole, ResourceKind};
use drawbridge_domain::{GatewayError, GatewayResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::resources;

const TOKEN_BYTES: usize = 16;

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct JoinToken {
    /// Opaque token id (not the secret)
    pub name: String,
    /// blake3 hash of the secret, hex
    pub secret_hash: String,
    /// Host roles this token may join as
    pub roles: Vec<HostRole>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,
    #[serde(default)]
    pub single_use: bool,
}

fn hash_secret(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex().to_string()
}

fn new_secret() -> SecretString {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    SecretString::from(hex::encode(bytes))
}

/// Create a dynamic join token; the secret is returned exactly once.
pub async fn create_join_token(
    backend: &impl Backend,
    roles: Vec<HostRole>,
    ttl: Option<std::time::Duration>,
    single_use: bool,
) -> GatewayResult<(JoinToken, SecretString)> {
    if roles.is_empty() {
        return Err(GatewayError::InvalidArgument(
            "join token needs at least one role".to_string(),
        ));
    }

    let secret = new_secret();
    let token = JoinToken {
        name: hex::encode(rand::random::<[u8; 8]>()),
        secret_hash: hash_secret(secret.expose_secret()),
        roles,
        expires: ttl.map(|ttl| OffsetDateTime::now_utc() + ttl),
        single_use,
    };

    resources::upsert(backend, ResourceKind::JoinToken, &token.name, &token, token.expires)
        .await?;

    Ok((token, secret))
}

/// Register a static (configured) token; replaces any previous token of the
/// same name.
pub async fn upsert_static_token(
    backend: &impl Backend,
    name: &str,
    secret: &str,
    roles: Vec<HostRole>,
) -> GatewayResult<()> {
    let token = JoinToken {
        name: name.to_string(),
        secret_hash: hash_secret(secret),
        roles,
        expires: None,
        single_use: false,
    };
    resources::upsert(backend, ResourceKind::JoinToken, name, &token, None).await?;
    Ok(())
}

/// Validate the presented secret for the requested role. A single-use token
/// is atomically consumed; losing the compare-and-swap race means someone
/// else spent it.
pub async fn consume_join_token(
    backend: &impl Backend,
    secret: &str,
    role: HostRole,
) -> GatewayResult<JoinToken> {
    let presented_hash = hash_secret(secret);
    let now = OffsetDateTime::now_utc();

    let tokens: Vec<JoinToken> = resources::list(backend, ResourceKind::JoinToken).await?;
    let token = tokens
        .into_iter()
        .find(|token| token.secret_hash == presented_hash)
        .ok_or(GatewayError::AccessDenied)?;

    if let Some(expires) = token.expires {
        if expires <= now {
            return Err(GatewayError::AccessDenied);
        }
    }
    if !token.roles.contains(&role) {
        return Err(GatewayError::AccessDenied);
    }

    if token.single_use {
        let key = resources::resource_key(ResourceKind::JoinToken, &token.name);
        let original = serde_json::to_vec(&token)
            .map_err(|err| GatewayError::InvalidArgument(format!("token encoding: {err}")))?;

        backend
            .compare_and_swap(&key, Some(&original), b"consumed".to_vec(), Some(now))
            .await
            .map_err(|_| GatewayError::AccessDenied)?;
        let _ = backend.delete(&key).await;
    }

    Ok(token)
}
