//! Generic resource persistence over the backend.
//!
//! Resources serialize to JSON under kind-scoped key prefixes. Round-trip
//! law: `upsert(x); get(x) == x` and `delete(x); get(x) == not_found`.

use drawbridge_backend::{Backend, BackendError};
use drawbridge_domain::resource::ResourceKind;
use drawbridge_domain::{GatewayError, GatewayResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;

pub fn resource_key(kind: ResourceKind, name: &str) -> String {
    format!("/{}/{name}", kind.prefix())
}

/// The resource name embedded in a backend key, if the key belongs to `kind`
pub fn name_from_key(kind: ResourceKind, key: &str) -> Option<String> {
    key.strip_prefix(&format!("/{}/", kind.prefix()))
        .map(str::to_string)
}

pub fn kind_from_key(key: &str) -> Option<(ResourceKind, String)> {
    use strum::IntoEnumIterator;
    ResourceKind::iter().find_map(|kind| name_from_key(kind, key).map(|name| (kind, name)))
}

pub async fn upsert<T: Serialize>(
    backend: &impl Backend,
    kind: ResourceKind,
    name: &str,
    resource: &T,
    expires: Option<OffsetDateTime>,
) -> GatewayResult<u64> {
    if name.is_empty() {
        return Err(GatewayError::InvalidArgument(format!(
            "{kind} resource needs a name"
        )));
    }
    let value = serde_json::to_vec(resource)
        .map_err(|err| GatewayError::InvalidArgument(format!("{kind} encoding: {err}")))?;
    backend
        .put(&resource_key(kind, name), value, expires)
        .await
        .map_err(Into::into)
}

pub async fn get<T: DeserializeOwned>(
    backend: &impl Backend,
    kind: ResourceKind,
    name: &str,
) -> GatewayResult<T> {
    let item = backend
        .get(&resource_key(kind, name))
        .await
        .map_err(|err| not_found(err, kind, name))?;
    decode(kind, &item.value)
}

pub async fn list<T: DeserializeOwned>(
    backend: &impl Backend,
    kind: ResourceKind,
) -> GatewayResult<Vec<T>> {
    let items = backend
        .range(&format!("/{}/", kind.prefix()))
        .await
        .map_err(GatewayError::from)?;
    items
        .into_iter()
        .map(|item| decode(kind, &item.value))
        .collect()
}

pub async fn remove(backend: &impl Backend, kind: ResourceKind, name: &str) -> GatewayResult<()> {
    backend
        .delete(&resource_key(kind, name))
        .await
        .map_err(|err| not_found(err, kind, name))
}

pub fn decode<T: DeserializeOwned>(kind: ResourceKind, value: &[u8]) -> GatewayResult<T> {
    serde_json::from_slice(value)
        .map_err(|err| GatewayError::InvalidArgument(format!("stored {kind}: {err}")))
}

fn not_found(err: BackendError, kind: ResourceKind, name: &str) -> GatewayError {
    match err {
        BackendError::NotFound(_) => GatewayError::NotFound(format!("{kind} {name:?}")),
        other => other.into(),
    }
}
