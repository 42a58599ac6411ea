//! The dial preamble spoken at the head of a freshly-opened tunnel stream.
//!
//! The proxy writes one request telling the agent where the stream should
//! land; everything after it is raw payload.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use drawbridge_domain::resource::ConnectionType;

use crate::{TunnelError, TunnelResult};

const MAX_REQUEST: u32 = 64 * 1024;

/// Sentinel target for the agent-opened stream that carries the inventory
/// control channel up to the control plane.
pub const INVENTORY_TARGET: &str = "@inventory";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct DialRequest {
    /// `host:port` the agent should connect to, or the local-node sentinel
    pub target: String,
    pub conn_type: ConnectionType,
    /// SSH principal set acceptable to the target host
    #[serde(default)]
    pub principals: Vec<String>,
    /// Observed client address, for audit purposes
    #[serde(default)]
    pub client_addr: Option<String>,
}

pub async fn write_request<S>(stream: &mut S, request: &DialRequest) -> TunnelResult<()>
where
    S: AsyncWrite + Unpin,
{
    let payload =
        serde_json::to_vec(request).map_err(|err| TunnelError::Codec(err.to_string()))?;
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_request<S>(stream: &mut S) -> TunnelResult<DialRequest>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await?;
    if len > MAX_REQUEST {
        return Err(TunnelError::Codec(format!("dial request of {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|err| TunnelError::Codec(err.to_string()))
}
