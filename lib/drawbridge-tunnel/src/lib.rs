//! The reverse-tunnel fabric.
//!
//! An agent opens one long-lived mTLS control connection per proxy; the
//! proxy later dials back to the agent by opening multiplexed streams over
//! that connection. Control messages (hello, heartbeats, discovery) share
//! the connection with the data streams.

#![deny(unsafe_code)]

pub mod alpn;
pub mod dial;
pub mod frame;
pub mod mux;
pub mod ping;
pub mod retry;

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    #[error("tunnel io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tunnel codec: {0}")]
    Codec(String),

    #[error("tunnel closed")]
    Closed,
}

impl From<TunnelError> for drawbridge_domain::GatewayError {
    fn from(err: TunnelError) -> Self {
        drawbridge_domain::GatewayError::ConnectionProblem(err.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
