//! The ALPN protocol registry spoken on the multi-protocol proxy port.

pub const PROXY_SSH: &str = "teleport-proxy-ssh";
pub const REVERSE_TUNNEL: &str = "teleport-reverse-tunnel";
pub const POSTGRES: &str = "teleport-postgres";
pub const MYSQL: &str = "teleport-mysql";
pub const MONGODB: &str = "teleport-mongodb";
pub const TCP: &str = "teleport-tcp";
pub const HTTP2: &str = "h2";
pub const HTTP11: &str = "http/1.1";

/// Suffix marking a protocol variant wrapped in ping framing
pub const PING_SUFFIX: &str = "-ping";

/// Every protocol the proxy port advertises, ping variants included
pub fn registry() -> Vec<Vec<u8>> {
    let base = [PROXY_SSH, REVERSE_TUNNEL, POSTGRES, MYSQL, MONGODB, TCP];

    let mut protocols: Vec<Vec<u8>> = base
        .iter()
        .flat_map(|proto| [with_ping(proto).into_bytes(), proto.as_bytes().to_vec()])
        .collect();
    protocols.push(HTTP2.as_bytes().to_vec());
    protocols.push(HTTP11.as_bytes().to_vec());
    protocols
}

pub fn with_ping(proto: &str) -> String {
    format!("{proto}{PING_SUFFIX}")
}

pub fn is_ping(proto: &str) -> bool {
    proto.ends_with(PING_SUFFIX)
}

/// The protocol with any ping suffix removed
pub fn strip_ping(proto: &str) -> &str {
    proto.strip_suffix(PING_SUFFIX).unwrap_or(proto)
}
