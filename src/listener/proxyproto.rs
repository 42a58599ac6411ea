//! PROXY protocol v1/v2 parsing for the outermost listener. When enabled,
//! the advertised client address replaces the socket peer for all
//! downstream logic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use drawbridge_domain::{GatewayError, GatewayResult};
use tokio::io::{AsyncRead, AsyncReadExt};

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
const V1_MAX_LINE: usize = 107;

/// Consume the PROXY header and return the real client address.
/// `None` means the sender declared a LOCAL/unknown connection.
pub async fn read_proxy_header<S>(stream: &mut S) -> GatewayResult<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 6];
    stream.read_exact(&mut prefix).await?;

    if &prefix == b"PROXY " {
        return read_v1(stream).await;
    }
    if prefix == V2_SIGNATURE[..6] {
        let mut rest = [0u8; 6];
        stream.read_exact(&mut rest).await?;
        if rest != V2_SIGNATURE[6..] {
            return Err(GatewayError::InvalidArgument(
                "malformed proxy protocol v2 signature".to_string(),
            ));
        }
        return read_v2(stream).await;
    }

    Err(GatewayError::InvalidArgument(
        "expected a proxy protocol header".to_string(),
    ))
}

async fn read_v1<S>(stream: &mut S) -> GatewayResult<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    // the rest of the line, byte at a time up to the bounded length
    let mut line = Vec::with_capacity(V1_MAX_LINE);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > V1_MAX_LINE {
            return Err(GatewayError::InvalidArgument(
                "proxy protocol v1 line too long".to_string(),
            ));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    let line = String::from_utf8(line)
        .map_err(|_| GatewayError::InvalidArgument("proxy protocol v1 line".to_string()))?;
    let mut parts = line.split(' ');

    match parts.next() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => return Ok(None),
        other => {
            return Err(GatewayError::InvalidArgument(format!(
                "proxy protocol family {other:?}"
            )))
        }
    }

    let src_ip: IpAddr = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| GatewayError::InvalidArgument("proxy protocol source ip".to_string()))?;
    let _dst_ip = parts.next();
    let src_port: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| GatewayError::InvalidArgument("proxy protocol source port".to_string()))?;

    Ok(Some(SocketAddr::new(src_ip, src_port)))
}

async fn read_v2<S>(stream: &mut S) -> GatewayResult<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    let ver_cmd = stream.read_u8().await?;
    if ver_cmd >> 4 != 0x2 {
        return Err(GatewayError::InvalidArgument(
            "proxy protocol v2 version".to_string(),
        ));
    }
    let family = stream.read_u8().await?;
    let len = stream.read_u16().await? as usize;

    let mut addresses = vec![0u8; len];
    stream.read_exact(&mut addresses).await?;

    // LOCAL command: addresses are to be ignored
    if ver_cmd & 0x0F == 0 {
        return Ok(None);
    }

    match family >> 4 {
        // AF_INET
        0x1 if len >= 12 => {
            let src = Ipv4Addr::new(addresses[0], addresses[1], addresses[2], addresses[3]);
            let port = u16::from_be_bytes([addresses[8], addresses[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(src), port)))
        }
        // AF_INET6
        0x2 if len >= 36 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addresses[..16]);
            let port = u16::from_be_bytes([addresses[32], addresses[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        _ => Ok(None),
    }
}
