//! NetBIOS node status lookup (UDP 137), used to find a server's own name.

use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

const NETBIOS_NAME_PORT: u16 = 137;
const NBSTAT: u16 = 0x0021;
const CLASS_IN: u16 = 0x0001;
const GROUP_NAME: u16 = 0x8000;
const SUFFIX_FILE_SERVER: u8 = 0x20;
const SUFFIX_WORKSTATION: u8 = 0x00;

/// Name the server answers to, or `None` when the lookup fails.
///
/// Literal IP addresses are used as-is by the caller, so no lookup is
/// attempted for them.
pub fn resolve_server_name(host: &str, timeout: Duration) -> Option<String> {
    if host.parse::<IpAddr>().is_ok() {
        return None;
    }
    match query_node_status(host, timeout) {
        Ok(name) => name,
        Err(e) => {
            warn!("NetBIOS name lookup for {} failed: {}", host, e);
            None
        }
    }
}

fn query_node_status(host: &str, timeout: Duration) -> std::io::Result<Option<String>> {
    let addr = (host, NETBIOS_NAME_PORT)
        .to_socket_addrs()?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no IPv4 address for host")
        })?;

    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_read_timeout(Some(timeout))?;
    let transaction_id = std::process::id() as u16;
    socket.send_to(&node_status_request(transaction_id), addr)?;

    let mut response = [0u8; 1024];
    let (len, _) = socket.recv_from(&mut response)?;
    let name = parse_node_status(&response[..len], transaction_id);
    debug!("NetBIOS node status of {}: {:?}", host, name);
    Ok(name)
}

/// Wildcard (`*`) node status request.
pub fn node_status_request(transaction_id: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(50);
    buf.put_u16(transaction_id);
    buf.put_u16(0); // Flags: query
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_slice(&encode_name(b"*"));
    buf.put_u16(NBSTAT);
    buf.put_u16(CLASS_IN);
    buf.to_vec()
}

/// First-level encoding of a 16-byte NetBIOS name.
fn encode_name(name: &[u8]) -> Vec<u8> {
    let mut padded = [0u8; 16];
    let len = name.len().min(16);
    padded[..len].copy_from_slice(&name[..len]);

    let mut out = Vec::with_capacity(34);
    out.push(32);
    for byte in padded {
        out.push(b'A' + (byte >> 4));
        out.push(b'A' + (byte & 0x0F));
    }
    out.push(0);
    out
}

/// Preferred unique name from a node status response.
pub fn parse_node_status(response: &[u8], transaction_id: u16) -> Option<String> {
    let mut buf = response;
    if buf.remaining() < 12 || buf.get_u16() != transaction_id {
        return None;
    }
    buf.advance(10);

    // Answer name: a 32-byte label or a compression pointer.
    let first = *buf.first()?;
    match first {
        32 if buf.remaining() >= 34 => buf.advance(34),
        b if b & 0xC0 == 0xC0 && buf.remaining() >= 2 => buf.advance(2),
        _ => return None,
    }
    if buf.remaining() < 11 {
        return None;
    }
    let rr_type = buf.get_u16();
    buf.advance(2 + 4 + 2); // class, TTL, RDLENGTH
    if rr_type != NBSTAT {
        return None;
    }

    let count = buf.get_u8() as usize;
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 18 {
            break;
        }
        let mut raw = [0u8; 15];
        buf.copy_to_slice(&mut raw);
        let suffix = buf.get_u8();
        let flags = buf.get_u16();
        if flags & GROUP_NAME != 0 {
            continue;
        }
        let name = String::from_utf8_lossy(&raw).trim_end().to_string();
        if !name.is_empty() {
            names.push((suffix, name));
        }
    }

    names
        .iter()
        .find(|(suffix, _)| *suffix == SUFFIX_FILE_SERVER)
        .or_else(|| names.iter().find(|(suffix, _)| *suffix == SUFFIX_WORKSTATION))
        .map(|(_, name)| name.clone())
}
