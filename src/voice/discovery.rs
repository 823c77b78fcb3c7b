//! UDP IP discovery: learn the external address the voice server sees us as.

use std::{io::Cursor, net::SocketAddr, time::Duration};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio::net::UdpSocket;

use crate::common::errors::NodeError;

pub const DISCOVERY_PACKET_LEN: usize = 74;

const REQUEST_TYPE: u16 = 0x1;
const RESPONSE_TYPE: u16 = 0x2;
/// Length field: everything after type and length.
const BODY_LEN: u16 = 70;

pub fn build_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    let mut w = Cursor::new(&mut packet[..]);
    // Writes into a fixed 74-byte buffer cannot run out of room.
    let _ = w.write_u16::<BigEndian>(REQUEST_TYPE);
    let _ = w.write_u16::<BigEndian>(BODY_LEN);
    let _ = w.write_u32::<BigEndian>(ssrc);
    packet
}

/// Address and port from a discovery response.
pub fn parse_response(buf: &[u8]) -> Result<(String, u16), NodeError> {
    if buf.len() < DISCOVERY_PACKET_LEN {
        return Err(NodeError::Transport(format!(
            "malformed ip discovery response ({} bytes)",
            buf.len()
        )));
    }
    let kind = Cursor::new(buf).read_u16::<BigEndian>()?;
    if kind != RESPONSE_TYPE {
        return Err(NodeError::Transport(format!(
            "unexpected ip discovery packet type {:#x}",
            kind
        )));
    }

    let raw = &buf[8..72];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let address = std::str::from_utf8(&raw[..end])
        .map_err(|e| NodeError::Transport(format!("ip discovery address: {}", e)))?
        .to_string();
    if address.is_empty() {
        return Err(NodeError::Transport("ip discovery returned no address".into()));
    }
    let port = Cursor::new(&buf[72..]).read_u16::<BigEndian>()?;
    Ok((address, port))
}

pub async fn discover_ip(
    socket: &UdpSocket,
    remote: SocketAddr,
    ssrc: u32,
    timeout: Duration,
) -> Result<(String, u16), NodeError> {
    socket.send_to(&build_request(ssrc), remote).await?;

    let mut buf = [0u8; DISCOVERY_PACKET_LEN];
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => parse_response(&buf[..n]),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(NodeError::SignalingTimeout),
    }
}
