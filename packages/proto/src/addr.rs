//! Compact node-info and peer-value encodings (BEP-5 / BEP-32, §6).

use byteorder::{BigEndian, ByteOrder};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::id::Id;

pub const NODE4_LEN: usize = 26; // 20 (id) + 4 (ip) + 2 (port)
pub const NODE6_LEN: usize = 38; // 20 (id) + 16 (ip) + 2 (port)
pub const VALUE4_LEN: usize = 6;
pub const VALUE6_LEN: usize = 18;

/// A node's identity plus the address it's reachable at. Address family is
/// implied by the variant, never carried separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: Id,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(id: Id, addr: SocketAddr) -> NodeInfo {
        NodeInfo { id, addr }
    }

    pub fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Appends this node's compact encoding (26 or 38 bytes) to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());
        match self.addr {
            SocketAddr::V4(sa) => {
                out.extend_from_slice(&sa.ip().octets());
                let mut port = [0u8; 2];
                BigEndian::write_u16(&mut port, sa.port());
                out.extend_from_slice(&port);
            }
            SocketAddr::V6(sa) => {
                out.extend_from_slice(&sa.ip().octets());
                let mut port = [0u8; 2];
                BigEndian::write_u16(&mut port, sa.port());
                out.extend_from_slice(&port);
            }
        }
    }

    pub fn decode_v4(chunk: &[u8]) -> Option<NodeInfo> {
        if chunk.len() != NODE4_LEN {
            return None;
        }
        let id = Id::from_slice(&chunk[0..20])?;
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = BigEndian::read_u16(&chunk[24..26]);
        Some(NodeInfo::new(id, SocketAddr::V4(SocketAddrV4::new(ip, port))))
    }

    pub fn decode_v6(chunk: &[u8]) -> Option<NodeInfo> {
        if chunk.len() != NODE6_LEN {
            return None;
        }
        let id = Id::from_slice(&chunk[0..20])?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&chunk[20..36]);
        let ip = Ipv6Addr::from(octets);
        let port = BigEndian::read_u16(&chunk[36..38]);
        Some(NodeInfo::new(
            id,
            SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)),
        ))
    }
}

/// Splits a `nodes`/`nodes6` blob into fixed-size chunks, discarding any
/// trailing partial chunk (the caller already validated the total length is
/// a multiple of the chunk size; this is the defensive fallback).
pub fn chunks_of(buf: &[u8], chunk_len: usize) -> impl Iterator<Item = &[u8]> {
    buf.chunks_exact(chunk_len)
}

/// Encodes a bare peer address (no node id) for the `values` list.
pub fn encode_peer(addr: &SocketAddr, out: &mut Vec<u8>) {
    match addr {
        SocketAddr::V4(sa) => {
            out.extend_from_slice(&sa.ip().octets());
            let mut port = [0u8; 2];
            BigEndian::write_u16(&mut port, sa.port());
            out.extend_from_slice(&port);
        }
        SocketAddr::V6(sa) => {
            out.extend_from_slice(&sa.ip().octets());
            let mut port = [0u8; 2];
            BigEndian::write_u16(&mut port, sa.port());
            out.extend_from_slice(&port);
        }
    }
}

pub fn decode_peer_v4(chunk: &[u8]) -> Option<SocketAddr> {
    if chunk.len() != VALUE4_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = BigEndian::read_u16(&chunk[4..6]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

pub fn decode_peer_v6(chunk: &[u8]) -> Option<SocketAddr> {
    if chunk.len() != VALUE6_LEN {
        return None;
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&chunk[0..16]);
    let ip = Ipv6Addr::from(octets);
    let port = BigEndian::read_u16(&chunk[16..18]);
    Some(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
}
