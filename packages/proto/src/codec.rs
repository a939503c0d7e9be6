//! KRPC-over-bencode codec (component B, §4.B).
//!
//! DHT messages are stylised bencoded dictionaries, so rather than writing
//! (or depending on) a general bencode parser, the decoder below does what
//! the reference implementation does: bounded-byte-string searches for each
//! well-known key. It is faster and, because every key's layout is fixed,
//! no less correct than a generic parser for this exact wire format.

use byteorder::{BigEndian, ByteOrder};
use std::io::Write as _;

use crate::error::{CodecError, Result};
use crate::id::Id;
use crate::transaction::TID_LEN;

pub const PARSE_TID_LEN: usize = 16;
pub const PARSE_TOKEN_LEN: usize = 128;
pub const PARSE_NODES_LEN: usize = 26 * 16;
pub const PARSE_NODES6_LEN: usize = 38 * 16;
pub const PARSE_VALUES_LEN: usize = 2048;
pub const PARSE_VALUES6_LEN: usize = 2048;

pub const WANT4: u8 = 1;
pub const WANT6: u8 = 2;

/// Classification of a decoded message, mirroring the five request types
/// plus replies and errors (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    Reply,
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

/// Every field a KRPC message might carry. Fields absent from the wire
/// message are `None`/empty; callers only read the fields relevant to the
/// [`MessageKind`] they got back from [`decode`].
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub tid: Vec<u8>,
    pub id: Option<Id>,
    pub info_hash: Option<Id>,
    pub target: Option<Id>,
    pub port: Option<u16>,
    pub implied_port: bool,
    pub token: Option<Vec<u8>>,
    pub nodes: Vec<u8>,
    pub nodes6: Vec<u8>,
    pub values: Vec<u8>,
    pub values6: Vec<u8>,
    pub want: u8,
}

/// Finds the first occurrence of `pattern` in `buf[..search_len]`.
fn find(buf: &[u8], search_len: usize, pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > search_len {
        return None;
    }
    buf[..search_len]
        .windows(pattern.len())
        .position(|w| w == pattern)
}

/// Parses a run of ASCII digits starting at `pos`, returning `(value, pos after digits)`.
fn parse_u64(buf: &[u8], msg_len: usize, mut pos: usize) -> Option<(u64, usize)> {
    let start = pos;
    while pos < msg_len && buf[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == start {
        return None;
    }
    let s = std::str::from_utf8(&buf[start..pos]).ok()?;
    let v: u64 = s.parse().ok()?;
    Some((v, pos))
}

/// Decodes a KRPC message out of `buf`.
///
/// `buf` MUST end with a NUL sentinel byte; the message content is
/// `buf[..buf.len() - 1]`. This lets every bounded scan below stop at a
/// fixed offset without re-deriving the true length at each step, matching
/// the reference decoder, which relies on the same sentinel.
pub fn decode(buf: &[u8]) -> Result<(MessageKind, ParsedMessage)> {
    if buf.last() != Some(&0) {
        return Err(CodecError::Unterminated);
    }
    let msg_len = buf.len() - 1;
    let mut m = ParsedMessage::default();

    if let Some(p) = find(buf, msg_len, b"1:t") {
        if let Some((l, q)) = parse_u64(buf, msg_len, p + 3) {
            if q < msg_len && buf[q] == b':' && l > 0 && (l as usize) < PARSE_TID_LEN {
                let l = l as usize;
                if q + 1 + l <= msg_len {
                    m.tid = buf[q + 1..q + 1 + l].to_vec();
                }
            }
        }
    }

    if let Some(p) = find(buf, msg_len, b"2:id20:") {
        let start = p + 7;
        if start + 20 <= msg_len {
            m.id = Id::from_slice(&buf[start..start + 20]);
        }
    }

    if let Some(p) = find(buf, msg_len, b"9:info_hash20:") {
        let start = p + 14;
        if start + 20 <= msg_len {
            m.info_hash = Id::from_slice(&buf[start..start + 20]);
        }
    }

    if let Some(p) = find(buf, msg_len, b"4:porti") {
        if let Some((l, q)) = parse_u64(buf, msg_len, p + 7) {
            if q < msg_len && buf[q] == b'e' && l > 0 && l < 0x10000 {
                m.port = Some(l as u16);
            }
        }
    }

    if let Some(p) = find(buf, msg_len, b"12:implied_porti") {
        if let Some((l, q)) = parse_u64(buf, msg_len, p + 16) {
            if q < msg_len && buf[q] == b'e' && l > 0 {
                m.implied_port = true;
            }
        }
    }

    if let Some(p) = find(buf, msg_len, b"6:target20:") {
        let start = p + 11;
        if start + 20 <= msg_len {
            m.target = Id::from_slice(&buf[start..start + 20]);
        }
    }

    if let Some(p) = find(buf, msg_len, b"5:token") {
        if let Some((l, q)) = parse_u64(buf, msg_len, p + 7) {
            if q < msg_len && buf[q] == b':' && l > 0 && (l as usize) < PARSE_TOKEN_LEN {
                let l = l as usize;
                if q + 1 + l <= msg_len {
                    m.token = Some(buf[q + 1..q + 1 + l].to_vec());
                }
            }
        }
    }

    if let Some(p) = find(buf, msg_len, b"5:nodes") {
        if let Some((l, q)) = parse_u64(buf, msg_len, p + 7) {
            if q < msg_len && buf[q] == b':' && l > 0 && l as usize <= PARSE_NODES_LEN {
                let l = l as usize;
                if q + 1 + l <= msg_len {
                    m.nodes = buf[q + 1..q + 1 + l].to_vec();
                }
            }
        }
    }

    if let Some(p) = find(buf, msg_len, b"6:nodes6") {
        if let Some((l, q)) = parse_u64(buf, msg_len, p + 8) {
            if q < msg_len && buf[q] == b':' && l > 0 && l as usize <= PARSE_NODES6_LEN {
                let l = l as usize;
                if q + 1 + l <= msg_len {
                    m.nodes6 = buf[q + 1..q + 1 + l].to_vec();
                }
            }
        }
    }

    if let Some(p) = find(buf, msg_len, b"6:valuesl") {
        let mut i = p + 9;
        loop {
            match parse_u64(buf, msg_len, i) {
                Some((l, q)) if q < msg_len && buf[q] == b':' && l > 0 => {
                    let l = l as usize;
                    if q + 1 + l > msg_len {
                        break;
                    }
                    let entry = &buf[q + 1..q + 1 + l];
                    i = q + 1 + l;
                    if l == 6 {
                        if m.values.len() + l <= PARSE_VALUES_LEN {
                            m.values.extend_from_slice(entry);
                        }
                    } else if l == 18 && m.values6.len() + l <= PARSE_VALUES6_LEN {
                        m.values6.extend_from_slice(entry);
                    }
                }
                _ => break,
            }
        }
    }

    if let Some(p) = find(buf, msg_len, b"4:wantl") {
        let mut i = p + 7;
        m.want = 0;
        while i + 1 < msg_len && buf[i] > b'0' && buf[i] <= b'9' && buf[i + 1] == b':' {
            let n = (buf[i] - b'0') as usize;
            if i + 2 + n > msg_len {
                break;
            }
            let entry = &buf[i + 2..i + 2 + n];
            if n == 2 && entry == b"n4" {
                m.want |= WANT4;
            } else if n == 2 && entry == b"n6" {
                m.want |= WANT6;
            }
            i += 2 + n;
        }
    }

    if find(buf, msg_len, b"1:y1:r").is_some() {
        return Ok((MessageKind::Reply, m));
    }
    if find(buf, msg_len, b"1:y1:e").is_some() {
        return Ok((MessageKind::Error, m));
    }
    if find(buf, msg_len, b"1:y1:q").is_none() {
        return Err(CodecError::Unclassifiable);
    }
    if find(buf, msg_len, b"1:q4:ping").is_some() {
        return Ok((MessageKind::Ping, m));
    }
    if find(buf, msg_len, b"1:q9:find_node").is_some() {
        return Ok((MessageKind::FindNode, m));
    }
    if find(buf, msg_len, b"1:q9:get_peers").is_some() {
        return Ok((MessageKind::GetPeers, m));
    }
    if find(buf, msg_len, b"1:q13:announce_peer").is_some() {
        return Ok((MessageKind::AnnouncePeer, m));
    }
    Err(CodecError::Unclassifiable)
}

/// A fixed-layout KRPC encoder writing directly into a caller-supplied
/// buffer, the way the reference implementation's `snprintf`-based senders
/// do; 512 bytes is enough for every message except a combined
/// `nodes`+`values` reply, which needs the full 2048.
pub struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Encoder<'a> {
        buf.clear();
        Encoder { buf }
    }

    fn raw(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn bytes_field(&mut self, bytes: &[u8]) {
        write!(self.buf, "{}:", bytes.len()).unwrap();
        self.buf.extend_from_slice(bytes);
    }

    fn client_tag(&mut self, client_tag: Option<&[u8; 4]>) {
        if let Some(tag) = client_tag {
            self.raw("1:v4:");
            self.buf.extend_from_slice(tag);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.clone()
    }
}

/// `d1:ad2:id20:<id>e1:q4:ping1:t<n>:<tid>[1:v4:<tag>]1:y1:qe`
pub fn encode_ping(my_id: &Id, tid: &[u8], client_tag: Option<&[u8; 4]>, out: &mut Vec<u8>) {
    let mut e = Encoder::new(out);
    e.raw("d1:ad2:id20:");
    e.buf.extend_from_slice(my_id.as_bytes());
    e.raw("e1:q4:ping1:t");
    e.bytes_field(tid);
    e.client_tag(client_tag);
    e.raw("1:y1:qe");
}

/// `d1:rd2:id20:<id>e1:t<n>:<tid>[1:v...]1:y1:re`
pub fn encode_pong(my_id: &Id, tid: &[u8], client_tag: Option<&[u8; 4]>, out: &mut Vec<u8>) {
    let mut e = Encoder::new(out);
    e.raw("d1:rd2:id20:");
    e.buf.extend_from_slice(my_id.as_bytes());
    e.raw("e1:t");
    e.bytes_field(tid);
    e.client_tag(client_tag);
    e.raw("1:y1:re");
}

pub fn encode_find_node(
    my_id: &Id,
    tid: &[u8],
    target: &Id,
    want: Option<u8>,
    client_tag: Option<&[u8; 4]>,
    out: &mut Vec<u8>,
) {
    let mut e = Encoder::new(out);
    e.raw("d1:ad2:id20:");
    e.buf.extend_from_slice(my_id.as_bytes());
    e.raw("6:target20:");
    e.buf.extend_from_slice(target.as_bytes());
    if let Some(want) = want {
        if want != 0 {
            e.raw("4:wantl");
            if want & WANT4 != 0 {
                e.raw("2:n4");
            }
            if want & WANT6 != 0 {
                e.raw("2:n6");
            }
            e.raw("e");
        }
    }
    e.raw("e1:q9:find_node1:t");
    e.bytes_field(tid);
    e.client_tag(client_tag);
    e.raw("1:y1:qe");
}

pub fn encode_get_peers(
    my_id: &Id,
    tid: &[u8],
    info_hash: &Id,
    client_tag: Option<&[u8; 4]>,
    out: &mut Vec<u8>,
) {
    let mut e = Encoder::new(out);
    e.raw("d1:ad2:id20:");
    e.buf.extend_from_slice(my_id.as_bytes());
    e.raw("9:info_hash20:");
    e.buf.extend_from_slice(info_hash.as_bytes());
    e.raw("e1:q9:get_peers1:t");
    e.bytes_field(tid);
    e.client_tag(client_tag);
    e.raw("1:y1:qe");
}

#[allow(clippy::too_many_arguments)]
pub fn encode_announce_peer(
    my_id: &Id,
    tid: &[u8],
    info_hash: &Id,
    port: u16,
    implied_port: bool,
    token: &[u8],
    client_tag: Option<&[u8; 4]>,
    out: &mut Vec<u8>,
) {
    let mut e = Encoder::new(out);
    e.raw("d1:ad2:id20:");
    e.buf.extend_from_slice(my_id.as_bytes());
    write!(e.buf, "12:implied_porti{}e", if implied_port { 1 } else { 0 }).unwrap();
    e.raw("9:info_hash20:");
    e.buf.extend_from_slice(info_hash.as_bytes());
    write!(e.buf, "4:porti{}e", port).unwrap();
    e.raw("5:token");
    e.bytes_field(token);
    e.raw("e1:q13:announce_peer1:t");
    e.bytes_field(tid);
    e.client_tag(client_tag);
    e.raw("1:y1:qe");
}

/// The `r` reply to `find_node`/`get_peers`: compact node lists, an
/// optional token, and an optional `values` list, all pre-encoded by the
/// caller (routing table / storage already produced the compact bytes).
pub struct ClosestNodesReply<'a> {
    pub my_id: &'a Id,
    pub nodes: &'a [u8],
    pub nodes6: &'a [u8],
    pub token: Option<&'a [u8]>,
    pub values: &'a [&'a [u8]],
    pub tid: &'a [u8],
    pub client_tag: Option<&'a [u8; 4]>,
}

pub fn encode_closest_nodes(reply: &ClosestNodesReply, out: &mut Vec<u8>) {
    let mut e = Encoder::new(out);
    e.raw("d1:rd2:id20:");
    e.buf.extend_from_slice(reply.my_id.as_bytes());
    if !reply.nodes.is_empty() {
        e.raw("5:nodes");
        e.bytes_field(reply.nodes);
    }
    if !reply.nodes6.is_empty() {
        e.raw("6:nodes6");
        e.bytes_field(reply.nodes6);
    }
    if let Some(token) = reply.token {
        if !token.is_empty() {
            e.raw("5:token");
            e.bytes_field(token);
        }
    }
    if !reply.values.is_empty() {
        e.raw("6:valuesl");
        for v in reply.values {
            e.bytes_field(v);
        }
        e.raw("e");
    }
    e.raw("e1:t");
    e.bytes_field(reply.tid);
    e.client_tag(reply.client_tag);
    e.raw("1:y1:re");
}

pub fn encode_peer_announced(
    my_id: &Id,
    tid: &[u8],
    client_tag: Option<&[u8; 4]>,
    out: &mut Vec<u8>,
) {
    encode_pong(my_id, tid, client_tag, out)
}

pub fn encode_error(code: u16, message: &str, tid: &[u8], out: &mut Vec<u8>) {
    let mut e = Encoder::new(out);
    write!(e.buf, "d1:eli{}e{}:{}e1:t", code, message.len(), message).unwrap();
    e.bytes_field(tid);
    e.raw("1:y1:ee");
}

pub const fn tid_len_ok(tid: &[u8]) -> bool {
    tid.len() == TID_LEN
}

/// Splits `buf.nodes`/`buf.nodes6` into compact-node chunks, silently
/// dropping any residual bytes that don't form a whole chunk: this should
/// never happen once the caller has verified the length is a multiple of
/// the chunk size (§4.I protocol-violation policy).
pub fn decode_node_infos_v4(nodes: &[u8]) -> impl Iterator<Item = crate::addr::NodeInfo> + '_ {
    crate::addr::chunks_of(nodes, crate::addr::NODE4_LEN)
        .filter_map(crate::addr::NodeInfo::decode_v4)
}

pub fn decode_node_infos_v6(nodes6: &[u8]) -> impl Iterator<Item = crate::addr::NodeInfo> + '_ {
    crate::addr::chunks_of(nodes6, crate::addr::NODE6_LEN)
        .filter_map(crate::addr::NodeInfo::decode_v6)
}

pub fn decode_values_v4(values: &[u8]) -> impl Iterator<Item = std::net::SocketAddr> + '_ {
    crate::addr::chunks_of(values, crate::addr::VALUE4_LEN)
        .filter_map(crate::addr::decode_peer_v4)
}

pub fn decode_values_v6(values6: &[u8]) -> impl Iterator<Item = std::net::SocketAddr> + '_ {
    crate::addr::chunks_of(values6, crate::addr::VALUE6_LEN)
        .filter_map(crate::addr::decode_peer_v6)
}

pub fn port_from_be_bytes(bytes: &[u8]) -> u16 {
    BigEndian::read_u16(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::NodeInfo;
    use proptest::prelude::*;
    use std::net::SocketAddr;

    fn terminated(mut v: Vec<u8>) -> Vec<u8> {
        v.push(0);
        v
    }

    #[test]
    fn rejects_unterminated_buffer() {
        let buf = b"d1:y1:qe".to_vec();
        assert_eq!(decode(&buf).unwrap_err(), CodecError::Unterminated);
    }

    #[test]
    fn ping_query_round_trips() {
        let my_id = Id::from_bytes([1u8; 20]);
        let tid = [b'p', b'n', 0, 1];
        let mut buf = Vec::new();
        encode_ping(&my_id, &tid, None, &mut buf);
        let (kind, m) = decode(&terminated(buf)).unwrap();
        assert_eq!(kind, MessageKind::Ping);
        assert_eq!(m.id, Some(my_id));
        assert_eq!(m.tid, tid);
    }

    #[test]
    fn pong_reply_round_trips() {
        let my_id = Id::from_bytes([2u8; 20]);
        let tid = [b'p', b'n', 0, 0];
        let mut buf = Vec::new();
        encode_pong(&my_id, &tid, Some(b"rsdh"), &mut buf);
        let (kind, m) = decode(&terminated(buf)).unwrap();
        assert_eq!(kind, MessageKind::Reply);
        assert_eq!(m.id, Some(my_id));
    }

    #[test]
    fn find_node_with_want_round_trips() {
        let my_id = Id::from_bytes([3u8; 20]);
        let target = Id::from_bytes([4u8; 20]);
        let tid = [b'f', b'n', 0, 0];
        let mut buf = Vec::new();
        encode_find_node(&my_id, &tid, &target, Some(WANT4 | WANT6), None, &mut buf);
        let (kind, m) = decode(&terminated(buf)).unwrap();
        assert_eq!(kind, MessageKind::FindNode);
        assert_eq!(m.target, Some(target));
        assert_eq!(m.want, WANT4 | WANT6);
    }

    #[test]
    fn get_peers_round_trips() {
        let my_id = Id::from_bytes([5u8; 20]);
        let info_hash = Id::from_bytes([6u8; 20]);
        let tid = [b'g', b'p', 0, 9];
        let mut buf = Vec::new();
        encode_get_peers(&my_id, &tid, &info_hash, None, &mut buf);
        let (kind, m) = decode(&terminated(buf)).unwrap();
        assert_eq!(kind, MessageKind::GetPeers);
        assert_eq!(m.info_hash, Some(info_hash));
    }

    #[test]
    fn announce_peer_round_trips() {
        let my_id = Id::from_bytes([7u8; 20]);
        let info_hash = Id::from_bytes([8u8; 20]);
        let tid = [b'a', b'p', 0, 0];
        let token = b"sometoken";
        let mut buf = Vec::new();
        encode_announce_peer(&my_id, &tid, &info_hash, 6881, true, token, None, &mut buf);
        let (kind, m) = decode(&terminated(buf)).unwrap();
        assert_eq!(kind, MessageKind::AnnouncePeer);
        assert_eq!(m.info_hash, Some(info_hash));
        assert_eq!(m.port, Some(6881));
        assert!(m.implied_port);
        assert_eq!(m.token.as_deref(), Some(token.as_ref()));
    }

    #[test]
    fn closest_nodes_reply_carries_nodes_token_and_values() {
        let my_id = Id::from_bytes([9u8; 20]);
        let node = NodeInfo::new(
            Id::from_bytes([10u8; 20]),
            "9.9.9.9:6881".parse::<SocketAddr>().unwrap(),
        );
        let mut nodes_buf = Vec::new();
        node.encode(&mut nodes_buf);
        let value: SocketAddr = "1.1.1.1:80".parse().unwrap();
        let mut value_buf = Vec::new();
        crate::addr::encode_peer(&value, &mut value_buf);
        let tid = [b'g', b'p', 1, 0];
        let mut buf = Vec::new();
        encode_closest_nodes(
            &ClosestNodesReply {
                my_id: &my_id,
                nodes: &nodes_buf,
                nodes6: &[],
                token: Some(b"tok"),
                values: &[&value_buf],
                tid: &tid,
                client_tag: None,
            },
            &mut buf,
        );
        let (kind, m) = decode(&terminated(buf)).unwrap();
        assert_eq!(kind, MessageKind::Reply);
        assert_eq!(m.nodes.len(), crate::addr::NODE4_LEN);
        assert_eq!(m.token.as_deref(), Some(b"tok".as_ref()));
        assert_eq!(m.values.len(), crate::addr::VALUE4_LEN);
        let decoded_node = decode_node_infos_v4(&m.nodes).next().unwrap();
        assert_eq!(decoded_node, node);
    }

    #[test]
    fn classifies_error_messages() {
        let tid = [0u8; 4];
        let mut buf = Vec::new();
        encode_error(203, "bad token", &tid, &mut buf);
        let (kind, _m) = decode(&terminated(buf)).unwrap();
        assert_eq!(kind, MessageKind::Error);
    }

    #[test]
    fn unrecognized_y_type_is_unparseable() {
        let buf = b"d1:y1:ze".to_vec();
        assert_eq!(
            decode(&terminated(buf)).unwrap_err(),
            CodecError::Unclassifiable
        );
    }

    #[test]
    fn clips_oversized_token_field() {
        // token length field claims PARSE_TOKEN_LEN exactly, which the
        // decoder must reject (strict `<`, matching the reference).
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d1:y1:re1:rd2:id20:");
        buf.extend_from_slice(&[1u8; 20]);
        buf.extend_from_slice(format!("5:token{}:", PARSE_TOKEN_LEN).as_bytes());
        buf.extend_from_slice(&[b'x'; PARSE_TOKEN_LEN]);
        buf.extend_from_slice(b"ee");
        let (_, m) = decode(&terminated(buf)).unwrap();
        assert!(m.token.is_none());
    }

    proptest::proptest! {
        /// §8 invariant 8: encoding then decoding a `ping` or `find_node`
        /// query preserves the semantically significant fields for any
        /// id/tid/target the caller hands in.
        #[test]
        fn ping_round_trips_for_arbitrary_ids(
            id_bytes in proptest::collection::vec(any::<u8>(), 20..=20),
            tid_seq in any::<u16>(),
        ) {
            let my_id = Id::from_slice(&id_bytes).unwrap();
            let tid = transaction_tid(tid_seq);
            let mut buf = Vec::new();
            encode_ping(&my_id, &tid, None, &mut buf);
            let (kind, m) = decode(&terminated(buf)).unwrap();
            proptest::prop_assert_eq!(kind, MessageKind::Ping);
            proptest::prop_assert_eq!(m.id, Some(my_id));
            proptest::prop_assert_eq!(&m.tid[..], &tid[..]);
        }

        #[test]
        fn find_node_round_trips_for_arbitrary_target(
            id_bytes in proptest::collection::vec(any::<u8>(), 20..=20),
            target_bytes in proptest::collection::vec(any::<u8>(), 20..=20),
            tid_seq in any::<u16>(),
        ) {
            let my_id = Id::from_slice(&id_bytes).unwrap();
            let target = Id::from_slice(&target_bytes).unwrap();
            let tid = transaction_tid(tid_seq);
            let mut buf = Vec::new();
            encode_find_node(&my_id, &tid, &target, None, None, &mut buf);
            let (kind, m) = decode(&terminated(buf)).unwrap();
            proptest::prop_assert_eq!(kind, MessageKind::FindNode);
            proptest::prop_assert_eq!(m.id, Some(my_id));
            proptest::prop_assert_eq!(m.target, Some(target));
        }
    }

    fn transaction_tid(seq: u16) -> [u8; 4] {
        let seq_bytes = seq.to_ne_bytes();
        [b'p', b'n', seq_bytes[0], seq_bytes[1]]
    }
}
