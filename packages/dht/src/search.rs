//! Iterative lookup state machine (§4.G): a sorted set of up to
//! `search_nodes` candidates per target, retransmission, and an optional
//! announce phase once the closest live nodes have replied.

use std::cmp::Ordering;
use std::net::SocketAddr;

use krpc_proto::Id;

/// A candidate in a search's sorted-by-distance node set (§3 `SearchNode`).
#[derive(Debug, Clone)]
pub struct SearchNode {
    pub id: Id,
    pub addr: SocketAddr,
    pub request_time: Option<u64>,
    pub reply_time: Option<u64>,
    pub pinged: u32,
    pub replied: bool,
    pub acked: bool,
    pub token: Vec<u8>,
}

impl SearchNode {
    fn new(id: Id, addr: SocketAddr) -> SearchNode {
        SearchNode {
            id,
            addr,
            request_time: None,
            reply_time: None,
            pinged: 0,
            replied: false,
            acked: false,
            token: Vec::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.pinged < 3
    }
}

/// A query [`Search::step`] wants the caller to actually send: the search
/// only tracks candidate state, it has no access to sockets or the wire
/// codec, so it hands back intent and lets the engine encode/send/update
/// the routing table.
#[derive(Debug, Clone)]
pub enum SearchQuery {
    GetPeers { addr: SocketAddr, node_id: Id, confirmed: bool },
    AnnouncePeer { addr: SocketAddr, node_id: Id, token: Vec<u8>, confirmed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Pending,
    Done,
}

/// A `SearchNode` token is opaque but bounded (§3 Data Model); tokens past
/// this length are discarded rather than stored, matching the reference's
/// `insert_search_node` (`token_len >= 40` is rejected).
const MAX_SEARCH_TOKEN_LEN: usize = 40;

pub struct Search {
    pub tid: u16,
    pub target: Id,
    pub is_v4: bool,
    /// `None` is a pure lookup; `Some(port)` requests an announce phase.
    pub port: Option<u16>,
    pub nodes: Vec<SearchNode>,
    pub done: bool,
    pub step_time: u64,
}

impl Search {
    pub fn new(tid: u16, target: Id, is_v4: bool, port: Option<u16>, now: u64) -> Search {
        Search {
            tid,
            target,
            is_v4,
            port,
            nodes: Vec::new(),
            done: false,
            step_time: now,
        }
    }

    /// Clears per-node progress (but keeps the TID, so replies to the old
    /// wave still merge in) for a duplicate `search()` call on the same
    /// target (§4.G step 2). Drops nodes that are too doubtful to keep
    /// chasing (pinged out, or stale reply) before resetting the rest.
    pub fn reset_progress(&mut self, now: u64) {
        self.done = false;
        self.step_time = now;
        self.nodes.retain(|n| {
            n.pinged < 3 && now.saturating_sub(n.reply_time.unwrap_or(0)) < 7200
        });
        for n in &mut self.nodes {
            n.pinged = 0;
            n.replied = false;
            n.acked = false;
            n.token.clear();
            n.request_time = None;
        }
    }

    /// Inserts or refreshes a candidate, keeping `nodes` sorted by
    /// XOR-distance to `target` and truncated at `max_nodes`. Returns
    /// `false` only when the set is already full and `id` is farther from
    /// `target` than every resident (§4.G "sorted candidate set").
    pub fn insert_node(
        &mut self,
        id: Id,
        addr: SocketAddr,
        replied: bool,
        token: Option<&[u8]>,
        now: u64,
        max_nodes: usize,
    ) -> bool {
        let mut insert_at = self.nodes.len();
        for (i, n) in self.nodes.iter().enumerate() {
            if n.id == id {
                let n = &mut self.nodes[i];
                n.addr = addr;
                if replied {
                    n.replied = true;
                    n.reply_time = Some(now);
                    n.request_time = None;
                    n.pinged = 0;
                }
                if let Some(t) = token {
                    if t.len() <= MAX_SEARCH_TOKEN_LEN {
                        n.token = t.to_vec();
                    }
                }
                return true;
            }
            if id.xor_cmp(&n.id, &self.target) == Ordering::Less {
                insert_at = i;
                break;
            }
        }
        let full = self.nodes.len() >= max_nodes;
        if insert_at == self.nodes.len() && full {
            return false;
        }
        let mut node = SearchNode::new(id, addr);
        if replied {
            node.replied = true;
            node.reply_time = Some(now);
        }
        if let Some(t) = token {
            if t.len() <= MAX_SEARCH_TOKEN_LEN {
                node.token = t.to_vec();
            }
        }
        self.nodes.insert(insert_at, node);
        self.nodes.truncate(max_nodes);
        true
    }

    pub fn remove_node(&mut self, id: &Id) {
        self.nodes.retain(|n| &n.id != id);
    }

    /// Attempts a `get_peers` to one candidate; mirrors
    /// `search_send_get_peers`'s per-node admission check.
    fn try_get_peers(&mut self, idx: usize, now: u64, retransmit_secs: u64) -> Option<SearchQuery> {
        let n = &mut self.nodes[idx];
        if n.pinged >= 3 || n.replied {
            return None;
        }
        if n.request_time.map(|t| now.saturating_sub(t) < retransmit_secs).unwrap_or(false) {
            return None;
        }
        let confirmed = n.reply_time.map(|t| now.saturating_sub(t) < retransmit_secs).unwrap_or(false);
        n.pinged += 1;
        n.request_time = Some(now);
        Some(SearchQuery::GetPeers { addr: n.addr, node_id: n.id, confirmed })
    }

    /// Offers a `get_peers` to `id` right away, outside the normal step
    /// cadence, for a node just learned while this search is incomplete
    /// (the reference's `add_search_node`).
    pub fn offer_node(&mut self, id: Id, addr: SocketAddr, now: u64, retransmit_secs: u64, max_nodes: usize) -> Option<SearchQuery> {
        if self.nodes.len() >= max_nodes || self.done {
            return None;
        }
        if !self.insert_node(id, addr, false, None, now, max_nodes) {
            return None;
        }
        let idx = self.nodes.iter().position(|n| n.id == id)?;
        self.try_get_peers(idx, now, retransmit_secs)
    }

    fn first_live_replied(&self, window: usize) -> bool {
        let mut seen = 0;
        for n in &self.nodes {
            if seen >= window {
                break;
            }
            if !n.is_live() {
                continue;
            }
            if !n.replied {
                return false;
            }
            seen += 1;
        }
        true
    }

    /// Advances the search one tick. Returns the queries to send (if any)
    /// and whether this step transitioned the search to done.
    pub fn step(&mut self, now: u64, retransmit_secs: u64, inflight_queries: usize) -> (Vec<SearchQuery>, StepOutcome) {
        if self.done {
            return (Vec::new(), StepOutcome::Done);
        }

        let all_done = self.first_live_replied(8);

        if all_done {
            let outcome = match self.port {
                None => {
                    self.done = true;
                    StepOutcome::Done
                }
                Some(port) => {
                    let mut queries = Vec::new();
                    let mut all_acked = true;
                    let mut seen = 0;
                    for n in self.nodes.iter_mut() {
                        if seen >= 8 {
                            break;
                        }
                        if !n.is_live() {
                            continue;
                        }
                        if n.token.is_empty() {
                            n.acked = true;
                        }
                        if !n.acked {
                            all_acked = false;
                            let confirmed = n.reply_time.map(|t| now.saturating_sub(t) < 15).unwrap_or(false);
                            n.pinged += 1;
                            n.request_time = Some(now);
                            queries.push(SearchQuery::AnnouncePeer {
                                addr: n.addr,
                                node_id: n.id,
                                token: n.token.clone(),
                                confirmed,
                            });
                        }
                        seen += 1;
                    }
                    let _ = port;
                    if all_acked {
                        self.done = true;
                        self.step_time = now;
                        return (queries, StepOutcome::Done);
                    }
                    self.step_time = now;
                    return (queries, StepOutcome::Pending);
                }
            };
            self.step_time = now;
            return (Vec::new(), outcome);
        }

        if self.step_time + retransmit_secs >= now {
            return (Vec::new(), StepOutcome::Pending);
        }

        let mut queries = Vec::new();
        for idx in 0..self.nodes.len() {
            if let Some(q) = self.try_get_peers(idx, now, retransmit_secs) {
                queries.push(q);
            }
            if queries.len() >= inflight_queries {
                break;
            }
        }
        self.step_time = now;
        (queries, StepOutcome::Pending)
    }

    pub fn is_expired(&self, now: u64, expire_secs: u64) -> bool {
        now.saturating_sub(self.step_time) >= expire_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(b: u8) -> Id {
        Id::from_bytes([b; 20])
    }

    fn addr(port: u16) -> SocketAddr {
        format!("1.2.3.4:{port}").parse().unwrap()
    }

    #[test]
    fn nodes_stay_sorted_by_xor_distance_to_target() {
        let target = Id::ZERO;
        let mut sr = Search::new(0, target, true, None, 0);
        sr.insert_node(id(0x08), addr(1), false, None, 0, 14);
        sr.insert_node(id(0x01), addr(2), false, None, 0, 14);
        sr.insert_node(id(0x04), addr(3), false, None, 0, 14);
        let distances: Vec<u8> = sr.nodes.iter().map(|n| n.id.as_bytes()[0]).collect();
        assert_eq!(distances, vec![0x01, 0x04, 0x08]);
    }

    #[test]
    fn full_set_evicts_farthest_on_closer_insert() {
        let target = Id::ZERO;
        let mut sr = Search::new(0, target, true, None, 0);
        for i in 0..14u8 {
            sr.insert_node(id(0x10 + i), addr(i as u16), false, None, 0, 14);
        }
        assert_eq!(sr.nodes.len(), 14);
        let farthest_before = sr.nodes.last().unwrap().id;
        let closer = id(0x01);
        assert!(sr.insert_node(closer, addr(99), false, None, 0, 14));
        assert_eq!(sr.nodes.len(), 14);
        assert!(sr.nodes.iter().any(|n| n.id == closer));
        assert!(!sr.nodes.iter().any(|n| n.id == farthest_before));
    }

    #[test]
    fn oversized_token_is_discarded_not_stored() {
        let target = Id::ZERO;
        let mut sr = Search::new(0, target, true, None, 0);
        let oversized = vec![0u8; 41];

        sr.insert_node(id(0x01), addr(1), false, Some(&oversized), 0, 14);
        assert!(sr.nodes[0].token.is_empty());

        let ok_token = vec![0u8; 40];
        sr.insert_node(id(0x01), addr(1), false, Some(&ok_token), 0, 14);
        assert_eq!(sr.nodes[0].token, ok_token);

        // Re-observing the same node with an oversized token must not
        // clobber the previously accepted one.
        sr.insert_node(id(0x01), addr(1), false, Some(&oversized), 0, 14);
        assert_eq!(sr.nodes[0].token, ok_token);
    }

    #[test]
    fn pure_lookup_completes_once_first_eight_live_replied() {
        let target = Id::ZERO;
        let mut sr = Search::new(0, target, true, None, 0);
        for i in 0..8u8 {
            sr.insert_node(id(i + 1), addr(i as u16), true, None, 0, 14);
        }
        let (_queries, outcome) = sr.step(100, 10, 4);
        assert_eq!(outcome, StepOutcome::Done);
    }

    #[test]
    fn announce_mode_waits_for_acks_before_done() {
        let target = Id::ZERO;
        let mut sr = Search::new(0, target, true, Some(6881), 0);
        for i in 0..8u8 {
            sr.insert_node(id(i + 1), addr(i as u16), true, Some(b"tok"), 0, 14);
        }
        let (queries, outcome) = sr.step(100, 10, 4);
        assert_eq!(outcome, StepOutcome::Pending);
        assert_eq!(queries.len(), 8);
    }

    #[test]
    fn empty_token_counts_as_acked() {
        let target = Id::ZERO;
        let mut sr = Search::new(0, target, true, Some(6881), 0);
        for i in 0..8u8 {
            sr.insert_node(id(i + 1), addr(i as u16), true, None, 0, 14);
        }
        let (queries, outcome) = sr.step(100, 10, 4);
        assert_eq!(outcome, StepOutcome::Done);
        assert!(queries.is_empty());
    }

    #[test]
    fn retransmit_sends_get_peers_to_unreplied_live_nodes() {
        let target = Id::ZERO;
        let mut sr = Search::new(0, target, true, None, 0);
        sr.insert_node(id(1), addr(1), false, None, 0, 14);
        let (queries, outcome) = sr.step(20, 10, 4);
        assert_eq!(outcome, StepOutcome::Pending);
        assert_eq!(queries.len(), 1);
    }

    proptest::proptest! {
        /// §8 invariant 4: whatever order candidates arrive in, `nodes[]`
        /// stays strictly sorted by XOR-distance to `target` with no
        /// duplicate ids, and never exceeds `max_nodes`.
        #[test]
        fn insertions_in_any_order_stay_sorted_and_unique(
            target_byte in any::<u8>(),
            id_bytes in proptest::collection::vec(any::<u8>(), 1..60),
        ) {
            let mut target_id = [0u8; 20];
            target_id[0] = target_byte;
            let target = Id::from_bytes(target_id);
            let mut sr = Search::new(0, target, true, None, 0);
            for (i, b) in id_bytes.iter().enumerate() {
                sr.insert_node(id(*b), addr(i as u16), false, None, 0, 14);
            }
            prop_assert!(sr.nodes.len() <= 14);
            for w in sr.nodes.windows(2) {
                prop_assert_eq!(w[0].id.xor_cmp(&w[1].id, &target), Ordering::Less);
            }
            let mut seen = std::collections::HashSet::new();
            for n in &sr.nodes {
                prop_assert!(seen.insert(n.id.as_bytes().to_vec()));
            }
        }
    }
}
