//! A single remote peer tracked by a bucket (§3 Node, §4.D).

use std::net::SocketAddr;

use krpc_proto::Id;

/// Thresholds that decide whether a [`Node`] is good, dubious, or bad.
/// Mirrors the fixed constants the reference implementation hard-codes
/// into `node_good`/`pinged`.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    pub good_reply_window_secs: u64,
    pub good_heard_window_secs: u64,
    pub bad_ping_count: u32,
    pub recycle_ping_gap_secs: u64,
    pub stale_hearsay_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            good_reply_window_secs: 7200,
            good_heard_window_secs: 900,
            bad_ping_count: 4,
            recycle_ping_gap_secs: 15,
            stale_hearsay_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quality {
    Good,
    Dubious,
    Bad,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: Id,
    pub addr: SocketAddr,
    pub last_heard: Option<u64>,
    pub last_reply: Option<u64>,
    pub last_pinged: Option<u64>,
    pub pinged: u32,
    /// Set when the last message we saw from this node was an unsolicited
    /// request rather than a reply; used by the "incoming" statistic (§4.D).
    pub incoming: bool,
}

impl Node {
    pub fn new(id: Id, addr: SocketAddr) -> Node {
        Node {
            id,
            addr,
            last_heard: None,
            last_reply: None,
            last_pinged: None,
            pinged: 0,
            incoming: false,
        }
    }

    pub fn quality(&self, now: u64, cfg: &NodeConfig) -> Quality {
        if self.pinged >= cfg.bad_ping_count {
            return Quality::Bad;
        }
        let replied_recently = self
            .last_reply
            .map(|t| now.saturating_sub(t) <= cfg.good_reply_window_secs)
            .unwrap_or(false);
        let heard_recently = self
            .last_heard
            .map(|t| now.saturating_sub(t) <= cfg.good_heard_window_secs)
            .unwrap_or(false);
        if self.pinged <= 2 && replied_recently && heard_recently {
            Quality::Good
        } else {
            Quality::Dubious
        }
    }

    pub fn is_good(&self, now: u64, cfg: &NodeConfig) -> bool {
        self.quality(now, cfg) == Quality::Good
    }

    pub fn is_bad(&self, cfg: &NodeConfig) -> bool {
        self.pinged >= cfg.bad_ping_count
    }

    /// A "recyclable" bad slot: ping count has hit the dubious/bad
    /// threshold used by `new_node`'s bad-slot recycle path (pinged >= 3,
    /// stale for at least `recycle_ping_gap_secs`).
    pub fn is_recyclable(&self, now: u64, cfg: &NodeConfig) -> bool {
        self.pinged >= 3
            && self
                .last_pinged
                .map(|t| now.saturating_sub(t) >= cfg.recycle_ping_gap_secs)
                .unwrap_or(true)
    }

    pub fn note_pinged(&mut self, now: u64) {
        self.pinged += 1;
        self.last_pinged = Some(now);
    }

    pub fn note_heard(&mut self, now: u64) {
        self.last_heard = Some(now);
    }

    pub fn note_reply(&mut self, now: u64) {
        self.last_reply = Some(now);
        self.last_heard = Some(now);
        self.pinged = 0;
        self.last_pinged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "1.2.3.4:6881".parse().unwrap()
    }

    #[test]
    fn fresh_node_with_a_reply_is_good() {
        let cfg = NodeConfig::default();
        let mut n = Node::new(Id::ZERO, addr());
        n.note_reply(1000);
        assert_eq!(n.quality(1000, &cfg), Quality::Good);
    }

    #[test]
    fn stale_reply_makes_node_dubious() {
        let cfg = NodeConfig::default();
        let mut n = Node::new(Id::ZERO, addr());
        n.note_reply(0);
        assert_eq!(
            n.quality(cfg.good_reply_window_secs + 1, &cfg),
            Quality::Dubious
        );
    }

    #[test]
    fn four_unanswered_pings_is_bad() {
        let cfg = NodeConfig::default();
        let mut n = Node::new(Id::ZERO, addr());
        n.note_reply(0);
        for t in 1..=4 {
            n.note_pinged(t);
        }
        assert_eq!(n.quality(10, &cfg), Quality::Bad);
    }
}
