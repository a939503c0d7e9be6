//! A half-open range of the 160-bit space holding a bounded node list
//! (§3 Bucket, §4.D).

use std::net::SocketAddr;

use krpc_proto::Id;

use crate::node::{Node, NodeConfig, Quality};

pub const ROOT_MAX_COUNT: usize = 128;
pub const MIN_MAX_COUNT: usize = 8;

#[derive(Debug, Clone)]
pub struct Bucket {
    pub first: Id,
    pub max_count: usize,
    pub nodes: Vec<Node>,
    pub cached: Option<SocketAddr>,
    pub last_activity: Option<u64>,
}

impl Bucket {
    pub fn root() -> Bucket {
        Bucket {
            first: Id::ZERO,
            max_count: ROOT_MAX_COUNT,
            nodes: Vec::new(),
            cached: None,
            last_activity: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.max_count
    }

    /// Whether `id` falls in `[self.first, next_first)`. `next_first`
    /// is `None` for the last bucket in the list, whose range is open-ended.
    pub fn contains(&self, id: &Id, next_first: Option<&Id>) -> bool {
        self.first <= *id && next_first.map(|n| id < n).unwrap_or(true)
    }

    pub fn find(&self, id: &Id) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    pub fn good_nodes<'a>(&'a self, now: u64, cfg: &'a NodeConfig) -> impl Iterator<Item = &'a Node> {
        self.nodes.iter().filter(move |n| n.is_good(now, cfg))
    }

    pub fn counts(&self, now: u64, cfg: &NodeConfig) -> (usize, usize, usize) {
        let mut good = 0;
        let mut dubious = 0;
        let mut bad = 0;
        for n in &self.nodes {
            match n.quality(now, cfg) {
                Quality::Good => good += 1,
                Quality::Dubious => dubious += 1,
                Quality::Bad => bad += 1,
            }
        }
        (good, dubious, bad)
    }

    /// Removes every node whose ping count has reached the bad threshold.
    /// Returns whether anything was removed (the caller pings the cached
    /// replacement, if any, when this is true).
    pub fn expire(&mut self, cfg: &NodeConfig) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| !n.is_bad(cfg));
        self.nodes.len() != before
    }

    /// The new boundary a split introduces: one bit past the highest bit
    /// that `first` and the following bucket's `first` (if any) have
    /// already settled on. `None` if the range can't be subdivided further
    /// (160-bit exhausted).
    pub fn middle(first: &Id, next_first: Option<&Id>) -> Option<Id> {
        let bit1 = first.lowbit().map(|b| b as i32).unwrap_or(-1);
        let bit2 = next_first
            .and_then(|n| n.lowbit())
            .map(|b| b as i32)
            .unwrap_or(-1);
        let bit = bit1.max(bit2) + 1;
        if bit >= 160 {
            return None;
        }
        let bit = bit as u32;
        let mut bytes = *first.as_bytes();
        bytes[(bit / 8) as usize] |= 0x80u8 >> (bit % 8);
        Some(Id::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_bucket_contains_everything() {
        let b = Bucket::root();
        assert!(b.contains(&Id::from_bytes([0xFF; 20]), None));
        assert!(b.contains(&Id::ZERO, None));
    }

    #[test]
    fn middle_of_whole_space_is_the_high_bit() {
        let mid = Bucket::middle(&Id::ZERO, None).unwrap();
        let mut expected = [0u8; 20];
        expected[0] = 0x80;
        assert_eq!(mid, Id::from_bytes(expected));
    }

    #[test]
    fn middle_returns_none_at_full_depth() {
        let first = Id::from_bytes([0xFF; 20]);
        assert_eq!(Bucket::middle(&first, None), None);
    }
}
