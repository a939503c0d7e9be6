//! Per-info-hash peer storage (§4.E).

use std::net::{IpAddr, SocketAddr};

use krpc_proto::Id;

use crate::config::Config;

#[derive(Debug, Clone, Copy)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub last_seen: u64,
}

struct Record {
    peers: Vec<PeerRecord>,
    max_peers: usize,
}

impl Record {
    fn new() -> Record {
        Record { peers: Vec::new(), max_peers: 0 }
    }
}

pub struct Storage {
    records: Vec<(Id, Record)>,
    max_hashes: usize,
    max_peers: usize,
    sample_cursor: usize,
}

/// Outcome of [`Storage::store`], mirroring the reference's `storage_store`
/// return values: refreshed an existing entry, inserted a new one, or
/// rejected because a cap was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Refreshed,
    Inserted,
    Rejected,
}

impl Storage {
    pub fn new(cfg: &Config) -> Storage {
        Storage {
            records: Vec::new(),
            max_hashes: cfg.max_hashes,
            max_peers: cfg.max_peers_per_hash,
            sample_cursor: 0,
        }
    }

    fn find_mut(&mut self, info_hash: &Id) -> Option<&mut Record> {
        self.records.iter_mut().find(|(id, _)| id == info_hash).map(|(_, r)| r)
    }

    /// Stores `addr` under `info_hash`, deduplicated by (ip, port). Creates
    /// the record if absent (bounded by `max_hashes`); the per-record peer
    /// array doubles in capacity from 2 up to `max_peers`, exactly as the
    /// reference's `realloc` growth does.
    pub fn store(&mut self, info_hash: Id, addr: SocketAddr, now: u64) -> StoreOutcome {
        if self.find_mut(&info_hash).is_none() {
            if self.records.len() >= self.max_hashes {
                return StoreOutcome::Rejected;
            }
            self.records.push((info_hash, Record::new()));
        }
        let max_peers = self.max_peers;
        let record = self.find_mut(&info_hash).expect("just inserted or already present");

        if let Some(existing) = record.peers.iter_mut().find(|p| p.addr == addr) {
            existing.last_seen = now;
            return StoreOutcome::Refreshed;
        }

        if record.peers.len() >= record.max_peers {
            if record.max_peers >= max_peers {
                return StoreOutcome::Rejected;
            }
            record.max_peers = (record.max_peers.max(1) * 2).min(max_peers);
        }
        record.peers.push(PeerRecord { addr, last_seen: now });
        StoreOutcome::Inserted
    }

    pub fn lookup(&self, info_hash: &Id) -> &[PeerRecord] {
        self.records
            .iter()
            .find(|(id, _)| id == info_hash)
            .map(|(_, r)| r.peers.as_slice())
            .unwrap_or(&[])
    }

    /// Up to 50 peers starting at a circular offset, matching the family of
    /// `want_v4`. Walks until it wraps back to the start or 50 entries are
    /// emitted; on a sparse record this can legitimately return fewer than
    /// 50 even when more matching entries exist (§9 Design Notes).
    pub fn sample(&mut self, info_hash: &Id, want_v4: bool) -> Vec<SocketAddr> {
        let peers = self
            .records
            .iter()
            .find(|(id, _)| id == info_hash)
            .map(|(_, r)| r.peers.as_slice())
            .unwrap_or(&[]);
        if peers.is_empty() {
            return Vec::new();
        }
        let matches = |p: &PeerRecord| match p.addr.ip() {
            IpAddr::V4(_) => want_v4,
            IpAddr::V6(_) => !want_v4,
        };
        let n = peers.len();
        let start = self.sample_cursor % n;
        self.sample_cursor = self.sample_cursor.wrapping_add(1);
        let mut out = Vec::new();
        let mut i = start;
        loop {
            if matches(&peers[i]) {
                out.push(peers[i].addr);
                if out.len() >= 50 {
                    break;
                }
            }
            i = (i + 1) % n;
            if i == start {
                break;
            }
        }
        out
    }

    /// Drops peers older than `storage_peer_expire_secs` and removes
    /// records left with no peers.
    pub fn expire(&mut self, now: u64, expire_secs: u64) {
        for (_, record) in self.records.iter_mut() {
            record.peers.retain(|p| now.saturating_sub(p.last_seen) < expire_secs);
        }
        self.records.retain(|(_, r)| !r.peers.is_empty());
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}
