//! Admission control (§4.C): martian-address filter, blacklist ring, and
//! the inbound request rate limiter. `Transport` also owns the one place
//! outbound bytes leave the engine.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::config::Config;
use crate::context::Host;
use crate::error::{DhtError, Result};

/// True if `addr` is a source the reference implementation refuses to ever
/// talk to: port 0, loopback, unspecified, multicast, or (v4) the wider
/// `224/3` reserved+multicast range (§9 Design Notes: this breadth is
/// intentional, not a bug to narrow).
pub fn is_martian(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return true;
    }
    match addr.ip() {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            o[0] == 0 || o[0] == 127 || (o[0] & 0xE0) == 0xE0
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            let link_local = o[0] == 0xFE && (o[1] & 0xC0) == 0x80;
            let v4_mapped = o[0..12] == [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF];
            o[0] == 0xFF
                || link_local
                || (o[0..15] == [0u8; 15] && (o[15] == 0 || o[15] == 1))
                || v4_mapped
        }
    }
}

pub const fn loopback_v4() -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 0, 1)
}

pub const fn unspecified_v6() -> Ipv6Addr {
    Ipv6Addr::UNSPECIFIED
}

/// Fixed-size circular buffer of recently-blacklisted addresses (§3,
/// `DHT_MAX_BLACKLISTED`). Insertion evicts the oldest slot.
pub struct Blacklist {
    entries: Vec<SocketAddr>,
    capacity: usize,
    next: usize,
}

impl Blacklist {
    pub fn new(capacity: usize) -> Blacklist {
        Blacklist {
            entries: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub fn insert(&mut self, addr: SocketAddr) {
        if self.entries.len() < self.capacity {
            self.entries.push(addr);
        } else {
            self.entries[self.next] = addr;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.iter().any(|e| e == addr)
    }
}

/// Token-bucket rate limiter for inbound requests (§4.C step 3). Refilled
/// at a fixed rate, truncated to whole elapsed seconds exactly as the
/// reference does (`100 * (now - token_bucket_time)`), never more than
/// once an empty bucket is observed.
pub struct TokenBucket {
    tokens: u32,
    capacity: u32,
    refill_per_sec: u32,
    last_refill: u64,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32, now: u64) -> TokenBucket {
        TokenBucket {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    /// Consumes one token if available, refilling first when the bucket is
    /// empty. Returns whether the request is admitted.
    pub fn take(&mut self, now: u64) -> bool {
        if self.tokens == 0 {
            let elapsed = now.saturating_sub(self.last_refill);
            self.tokens = self
                .capacity
                .min(self.refill_per_sec.saturating_mul(elapsed as u32));
            self.last_refill = now;
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

pub struct Transport {
    blacklist: Blacklist,
    bucket: TokenBucket,
}

impl Transport {
    pub fn new(cfg: &Config, now: u64) -> Transport {
        Transport {
            blacklist: Blacklist::new(cfg.max_blacklisted),
            bucket: TokenBucket::new(cfg.token_bucket_capacity, cfg.token_bucket_refill_per_sec, now),
        }
    }

    pub fn blacklist_node(&mut self, addr: SocketAddr) {
        self.blacklist.insert(addr);
    }

    /// Runs the inbound filter chain (§4.C steps 1-2); rate limiting is
    /// applied separately by the caller only for requests, not replies.
    pub fn accept_inbound(&self, addr: &SocketAddr, host: &dyn Host) -> bool {
        if is_martian(addr) {
            return false;
        }
        if self.blacklist.contains(addr) || host.is_blacklisted(addr) {
            return false;
        }
        true
    }

    pub fn admit_request(&mut self, now: u64) -> bool {
        self.bucket.take(now)
    }

    pub fn send(&self, host: &mut dyn Host, addr: SocketAddr, bytes: &[u8]) -> Result<()> {
        if self.blacklist.contains(&addr) {
            return Err(DhtError::ProtocolViolation {
                addr,
                reason: "attempted to send to a blacklisted node",
            });
        }
        host.send_to(addr, bytes).map_err(|source| DhtError::Send { addr, source })
    }
}
