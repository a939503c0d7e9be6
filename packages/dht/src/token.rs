//! Opaque announce-authorization tokens (§4.F). `token = H(secret, ip,
//! port)`, truncated to `token_size` bytes; accepted against either the
//! current or the just-rotated-out previous secret so a token handed out
//! just before a rotation still works.

use std::net::SocketAddr;

use crate::context::Host;

const SECRET_LEN: usize = 8;

pub struct TokenService {
    secret: [u8; SECRET_LEN],
    old_secret: [u8; SECRET_LEN],
    token_size: usize,
    next_rotation: u64,
    min_secs: u64,
    jitter_secs: u64,
}

impl TokenService {
    pub fn new(host: &mut dyn Host, token_size: usize, min_secs: u64, jitter_secs: u64, now: u64) -> TokenService {
        let mut svc = TokenService {
            secret: [0u8; SECRET_LEN],
            old_secret: [0u8; SECRET_LEN],
            token_size,
            next_rotation: now,
            min_secs,
            jitter_secs,
        };
        svc.rotate(host, now);
        svc
    }

    /// Replaces the current secret with fresh random bytes (the old one
    /// becomes `old_secret`) and schedules the next rotation `min_secs +
    /// rand(jitter_secs)` seconds out (§3, 15-45 min by default).
    pub fn rotate(&mut self, host: &mut dyn Host, now: u64) {
        self.old_secret = self.secret;
        host.random_bytes(&mut self.secret);
        let mut jitter_buf = [0u8; 2];
        host.random_bytes(&mut jitter_buf);
        let jitter = u16::from_ne_bytes(jitter_buf) as u64 % self.jitter_secs.max(1);
        self.next_rotation = now + self.min_secs + jitter;
    }

    pub fn due(&self, now: u64) -> bool {
        now >= self.next_rotation
    }

    pub fn next_rotation(&self) -> u64 {
        self.next_rotation
    }

    fn make(&self, host: &dyn Host, addr: &SocketAddr, secret: &[u8; SECRET_LEN]) -> Vec<u8> {
        let ip_bytes = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
            std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let port = addr.port().to_be_bytes();
        let mut out = vec![0u8; self.token_size];
        host.hash(&mut out, secret, &ip_bytes, &port);
        out
    }

    pub fn make_token(&self, host: &dyn Host, addr: &SocketAddr) -> Vec<u8> {
        self.make(host, addr, &self.secret)
    }

    pub fn token_match(&self, host: &dyn Host, token: &[u8], addr: &SocketAddr) -> bool {
        if token.len() != self.token_size {
            return false;
        }
        token == self.make(host, addr, &self.secret).as_slice()
            || token == self.make(host, addr, &self.old_secret).as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHost {
        now: u64,
        rand_seed: u8,
    }

    impl Host for FakeHost {
        fn now(&self) -> u64 {
            self.now
        }
        fn random_bytes(&mut self, buf: &mut [u8]) {
            for b in buf.iter_mut() {
                self.rand_seed = self.rand_seed.wrapping_add(1);
                *b = self.rand_seed;
            }
        }
        fn hash(&self, out: &mut [u8], a: &[u8], b: &[u8], c: &[u8]) {
            let mut acc = 0u8;
            for byte in a.iter().chain(b).chain(c) {
                acc = acc.wrapping_add(*byte).rotate_left(1);
            }
            for (i, o) in out.iter_mut().enumerate() {
                *o = acc.wrapping_add(i as u8);
            }
        }
        fn send_to(&mut self, _addr: SocketAddr, _bytes: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn token_accepted_against_current_and_previous_secret() {
        let mut host = FakeHost { now: 0, rand_seed: 0 };
        let mut svc = TokenService::new(&mut host, 8, 900, 1800, 0);
        let addr: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        let current = svc.make_token(&host, &addr);
        svc.rotate(&mut host, 1000);
        // The just-rotated-out secret still authenticates a token minted
        // under it.
        assert!(svc.token_match(&host, &current, &addr));
        let fresh = svc.make_token(&host, &addr);
        assert!(svc.token_match(&host, &fresh, &addr));
    }

    #[test]
    fn wrong_address_is_rejected() {
        let mut host = FakeHost { now: 0, rand_seed: 0 };
        let svc = TokenService::new(&mut host, 8, 900, 1800, 0);
        let a: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        let b: SocketAddr = "5.6.7.8:6881".parse().unwrap();
        let token = svc.make_token(&host, &a);
        assert!(!svc.token_match(&host, &token, &b));
    }

    #[test]
    fn rotation_is_due_after_min_plus_jitter() {
        let mut host = FakeHost { now: 0, rand_seed: 0 };
        let svc = TokenService::new(&mut host, 8, 900, 1800, 0);
        assert!(!svc.due(899));
        assert!(svc.due(900 + 1800));
    }
}
