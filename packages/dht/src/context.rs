//! Host-supplied hooks (§6): the engine owns no socket, no clock, and no
//! RNG. Everything that touches the outside world is injected through this
//! trait, which the host implements once and hands to [`crate::Engine`].

use std::net::SocketAddr;

pub trait Host {
    /// Monotonic wall-clock seconds. Must be non-decreasing across calls.
    fn now(&self) -> u64;

    /// Fills `buf` with cryptographically-irrelevant random bytes (token
    /// secrets, synthetic bootstrap ids, search jitter).
    fn random_bytes(&mut self, buf: &mut [u8]);

    /// `H(a || b || c)`, truncated by the caller to however many bytes it
    /// asked for via `out.len()`. Used only to derive announce tokens.
    fn hash(&self, out: &mut [u8], a: &[u8], b: &[u8], c: &[u8]);

    /// Host-level blacklist policy, consulted in addition to the engine's
    /// own ring buffer (§4.C step 2).
    fn is_blacklisted(&self, addr: &SocketAddr) -> bool {
        let _ = addr;
        false
    }

    /// Sends `bytes` to `addr`. The host picks the v4/v6 socket.
    fn send_to(&mut self, addr: SocketAddr, bytes: &[u8]) -> std::io::Result<()>;
}
