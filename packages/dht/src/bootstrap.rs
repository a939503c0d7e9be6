//! Per-family bootstrap driver (§4.H): grows a fresh routing table from a
//! handful of seed addresses up to a quality target.

use std::net::SocketAddr;

use krpc_proto::Id;

use crate::config::Config;
use crate::context::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Disabled,
    Enabled,
    Running,
    Complete,
    Failed,
}

pub struct Bootstrap {
    pub state: BootstrapState,
    seeds: Vec<SocketAddr>,
    pub start_time: u64,
    pub end_time: u64,
    pub next_time: u64,
}

impl Bootstrap {
    pub fn new() -> Bootstrap {
        Bootstrap {
            state: BootstrapState::Disabled,
            seeds: Vec::new(),
            start_time: 0,
            end_time: 0,
            next_time: 0,
        }
    }

    pub fn add_seed(&mut self, addr: SocketAddr) {
        self.seeds.push(addr);
    }

    /// `dht_enable_bootstrap`: requires at least one registered seed;
    /// otherwise the state reverts to disabled rather than entering a
    /// running state with nothing to probe.
    pub fn enable(&mut self, now: u64) -> bool {
        if self.seeds.is_empty() {
            self.state = BootstrapState::Disabled;
            return false;
        }
        self.state = BootstrapState::Enabled;
        self.next_time = now;
        true
    }

    pub fn disable(&mut self) {
        self.state = BootstrapState::Disabled;
        self.next_time = 0;
    }

    pub fn is_running(&self) -> bool {
        self.state == BootstrapState::Running
    }

    pub fn is_due(&self, now: u64) -> bool {
        matches!(self.state, BootstrapState::Enabled | BootstrapState::Running) && now >= self.next_time
    }

    /// Builds the synthetic id new seeds are inserted under: our own id
    /// with the top bit flipped and the bottom 4 bytes randomized, so the
    /// seeds land in a bucket far from our own and get explored rather than
    /// immediately evicted by closer real peers.
    fn synthetic_id(my_id: &Id, host: &mut dyn Host) -> Id {
        let mut bytes = *my_id.as_bytes();
        bytes[0] ^= 0x80;
        let mut suffix = [0u8; 4];
        host.random_bytes(&mut suffix);
        bytes[16..20].copy_from_slice(&suffix);
        Id::from_bytes(bytes)
    }

    /// One bootstrap iteration (§4.H). Returns the seed-insertion list (on
    /// entering RUNNING) and the probe list (find_node/ping targets) for
    /// the caller to act on; this module holds no reference to the routing
    /// table, so it can't issue queries itself.
    pub fn step(
        &mut self,
        my_id: &Id,
        host: &mut dyn Host,
        cfg: &Config,
        now: u64,
        stats: BootstrapStats,
        candidates: &[BootstrapCandidate],
    ) -> BootstrapAction {
        match self.state {
            BootstrapState::Enabled => {
                self.start_time = now;
                let seeds: Vec<(Id, SocketAddr)> = self
                    .seeds
                    .iter()
                    .map(|addr| (Self::synthetic_id(my_id, host), *addr))
                    .collect();
                self.state = BootstrapState::Running;
                self.next_time = now;
                BootstrapAction::SeedNodes(seeds)
            }
            BootstrapState::Running => {
                if stats.good >= cfg.bootstrap_good_target {
                    self.end_time = now;
                    self.state = BootstrapState::Complete;
                    self.next_time = 0;
                    return BootstrapAction::Complete;
                }
                if stats.total == 0 {
                    self.end_time = now;
                    self.state = BootstrapState::Failed;
                    self.next_time = 0;
                    return BootstrapAction::Failed;
                }

                let mut finds = 0usize;
                let mut pings = 0usize;
                let mut probes = Vec::new();
                let mut projected_dubious = stats.dubious;

                for c in candidates {
                    if finds + pings >= stats.total
                        || (finds >= cfg.bootstrap_max_finds && pings >= cfg.bootstrap_max_pings)
                    {
                        break;
                    }
                    let recently_pinged = c
                        .last_pinged
                        .map(|t| now.saturating_sub(t) < 15)
                        .unwrap_or(false);
                    if recently_pinged {
                        continue;
                    }
                    if c.good {
                        if finds < cfg.bootstrap_max_finds && projected_dubious < cfg.bootstrap_max_dubious {
                            probes.push(BootstrapProbe::FindNode { id: c.id, addr: c.addr });
                            projected_dubious += cfg.bootstrap_expected_nodes;
                            finds += 1;
                        }
                    } else if pings < cfg.bootstrap_max_pings {
                        probes.push(BootstrapProbe::Ping { id: c.id, addr: c.addr });
                        pings += 1;
                    }
                }

                self.next_time = now + cfg.bootstrap_interval_secs;
                BootstrapAction::Probe(probes)
            }
            _ => BootstrapAction::None,
        }
    }
}

impl Default for Bootstrap {
    fn default() -> Bootstrap {
        Bootstrap::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BootstrapStats {
    pub good: usize,
    pub dubious: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct BootstrapCandidate {
    pub id: Id,
    pub addr: SocketAddr,
    pub good: bool,
    pub last_pinged: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum BootstrapProbe {
    FindNode { id: Id, addr: SocketAddr },
    Ping { id: Id, addr: SocketAddr },
}

#[derive(Debug, Clone)]
pub enum BootstrapAction {
    None,
    SeedNodes(Vec<(Id, SocketAddr)>),
    Probe(Vec<BootstrapProbe>),
    Complete,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHost;
    impl Host for FakeHost {
        fn now(&self) -> u64 {
            0
        }
        fn random_bytes(&mut self, buf: &mut [u8]) {
            buf.fill(0x42);
        }
        fn hash(&self, out: &mut [u8], _a: &[u8], _b: &[u8], _c: &[u8]) {
            out.fill(0);
        }
        fn send_to(&mut self, _addr: SocketAddr, _bytes: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn enable_without_seeds_stays_disabled() {
        let mut bs = Bootstrap::new();
        assert!(!bs.enable(0));
        assert_eq!(bs.state, BootstrapState::Disabled);
    }

    #[test]
    fn enable_with_seed_transitions_and_running_seeds_synthetic_id() {
        let mut bs = Bootstrap::new();
        bs.add_seed("10.0.0.1:6881".parse().unwrap());
        assert!(bs.enable(0));
        assert_eq!(bs.state, BootstrapState::Enabled);

        let my_id = Id::from_bytes([0x01; 20]);
        let mut host = FakeHost;
        let cfg = Config::default();
        let action = bs.step(&my_id, &mut host, &cfg, 0, BootstrapStats::default(), &[]);
        assert_eq!(bs.state, BootstrapState::Running);
        match action {
            BootstrapAction::SeedNodes(seeds) => {
                assert_eq!(seeds.len(), 1);
                assert_eq!(seeds[0].0.as_bytes()[0], 0x81); // top bit flipped
            }
            _ => panic!("expected SeedNodes"),
        }
    }

    #[test]
    fn good_target_reached_completes() {
        let mut bs = Bootstrap::new();
        bs.state = BootstrapState::Running;
        let my_id = Id::from_bytes([0x01; 20]);
        let mut host = FakeHost;
        let cfg = Config::default();
        let stats = BootstrapStats { good: cfg.bootstrap_good_target, dubious: 0, total: 100 };
        let action = bs.step(&my_id, &mut host, &cfg, 0, stats, &[]);
        assert_eq!(bs.state, BootstrapState::Complete);
        assert!(matches!(action, BootstrapAction::Complete));
    }

    #[test]
    fn zero_total_nodes_fails() {
        let mut bs = Bootstrap::new();
        bs.state = BootstrapState::Running;
        let my_id = Id::from_bytes([0x01; 20]);
        let mut host = FakeHost;
        let cfg = Config::default();
        let action = bs.step(&my_id, &mut host, &cfg, 0, BootstrapStats::default(), &[]);
        assert_eq!(bs.state, BootstrapState::Failed);
        assert!(matches!(action, BootstrapAction::Failed));
    }
}
