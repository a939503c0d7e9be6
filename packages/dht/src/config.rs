//! Tunable constants (§5, scattered through §4), gathered into one typed
//! surface so an embedder can retune the engine without forking it.

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub max_peers_per_hash: usize,
    pub max_hashes: usize,
    pub max_searches: usize,
    pub max_blacklisted: usize,
    pub search_nodes: usize,
    pub inflight_queries: usize,
    pub search_retransmit_secs: u64,
    pub search_expire_secs: u64,

    pub token_bucket_capacity: u32,
    pub token_bucket_refill_per_sec: u32,
    pub token_size: usize,
    pub secret_rotate_min_secs: u64,
    pub secret_rotate_jitter_secs: u64,

    pub storage_peer_expire_secs: u64,

    pub node_good_reply_window_secs: u64,
    pub node_good_heard_window_secs: u64,
    pub node_bad_ping_count: u32,
    pub node_recycle_ping_gap_secs: u64,
    pub node_stale_hearsay_secs: u64,

    pub bootstrap_interval_secs: u64,
    pub bootstrap_good_target: usize,
    pub bootstrap_max_dubious: usize,
    pub bootstrap_max_finds: usize,
    pub bootstrap_max_pings: usize,
    pub bootstrap_expected_nodes: usize,

    pub bucket_expire_min_secs: u64,
    pub bucket_expire_max_secs: u64,

    pub confirm_soon_min_secs: u64,
    pub confirm_soon_jitter_secs: u64,
    pub confirm_lazy_min_secs: u64,
    pub confirm_lazy_jitter_secs: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_peers_per_hash: 2048,
            max_hashes: 16384,
            max_searches: 1024,
            max_blacklisted: 10,
            search_nodes: 14,
            inflight_queries: 4,
            search_retransmit_secs: 10,
            search_expire_secs: 62 * 60,

            token_bucket_capacity: 400,
            token_bucket_refill_per_sec: 100,
            token_size: 8,
            secret_rotate_min_secs: 900,
            secret_rotate_jitter_secs: 1800,

            storage_peer_expire_secs: 32 * 60,

            node_good_reply_window_secs: 7200,
            node_good_heard_window_secs: 900,
            node_bad_ping_count: 4,
            node_recycle_ping_gap_secs: 15,
            node_stale_hearsay_secs: 15 * 60,

            bootstrap_interval_secs: 3,
            bootstrap_good_target: 50,
            bootstrap_max_dubious: 50,
            bootstrap_max_finds: 5,
            bootstrap_max_pings: 10,
            bootstrap_expected_nodes: 8,

            bucket_expire_min_secs: 120,
            bucket_expire_max_secs: 360,

            confirm_soon_min_secs: 5,
            confirm_soon_jitter_secs: 10,
            confirm_lazy_min_secs: 60,
            confirm_lazy_jitter_secs: 120,
        }
    }
}

impl Config {
    pub fn node_config(&self) -> dht_routing_table::NodeConfig {
        dht_routing_table::NodeConfig {
            good_reply_window_secs: self.node_good_reply_window_secs,
            good_heard_window_secs: self.node_good_heard_window_secs,
            bad_ping_count: self.node_bad_ping_count,
            recycle_ping_gap_secs: self.node_recycle_ping_gap_secs,
            stale_hearsay_secs: self.node_stale_hearsay_secs,
        }
    }
}
