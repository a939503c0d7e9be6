//! The periodic tick (§4.I): the single entry point that composes the
//! routing table, storage, token service, search engine, and bootstrap
//! driver, and dispatches inbound KRPC messages.

use std::net::SocketAddr;

use krpc_proto::codec::{self, ClosestNodesReply, MessageKind, ParsedMessage};
use krpc_proto::transaction::{self, PREFIX_ANNOUNCE_PEER, PREFIX_FIND_NODE, PREFIX_GET_PEERS, PREFIX_PING};
use krpc_proto::{Id, NodeInfo};

use dht_routing_table::{ObserveAction, ObserveOutcome, RoutingTable};

use crate::bootstrap::{Bootstrap, BootstrapAction, BootstrapCandidate, BootstrapProbe, BootstrapState, BootstrapStats};
use crate::config::Config;
use crate::context::Host;
use crate::error::EngineStatus;
use crate::log::{noop_sink, LogLevel, LogSink};
use crate::search::{Search, SearchQuery, StepOutcome};
use crate::storage::Storage;
use crate::token::TokenService;
use crate::transport::Transport;

/// Events the host's main callback would receive (§6), collected during a
/// `periodic` call instead of pushed through a callback type parameter.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Values { info_hash: Id, peers: Vec<SocketAddr> },
    SearchDone { info_hash: Id, is_v4: bool },
    Bootstrap { is_v4: bool, state: BootstrapState },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FamilyStats {
    pub buckets: usize,
    pub good: usize,
    pub dubious: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCounts {
    pub good: usize,
    pub dubious: usize,
    pub cached: usize,
    pub incoming: usize,
}

pub struct Engine {
    my_id: Id,
    client_tag: Option<[u8; 4]>,
    cfg: Config,
    node_cfg: dht_routing_table::NodeConfig,
    table_v4: RoutingTable,
    table_v6: RoutingTable,
    storage: Storage,
    tokens: TokenService,
    transport: Transport,
    searches: Vec<Search>,
    search_seq: u16,
    bootstrap_v4: Bootstrap,
    bootstrap_v6: Bootstrap,
    log: LogSink,

    next_expire: u64,
    next_confirm: u64,

    pending_pings: Vec<(bool, SocketAddr)>,
    pending_events: Vec<(Vec<SocketAddr>, Id)>,
}

impl Engine {
    pub fn new(my_id: Id, client_tag: Option<[u8; 4]>, cfg: Config, host: &mut dyn Host, now: u64) -> Engine {
        let node_cfg = cfg.node_config();
        let tokens = TokenService::new(host, cfg.token_size, cfg.secret_rotate_min_secs, cfg.secret_rotate_jitter_secs, now);
        Engine {
            my_id,
            client_tag,
            node_cfg,
            table_v4: RoutingTable::new(my_id),
            table_v6: RoutingTable::new(my_id),
            storage: Storage::new(&cfg),
            tokens,
            transport: Transport::new(&cfg, now),
            searches: Vec::new(),
            search_seq: {
                let mut buf = [0u8; 2];
                host.random_bytes(&mut buf);
                u16::from_ne_bytes(buf)
            },
            bootstrap_v4: Bootstrap::new(),
            bootstrap_v6: Bootstrap::new(),
            log: noop_sink(),
            next_expire: now,
            next_confirm: now,
            pending_pings: Vec::new(),
            pending_events: Vec::new(),
            cfg,
        }
    }

    pub fn set_log_sink(&mut self, sink: LogSink) {
        self.log = sink;
    }

    fn log(&mut self, level: LogLevel, msg: &str) {
        (self.log)(level, msg);
    }

    fn table(&self, is_v4: bool) -> &RoutingTable {
        if is_v4 {
            &self.table_v4
        } else {
            &self.table_v6
        }
    }

    fn table_mut(&mut self, is_v4: bool) -> &mut RoutingTable {
        if is_v4 {
            &mut self.table_v4
        } else {
            &mut self.table_v6
        }
    }

    fn bootstrap_mut(&mut self, is_v4: bool) -> &mut Bootstrap {
        if is_v4 {
            &mut self.bootstrap_v4
        } else {
            &mut self.bootstrap_v6
        }
    }

    // ---- host-facing API (§6) ----

    pub fn add_bootstrap(&mut self, is_v4: bool, addr: SocketAddr) {
        self.bootstrap_mut(is_v4).add_seed(addr);
    }

    pub fn enable_bootstrap(&mut self, is_v4: bool, on: bool, now: u64) -> bool {
        if on {
            self.bootstrap_mut(is_v4).enable(now)
        } else {
            self.bootstrap_mut(is_v4).disable();
            true
        }
    }

    pub fn bootstrap_state(&self, is_v4: bool) -> BootstrapState {
        if is_v4 {
            self.bootstrap_v4.state
        } else {
            self.bootstrap_v6.state
        }
    }

    pub fn stats(&self, is_v4: bool, now: u64) -> FamilyStats {
        let s = self.table(is_v4).stats(now, &self.node_cfg);
        FamilyStats { buckets: s.buckets, good: s.good, dubious: s.dubious, total: s.total }
    }

    pub fn nodes(&self, is_v4: bool, now: u64) -> NodeCounts {
        let s = self.table(is_v4).stats(now, &self.node_cfg);
        NodeCounts { good: s.good, dubious: s.dubious, cached: s.cached, incoming: s.incoming }
    }

    pub fn get_nodes(&self, is_v4: bool) -> Vec<NodeInfo> {
        self.table(is_v4)
            .buckets()
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.is_good(0, &self.node_cfg) || n.last_reply.is_some())
            .map(|n| NodeInfo::new(n.id, n.addr))
            .collect()
    }

    /// `dht_insert_node`: an explicit entry point for a known-good address
    /// (e.g. restored from a persisted node list), distinct from the
    /// implicit insertion that happens while processing traffic.
    pub fn insert_node(&mut self, id: Id, addr: SocketAddr, host: &dyn Host, now: u64) -> EngineStatus {
        self.observe(id, addr, 1, host, now)
    }

    pub fn ping_node(&mut self, addr: SocketAddr, host: &mut dyn Host) {
        let tid = transaction::make_tid(PREFIX_PING, 0);
        let mut buf = Vec::new();
        codec::encode_ping(&self.my_id, &tid, self.client_tag.as_ref(), &mut buf);
        let _ = self.transport.send(host, addr, &buf);
    }

    fn observe(&mut self, id: Id, addr: SocketAddr, confirm: u8, host: &dyn Host, now: u64) -> EngineStatus {
        let is_v4 = addr.is_ipv4();
        let martian = crate::transport::is_martian(&addr) || self.transport_blacklisted(&addr, host);
        let bootstrapping = self.bootstrap_state(is_v4) == BootstrapState::Running;
        let node_cfg = self.node_cfg;
        let (outcome, action) = self.table_mut(is_v4).observe(&id, addr, confirm, now, &node_cfg, bootstrapping, martian);
        self.apply_observe_action(is_v4, action, host);
        match outcome {
            ObserveOutcome::Rejected => EngineStatus::Rejected,
            _ => EngineStatus::Ok,
        }
    }

    fn transport_blacklisted(&self, addr: &SocketAddr, host: &dyn Host) -> bool {
        !self.transport.accept_inbound(addr, host)
    }

    fn apply_observe_action(&mut self, is_v4: bool, action: ObserveAction, host: &dyn Host) {
        let _ = host;
        // A full ping round-trip needs a mutable host to send; observe() is
        // also reachable from read-leaning call sites, so the actual ping
        // is queued and flushed at the end of `periodic`.
        match action {
            ObserveAction::PingCached(addr) | ObserveAction::PingDubious(addr) => {
                self.pending_pings.push((is_v4, addr));
            }
            ObserveAction::None => {}
        }
    }

    // ---- search (§4.G) ----

    fn next_tid(&mut self) -> u16 {
        self.search_seq = self.search_seq.wrapping_add(1);
        self.search_seq
    }

    fn step_init(&self, now: u64) -> u64 {
        now.saturating_sub(self.cfg.search_retransmit_secs + 1)
    }

    pub fn search(&mut self, info_hash: Id, port: Option<u16>, is_v4: bool, host: &mut dyn Host, now: u64) -> (EngineStatus, Vec<EngineEvent>) {
        let mut events = Vec::new();

        let local: Vec<SocketAddr> = self
            .storage
            .lookup(&info_hash)
            .iter()
            .map(|p| p.addr)
            .filter(|a| a.is_ipv4() == is_v4)
            .collect();
        if !local.is_empty() {
            events.push(EngineEvent::Values { info_hash, peers: local });
        }

        let existing_idx = self.searches.iter().position(|s| s.target == info_hash && s.is_v4 == is_v4);
        let is_duplicate = existing_idx.map(|i| !self.searches[i].done).unwrap_or(false);

        let idx = match existing_idx {
            Some(i) => {
                let reset_time = self.step_init(now);
                self.searches[i].port = port;
                self.searches[i].reset_progress(reset_time);
                i
            }
            None => {
                let oldest_done = self
                    .searches
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.done)
                    .min_by_key(|(_, s)| s.step_time)
                    .map(|(i, _)| i);
                match oldest_done {
                    Some(oi) if self.searches.len() >= self.cfg.max_searches => {
                        let tid = self.next_tid();
                        let fresh = Search::new(tid, info_hash, is_v4, port, self.step_init(now));
                        self.searches[oi] = fresh;
                        oi
                    }
                    _ if self.searches.len() < self.cfg.max_searches => {
                        let tid = self.next_tid();
                        let fresh = Search::new(tid, info_hash, is_v4, port, self.step_init(now));
                        self.searches.push(fresh);
                        self.searches.len() - 1
                    }
                    Some(oi) => {
                        let tid = self.next_tid();
                        let fresh = Search::new(tid, info_hash, is_v4, port, self.step_init(now));
                        self.searches[oi] = fresh;
                        oi
                    }
                    None => return (EngineStatus::Rejected, events),
                }
            }
        };

        let seeds = self.table(is_v4).closest_nodes(&info_hash, self.cfg.search_nodes);
        for seed in seeds {
            self.searches[idx].insert_node(seed.id, seed.addr, false, None, now, self.cfg.search_nodes);
        }

        let (queries, outcome) = self.searches[idx].step(now, self.cfg.search_retransmit_secs, self.cfg.inflight_queries);
        self.dispatch_search_queries(idx, queries, host, now);
        if outcome == StepOutcome::Done {
            events.push(EngineEvent::SearchDone { info_hash, is_v4: self.searches[idx].is_v4 });
        }

        let status = if is_duplicate { EngineStatus::Duplicate } else { EngineStatus::Ok };
        (status, events)
    }

    fn dispatch_search_queries(&mut self, idx: usize, queries: Vec<SearchQuery>, host: &mut dyn Host, now: u64) {
        let tid_seq = self.searches[idx].tid;
        let is_v4 = self.searches[idx].is_v4;
        for q in queries {
            match q {
                SearchQuery::GetPeers { addr, node_id, confirmed: _ } => {
                    let tid = transaction::make_tid(PREFIX_GET_PEERS, tid_seq);
                    let mut buf = Vec::new();
                    codec::encode_get_peers(&self.my_id, &tid, &self.searches[idx].target, self.client_tag.as_ref(), &mut buf);
                    let _ = self.transport.send(host, addr, &buf);
                    self.table_mut(is_v4).mark_pinged(&node_id, now);
                }
                SearchQuery::AnnouncePeer { addr, node_id, token, confirmed: _ } => {
                    let port = self.searches[idx].port.unwrap_or(0);
                    let tid = transaction::make_tid(PREFIX_ANNOUNCE_PEER, tid_seq);
                    let mut buf = Vec::new();
                    codec::encode_announce_peer(&self.my_id, &tid, &self.searches[idx].target, port, false, &token, self.client_tag.as_ref(), &mut buf);
                    let _ = self.transport.send(host, addr, &buf);
                    self.table_mut(is_v4).mark_pinged(&node_id, now);
                }
            }
        }
    }

    fn step_searches(&mut self, host: &mut dyn Host, now: u64, events: &mut Vec<EngineEvent>) {
        for idx in 0..self.searches.len() {
            if self.searches[idx].done {
                continue;
            }
            let (queries, outcome) = self.searches[idx].step(now, self.cfg.search_retransmit_secs, self.cfg.inflight_queries);
            self.dispatch_search_queries(idx, queries, host, now);
            if outcome == StepOutcome::Done {
                events.push(EngineEvent::SearchDone {
                    info_hash: self.searches[idx].target,
                    is_v4: self.searches[idx].is_v4,
                });
            }
        }
    }

    fn expire_searches(&mut self, now: u64, events: &mut Vec<EngineEvent>) {
        let expire_secs = self.cfg.search_expire_secs;
        let mut i = 0;
        while i < self.searches.len() {
            if self.searches[i].is_expired(now, expire_secs) {
                let sr = self.searches.remove(i);
                if !sr.done {
                    events.push(EngineEvent::SearchDone { info_hash: sr.target, is_v4: sr.is_v4 });
                }
            } else {
                i += 1;
            }
        }
    }

    /// Routes a just-learned peer to every incomplete search for its
    /// address family (the reference's `add_search_node`).
    fn offer_to_searches(&mut self, id: Id, addr: SocketAddr, host: &mut dyn Host, now: u64) {
        let is_v4 = addr.is_ipv4();
        for idx in 0..self.searches.len() {
            if self.searches[idx].is_v4 != is_v4 || self.searches[idx].done {
                continue;
            }
            if let Some(q) = self.searches[idx].offer_node(id, addr, now, self.cfg.search_retransmit_secs, self.cfg.search_nodes) {
                self.dispatch_search_queries(idx, vec![q], host, now);
            }
        }
    }

    // ---- bootstrap (§4.H) ----

    fn step_bootstrap(&mut self, is_v4: bool, host: &mut dyn Host, now: u64, events: &mut Vec<EngineEvent>) {
        if !self.bootstrap_mut(is_v4).is_due(now) {
            return;
        }
        let stats = {
            let s = self.table(is_v4).stats(now, &self.node_cfg);
            BootstrapStats { good: s.good, dubious: s.dubious, total: s.total }
        };
        let candidates: Vec<BootstrapCandidate> = self
            .table(is_v4)
            .buckets()
            .iter()
            .flat_map(|b| b.nodes.iter())
            .map(|n| BootstrapCandidate {
                id: n.id,
                addr: n.addr,
                good: n.is_good(now, &self.node_cfg),
                last_pinged: n.last_pinged,
            })
            .collect();

        let my_id = self.my_id;
        let cfg = self.cfg;
        let action = {
            let bs = self.bootstrap_mut(is_v4);
            bs.step(&my_id, host, &cfg, now, stats, &candidates)
        };

        match action {
            BootstrapAction::SeedNodes(seeds) => {
                for (id, addr) in seeds {
                    self.observe(id, addr, 0, host, now);
                }
                events.push(EngineEvent::Bootstrap { is_v4, state: BootstrapState::Running });
            }
            BootstrapAction::Probe(probes) => {
                for p in probes {
                    match p {
                        BootstrapProbe::FindNode { id, addr } => {
                            let mut target_bytes = *self.my_id.as_bytes();
                            let mut suffix = [0u8; 1];
                            host.random_bytes(&mut suffix);
                            target_bytes[19] = suffix[0];
                            let target = Id::from_bytes(target_bytes);
                            let tid = transaction::make_tid(PREFIX_FIND_NODE, 0);
                            let mut buf = Vec::new();
                            codec::encode_find_node(&self.my_id, &tid, &target, None, self.client_tag.as_ref(), &mut buf);
                            let _ = self.transport.send(host, addr, &buf);
                            self.table_mut(is_v4).mark_pinged(&id, now);
                        }
                        BootstrapProbe::Ping { id, addr } => {
                            let tid = transaction::make_tid(PREFIX_PING, 0);
                            let mut buf = Vec::new();
                            codec::encode_ping(&self.my_id, &tid, self.client_tag.as_ref(), &mut buf);
                            let _ = self.transport.send(host, addr, &buf);
                            self.table_mut(is_v4).mark_pinged(&id, now);
                        }
                    }
                }
            }
            BootstrapAction::Complete => events.push(EngineEvent::Bootstrap { is_v4, state: BootstrapState::Complete }),
            BootstrapAction::Failed => events.push(EngineEvent::Bootstrap { is_v4, state: BootstrapState::Failed }),
            BootstrapAction::None => {}
        }
    }

    // ---- maintenance (§4.D) ----

    fn confirm_nodes(&mut self, host: &mut dyn Host, now: u64) -> bool {
        let mut fired = false;
        for is_v4 in [true, false] {
            if self.bootstrap_state(is_v4) == BootstrapState::Running {
                continue;
            }
            fired |= self.bucket_maintenance(is_v4, host, now);
            fired |= self.neighbourhood_maintenance(is_v4, host, now);
        }
        fired
    }

    /// A pseudo-random id within the range a bucket with this `first`
    /// occupies: bits through the bucket's split marker (the lowest set bit
    /// of `first`, per `Bucket::middle`) stay fixed, everything below is
    /// randomized (`dht.c`'s `bucket_random`).
    fn random_id_in_bucket(first: &Id, host: &mut dyn Host) -> Id {
        let depth_bit = first.lowbit().map(|b| b + 1).unwrap_or(0);
        let mut rand_buf = [0u8; 20];
        host.random_bytes(&mut rand_buf);
        let mut bytes = *first.as_bytes();
        for bit in depth_bit..160 {
            let byte_idx = (bit / 8) as usize;
            let mask = 0x80u8 >> (bit % 8);
            if rand_buf[byte_idx] & mask != 0 {
                bytes[byte_idx] |= mask;
            } else {
                bytes[byte_idx] &= !mask;
            }
        }
        Id::from_bytes(bytes)
    }

    /// A node to address bucket `idx`'s maintenance query to: a resident of
    /// that bucket, or, if it's empty, the nearest neighbouring bucket that
    /// has one (`dht.c:2328-2339`).
    fn maintenance_dest(table: &RoutingTable, idx: usize) -> Option<SocketAddr> {
        let buckets = table.buckets();
        if let Some(n) = buckets[idx].nodes.first() {
            return Some(n.addr);
        }
        let mut offset = 1usize;
        while idx >= offset || idx + offset < buckets.len() {
            if idx >= offset {
                if let Some(n) = buckets[idx - offset].nodes.first() {
                    return Some(n.addr);
                }
            }
            if idx + offset < buckets.len() {
                if let Some(n) = buckets[idx + offset].nodes.first() {
                    return Some(n.addr);
                }
            }
            offset += 1;
        }
        None
    }

    /// A random resident of bucket `idx`, falling back to the nearest
    /// neighbouring bucket that has one (`dht.c:2273-2281`).
    fn random_node_near(table: &RoutingTable, idx: usize, host: &mut dyn Host) -> Option<SocketAddr> {
        let buckets = table.buckets();
        let pick = |nodes: &[dht_routing_table::Node], host: &mut dyn Host| -> Option<SocketAddr> {
            if nodes.is_empty() {
                return None;
            }
            let mut buf = [0u8; 2];
            host.random_bytes(&mut buf);
            let i = (u16::from_ne_bytes(buf) as usize) % nodes.len();
            Some(nodes[i].addr)
        };
        if let Some(addr) = pick(&buckets[idx].nodes, host) {
            return Some(addr);
        }
        let mut offset = 1usize;
        while idx >= offset || idx + offset < buckets.len() {
            if idx >= offset {
                if let Some(addr) = pick(&buckets[idx - offset].nodes, host) {
                    return Some(addr);
                }
            }
            if idx + offset < buckets.len() {
                if let Some(addr) = pick(&buckets[idx + offset].nodes, host) {
                    return Some(addr);
                }
            }
            offset += 1;
        }
        None
    }

    fn bucket_maintenance(&mut self, is_v4: bool, host: &mut dyn Host, now: u64) -> bool {
        let mut fired = false;
        let bucket_count = self.table(is_v4).buckets().len();
        for idx in 0..bucket_count {
            let (capacity, last_activity, first) = {
                let b = self.table(is_v4).bucket(idx);
                (b.max_count, b.last_activity, b.first)
            };
            let threshold = (600 * 8 / capacity.max(1) as u64).max(30);
            let stale = last_activity.map(|t| now.saturating_sub(t) >= threshold).unwrap_or(true);
            if !stale {
                continue;
            }
            let Some(dest_addr) = Self::maintenance_dest(self.table(is_v4), idx) else { continue };
            let target = Self::random_id_in_bucket(&first, host);

            // Occasionally (1/37) ask for nodes of both address families in
            // the same query, not just the one we'd get by default.
            let mut want_byte = [0u8; 1];
            host.random_bytes(&mut want_byte);
            let want = if (want_byte[0] as usize).is_multiple_of(37) { Some(codec::WANT4 | codec::WANT6) } else { None };

            let tid = transaction::make_tid(PREFIX_FIND_NODE, 0);
            let mut buf = Vec::new();
            codec::encode_find_node(&self.my_id, &tid, &target, want, self.client_tag.as_ref(), &mut buf);
            if self.transport.send(host, dest_addr, &buf).is_ok() {
                fired = true;
            }
        }
        fired
    }

    fn neighbourhood_maintenance(&mut self, is_v4: bool, host: &mut dyn Host, _now: u64) -> bool {
        let my_idx = self.table(is_v4).bucket_index(&self.my_id);
        let Some(dest_addr) = Self::random_node_near(self.table(is_v4), my_idx, host) else { return false };
        let mut target_bytes = *self.my_id.as_bytes();
        let mut suffix = [0u8; 4];
        host.random_bytes(&mut suffix);
        target_bytes[16..20].copy_from_slice(&suffix);
        let target = Id::from_bytes(target_bytes);
        let tid = transaction::make_tid(PREFIX_FIND_NODE, 0);
        let mut buf = Vec::new();
        codec::encode_find_node(&self.my_id, &tid, &target, None, self.client_tag.as_ref(), &mut buf);
        self.transport.send(host, dest_addr, &buf).is_ok()
    }

    // ---- request handlers (§4.I) ----

    fn handle_request(&mut self, kind: MessageKind, m: &ParsedMessage, from: SocketAddr, host: &mut dyn Host, now: u64) {
        if !self.transport.admit_request(now) {
            return;
        }
        if let Some(id) = m.id {
            self.observe(id, from, 1, host, now);
        }
        match kind {
            MessageKind::Ping => self.handle_ping(m, from, host),
            MessageKind::FindNode => self.handle_find_node(m, from, host),
            MessageKind::GetPeers => self.handle_get_peers(m, from, host, now),
            MessageKind::AnnouncePeer => self.handle_announce_peer(m, from, host, now),
            _ => {}
        }
    }

    fn handle_ping(&mut self, m: &ParsedMessage, from: SocketAddr, host: &mut dyn Host) {
        let mut buf = Vec::new();
        codec::encode_pong(&self.my_id, &m.tid, self.client_tag.as_ref(), &mut buf);
        let _ = self.transport.send(host, from, &buf);
    }

    fn handle_find_node(&mut self, m: &ParsedMessage, from: SocketAddr, host: &mut dyn Host) {
        let Some(target) = m.target else { return };
        let want = if m.want != 0 { m.want } else if from.is_ipv4() { codec::WANT4 } else { codec::WANT6 };
        let mut nodes_buf = Vec::new();
        let mut nodes6_buf = Vec::new();
        if want & codec::WANT4 != 0 {
            for n in self.table(true).closest_nodes(&target, 8) {
                n.encode(&mut nodes_buf);
            }
        }
        if want & codec::WANT6 != 0 {
            for n in self.table(false).closest_nodes(&target, 8) {
                n.encode(&mut nodes6_buf);
            }
        }
        let mut buf = Vec::new();
        codec::encode_closest_nodes(
            &ClosestNodesReply {
                my_id: &self.my_id,
                nodes: &nodes_buf,
                nodes6: &nodes6_buf,
                token: None,
                values: &[],
                tid: &m.tid,
                client_tag: self.client_tag.as_ref(),
            },
            &mut buf,
        );
        let _ = self.transport.send(host, from, &buf);
    }

    fn handle_get_peers(&mut self, m: &ParsedMessage, from: SocketAddr, host: &mut dyn Host, now: u64) {
        let Some(info_hash) = m.info_hash else { return };
        let is_v4 = from.is_ipv4();
        let token = self.tokens.make_token(host, &from);
        let values = self.storage.sample(&info_hash, is_v4);
        let mut value_bufs: Vec<Vec<u8>> = Vec::new();
        for v in &values {
            let mut b = Vec::new();
            krpc_proto::addr::encode_peer(v, &mut b);
            value_bufs.push(b);
        }
        let value_refs: Vec<&[u8]> = value_bufs.iter().map(|b| b.as_slice()).collect();

        let mut nodes_buf = Vec::new();
        let mut nodes6_buf = Vec::new();
        for n in self.table(true).closest_nodes(&info_hash, 8) {
            n.encode(&mut nodes_buf);
        }
        for n in self.table(false).closest_nodes(&info_hash, 8) {
            n.encode(&mut nodes6_buf);
        }

        let mut buf = Vec::new();
        codec::encode_closest_nodes(
            &ClosestNodesReply {
                my_id: &self.my_id,
                nodes: &nodes_buf,
                nodes6: &nodes6_buf,
                token: Some(&token),
                values: &value_refs,
                tid: &m.tid,
                client_tag: self.client_tag.as_ref(),
            },
            &mut buf,
        );
        let _ = self.transport.send(host, from, &buf);
        let _ = now;
    }

    fn handle_announce_peer(&mut self, m: &ParsedMessage, from: SocketAddr, host: &mut dyn Host, now: u64) {
        let (Some(info_hash), Some(token)) = (m.info_hash, &m.token) else {
            self.send_error(203, "missing info_hash or token", &m.tid, from, host);
            return;
        };
        if info_hash.is_zero() {
            self.send_error(203, "zero info_hash", &m.tid, from, host);
            return;
        }
        if !self.tokens.token_match(host, token, &from) {
            self.send_error(203, "bad token", &m.tid, from, host);
            return;
        }
        let port = if m.implied_port {
            from.port()
        } else {
            match m.port {
                Some(p) if p != 0 => p,
                _ => {
                    self.send_error(203, "missing or zero port", &m.tid, from, host);
                    return;
                }
            }
        };
        let store_addr = SocketAddr::new(from.ip(), port);
        // Always acknowledge once info_hash/token pass, even if storage
        // rejects the insert: a requester that gets an error here would
        // retry and amplify traffic for no benefit (§4.I).
        let _ = self.storage.store(info_hash, store_addr, now);
        let mut buf = Vec::new();
        codec::encode_peer_announced(&self.my_id, &m.tid, self.client_tag.as_ref(), &mut buf);
        let _ = self.transport.send(host, from, &buf);
    }

    fn send_error(&mut self, code: u16, message: &str, tid: &[u8], from: SocketAddr, host: &mut dyn Host) {
        let mut buf = Vec::new();
        codec::encode_error(code, message, tid, &mut buf);
        let _ = self.transport.send(host, from, &buf);
    }

    // ---- reply dispatch ----

    fn handle_reply_or_error(&mut self, kind: MessageKind, m: &ParsedMessage, from: SocketAddr, host: &mut dyn Host, now: u64) {
        if m.tid.len() != 4 {
            self.transport.blacklist_node(from);
            self.flush_from_searches(from);
            return;
        }
        if !m.nodes.len().is_multiple_of(krpc_proto::addr::NODE4_LEN) || !m.nodes6.len().is_multiple_of(krpc_proto::addr::NODE6_LEN) {
            self.log(LogLevel::Warn, "peer sent a malformed node list; blacklisting");
            self.transport.blacklist_node(from);
            self.flush_from_searches(from);
            return;
        }

        let is_v4 = from.is_ipv4();
        if let Some(id) = m.id {
            self.observe(id, from, 2, host, now);
            self.offer_to_searches(id, from, host, now);
        }

        if kind == MessageKind::Error {
            return;
        }

        if let Some(seq) = transaction::tid_match(&m.tid, PREFIX_PING) {
            let _ = seq;
            return;
        }
        if let Some(_seq) = transaction::tid_match(&m.tid, PREFIX_FIND_NODE) {
            self.learn_nodes_from_reply(m, host, now);
            return;
        }
        if let Some(seq) = transaction::tid_match(&m.tid, PREFIX_GET_PEERS) {
            self.learn_nodes_from_reply(m, host, now);
            self.handle_get_peers_reply(seq, is_v4, m, from, now);
            return;
        }
        if let Some(seq) = transaction::tid_match(&m.tid, PREFIX_ANNOUNCE_PEER) {
            self.handle_announce_reply(seq, is_v4, from);
        }
    }

    fn learn_nodes_from_reply(&mut self, m: &ParsedMessage, host: &mut dyn Host, now: u64) {
        for n in codec::decode_node_infos_v4(&m.nodes) {
            self.observe(n.id, n.addr, 0, host, now);
        }
        for n in codec::decode_node_infos_v6(&m.nodes6) {
            self.observe(n.id, n.addr, 0, host, now);
        }
    }

    fn handle_get_peers_reply(&mut self, seq: u16, is_v4: bool, m: &ParsedMessage, from: SocketAddr, now: u64) {
        let Some(idx) = self.searches.iter().position(|s| s.tid == seq && s.is_v4 == is_v4) else { return };
        let Some(id) = m.id else { return };
        self.searches[idx].insert_node(id, from, true, m.token.as_deref(), now, self.cfg.search_nodes);

        for n in codec::decode_node_infos_v4(&m.nodes).filter(|_| is_v4) {
            self.searches[idx].insert_node(n.id, n.addr, false, None, now, self.cfg.search_nodes);
        }
        for n in codec::decode_node_infos_v6(&m.nodes6).filter(|_| !is_v4) {
            self.searches[idx].insert_node(n.id, n.addr, false, None, now, self.cfg.search_nodes);
        }

        let info_hash = self.searches[idx].target;
        let values: Vec<SocketAddr> = codec::decode_values_v4(&m.values)
            .chain(codec::decode_values_v6(&m.values6))
            .collect();
        self.pending_events.push((values, info_hash));
    }

    fn handle_announce_reply(&mut self, seq: u16, is_v4: bool, from: SocketAddr) {
        if let Some(idx) = self.searches.iter().position(|s| s.tid == seq && s.is_v4 == is_v4) {
            if let Some(n) = self.searches[idx].nodes.iter_mut().find(|n| n.addr == from) {
                n.acked = true;
            }
        }
    }

    fn flush_from_searches(&mut self, addr: SocketAddr) {
        for s in self.searches.iter_mut() {
            s.nodes.retain(|n| n.addr != addr);
        }
    }

    /// `now + min_secs + rand(jitter_secs)`, the same spread-out-scheduling
    /// shape `TokenService::rotate` uses, so maintenance deadlines aren't
    /// perfectly periodic.
    fn jittered_deadline(now: u64, min_secs: u64, jitter_secs: u64, host: &mut dyn Host) -> u64 {
        let mut buf = [0u8; 2];
        host.random_bytes(&mut buf);
        let jitter = u16::from_ne_bytes(buf) as u64 % jitter_secs.max(1);
        now + min_secs + jitter
    }

    // ---- the tick ----

    /// Advances time-driven maintenance and, if `inbound` is present,
    /// processes one datagram. Returns the number of seconds the host
    /// should wait before calling `periodic` again, clamped to `[1,
    /// bucket_expire_max_secs]` so a host that blindly trusts the hint
    /// never busy-loops nor stalls past the maintenance ceiling (§10,
    /// not stated explicitly in §4.I but present in the source's
    /// `tosleep` clamp).
    pub fn periodic(&mut self, inbound: Option<(&[u8], SocketAddr)>, host: &mut dyn Host, now: u64) -> (u64, Vec<EngineEvent>) {
        let mut events = Vec::new();
        self.pending_pings.clear();
        self.pending_events.clear();

        if let Some((bytes, from)) = inbound {
            if self.transport.accept_inbound(&from, host) {
                let mut terminated = bytes.to_vec();
                terminated.push(0);
                if let Ok((kind, m)) = codec::decode(&terminated) {
                    match kind {
                        MessageKind::Ping | MessageKind::FindNode | MessageKind::GetPeers | MessageKind::AnnouncePeer => {
                            self.handle_request(kind, &m, from, host, now);
                        }
                        MessageKind::Reply | MessageKind::Error => {
                            self.handle_reply_or_error(kind, &m, from, host, now);
                        }
                    }
                }
            }
        }

        for (values, info_hash) in std::mem::take(&mut self.pending_events) {
            if !values.is_empty() {
                events.push(EngineEvent::Values { info_hash, peers: values });
            }
        }

        if self.tokens.due(now) {
            self.tokens.rotate(host, now);
        }

        if now >= self.next_expire {
            self.table_v4.expire(&self.node_cfg);
            self.table_v6.expire(&self.node_cfg);
            self.storage.expire(now, self.cfg.storage_peer_expire_secs);
            self.expire_searches(now, &mut events);
            let jitter = self.cfg.bucket_expire_max_secs.saturating_sub(self.cfg.bucket_expire_min_secs);
            self.next_expire = Self::jittered_deadline(now, self.cfg.bucket_expire_min_secs, jitter, host);
        }

        self.step_searches(host, now, &mut events);

        for is_v4 in [true, false] {
            self.step_bootstrap(is_v4, host, now, &mut events);
        }

        let fired = if now >= self.next_confirm {
            let fired = self.confirm_nodes(host, now);
            self.next_confirm = if fired {
                Self::jittered_deadline(now, self.cfg.confirm_soon_min_secs, self.cfg.confirm_soon_jitter_secs, host)
            } else {
                Self::jittered_deadline(now, self.cfg.confirm_lazy_min_secs, self.cfg.confirm_lazy_jitter_secs, host)
            };
            fired
        } else {
            false
        };
        let _ = fired;

        for (is_v4, addr) in std::mem::take(&mut self.pending_pings) {
            let tid = transaction::make_tid(PREFIX_PING, 0);
            let mut buf = Vec::new();
            codec::encode_ping(&self.my_id, &tid, self.client_tag.as_ref(), &mut buf);
            let _ = self.transport.send(host, addr, &buf);
            let _ = is_v4;
        }

        let mut sleep_hint = self.next_confirm.saturating_sub(now).max(1);
        sleep_hint = sleep_hint.min(self.next_expire.saturating_sub(now).max(1).max(sleep_hint));
        sleep_hint = sleep_hint.clamp(1, self.cfg.bucket_expire_max_secs.max(1));
        (sleep_hint, events)
    }
}
