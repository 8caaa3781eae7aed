//! # cluster harness
//!
//! why: drive whole clusters through partitions, crashes and restarts
//! relations: shared by the raft-peer integration tests, runs peers over raft_peer::Network
//! what: Cluster (start/crash/connect peers, find leaders, reach agreement), applied-log checks

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use raft_peer::{ApplyMsg, ClientEnd, Network, NodeId, Raft, RaftConfig};
use raft_storage::InMemoryStorage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Upper bound on how long any election should take.
pub const ELECTION_TIMEOUT: Duration = Duration::from_secs(1);

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn cmd(n: u64) -> Vec<u8> {
    format!("cmd-{n}").into_bytes()
}

pub fn random_cmd() -> Vec<u8> {
    cmd(rand::thread_rng().gen())
}

pub fn random_sleep(max: Duration) -> Duration {
    rand::thread_rng().gen_range(Duration::ZERO..max)
}

type AppliedLog = BTreeMap<u64, Vec<u8>>;

/// Everything every peer has applied, checked on each delivery.
struct Applied {
    logs: Vec<AppliedLog>,
    last_applied: Vec<u64>,
    error: Option<String>,
}

impl Applied {
    fn record(&mut self, server: usize, index: u64, command: Vec<u8>) {
        if self.error.is_some() {
            return;
        }
        let expected = self.last_applied[server] + 1;
        if index != expected {
            self.error = Some(format!(
                "server {server} applied index {index} out of order, expected {expected}"
            ));
            return;
        }
        for (other, log) in self.logs.iter().enumerate() {
            if let Some(existing) = log.get(&index) {
                if *existing != command {
                    self.error = Some(format!(
                        "commit index={index} server={server} {:?} != server={other} {:?}",
                        String::from_utf8_lossy(&command),
                        String::from_utf8_lossy(existing)
                    ));
                    return;
                }
            }
        }
        self.logs[server].insert(index, command);
        self.last_applied[server] = index;
    }

    fn install(&mut self, server: usize, index: u64, log: AppliedLog) {
        self.logs[server] = log;
        self.last_applied[server] = index;
    }
}

pub struct Cluster {
    pub n: usize,
    pub net: Network,
    config: RaftConfig,
    rafts: Vec<Option<Raft<ClientEnd>>>,
    storages: Vec<InMemoryStorage>,
    connected: Vec<bool>,
    applied: Arc<Mutex<Applied>>,
    appliers: Vec<Option<JoinHandle<()>>>,
    snapshot_every: Option<u64>,
}

impl Cluster {
    pub fn new(n: usize, reliable: bool) -> Self {
        Self::build(n, reliable, None)
    }

    /// Every peer's application snapshots whenever it applies a multiple of `every`.
    pub fn with_snapshots(n: usize, reliable: bool, every: u64) -> Self {
        Self::build(n, reliable, Some(every))
    }

    fn build(n: usize, reliable: bool, snapshot_every: Option<u64>) -> Self {
        init_tracing();
        let net = Network::new();
        net.set_reliable(reliable);

        let mut cluster = Self {
            n,
            net,
            config: RaftConfig::default(),
            rafts: (0..n).map(|_| None).collect(),
            storages: (0..n).map(|_| InMemoryStorage::new()).collect(),
            connected: vec![false; n],
            applied: Arc::new(Mutex::new(Applied {
                logs: vec![AppliedLog::new(); n],
                last_applied: vec![0; n],
                error: None,
            })),
            appliers: (0..n).map(|_| None).collect(),
            snapshot_every,
        };
        for i in 0..n {
            cluster.start1(i);
        }
        for i in 0..n {
            cluster.connect(i);
        }
        cluster
    }

    fn applied(&self) -> MutexGuard<'_, Applied> {
        self.applied.lock().unwrap()
    }

    pub fn raft(&self, i: usize) -> &Raft<ClientEnd> {
        self.rafts[i].as_ref().expect("peer is not running")
    }

    pub fn is_running(&self, i: usize) -> bool {
        self.rafts[i].is_some()
    }

    pub fn storage(&self, i: usize) -> &InMemoryStorage {
        &self.storages[i]
    }

    /// Starts (or restarts) peer `i` from what it last persisted. The peer
    /// stays disconnected until [`connect`](Self::connect).
    pub fn start1(&mut self, i: usize) {
        self.crash1(i);

        let storage = self.storages[i].deep_copy();
        self.storages[i] = storage.clone();

        let (state, snapshot) = raft_storage::load(&storage).unwrap();
        let restored: AppliedLog = if snapshot.is_empty() {
            AppliedLog::new()
        } else {
            serde_json::from_slice(&snapshot).unwrap()
        };
        self.applied().install(i, state.log.snapshot_index(), restored);

        let me = i as NodeId;
        let ends: Vec<ClientEnd> = (0..self.n as NodeId).map(|to| self.net.client_end(me, to)).collect();
        let (apply_tx, apply_rx) = mpsc::channel(self.config.apply_channel_capacity);
        let raft = Raft::with_config(ends, me, storage, apply_tx, self.config.clone()).unwrap();

        self.net.add_server(me, Arc::new(raft.clone()));
        self.appliers[i] = Some(tokio::spawn(consume(
            i,
            apply_rx,
            raft.clone(),
            Arc::clone(&self.applied),
            self.snapshot_every,
        )));
        self.rafts[i] = Some(raft);
    }

    /// Kills peer `i`. Its persisted state is copied so the dead incarnation
    /// cannot write over what the next one reads.
    pub fn crash1(&mut self, i: usize) {
        self.disconnect(i);
        self.net.remove_server(i as NodeId);
        if let Some(raft) = self.rafts[i].take() {
            raft.kill();
        }
        if let Some(applier) = self.appliers[i].take() {
            applier.abort();
        }
        self.storages[i] = self.storages[i].deep_copy();
    }

    pub fn connect(&mut self, i: usize) {
        self.connected[i] = true;
        for j in 0..self.n {
            if self.connected[j] {
                self.net.enable(i as NodeId, j as NodeId, true);
                self.net.enable(j as NodeId, i as NodeId, true);
            }
        }
    }

    pub fn disconnect(&mut self, i: usize) {
        self.connected[i] = false;
        for j in 0..self.n {
            self.net.enable(i as NodeId, j as NodeId, false);
            self.net.enable(j as NodeId, i as NodeId, false);
        }
    }

    fn running_connected(&self) -> impl Iterator<Item = (usize, &Raft<ClientEnd>)> {
        self.rafts
            .iter()
            .enumerate()
            .filter(|(i, _)| self.connected[*i])
            .filter_map(|(i, raft)| raft.as_ref().map(|raft| (i, raft)))
    }

    /// Finds the single leader among connected peers, retrying for a while.
    pub async fn check_one_leader(&self) -> usize {
        for _ in 0..10 {
            sleep(Duration::from_millis(rand::thread_rng().gen_range(450..550))).await;

            let mut leaders: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
            for (i, raft) in self.running_connected() {
                let (term, is_leader) = raft.get_state();
                if is_leader {
                    leaders.entry(term).or_default().push(i);
                }
            }
            for (term, in_term) in &leaders {
                assert!(in_term.len() <= 1, "term {term} has {} leaders", in_term.len());
            }
            if let Some((_, in_term)) = leaders.iter().next_back() {
                return in_term[0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// Connected peers all agree on the term; returns it.
    pub fn check_terms(&self) -> u64 {
        let mut agreed = None;
        for (_, raft) in self.running_connected() {
            let (term, _) = raft.get_state();
            match agreed {
                None => agreed = Some(term),
                Some(existing) => assert_eq!(existing, term, "servers disagree on term"),
            }
        }
        agreed.unwrap_or(0)
    }

    pub fn check_no_leader(&self) {
        for (i, raft) in self.running_connected() {
            assert!(!raft.get_state().1, "expected no leader among connected servers, but {i} claims to be leader");
        }
    }

    /// How many peers have applied `index`, and what they applied there.
    pub fn n_committed(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        let applied = self.applied();
        if let Some(error) = &applied.error {
            panic!("{error}");
        }
        let mut count = 0;
        let mut command: Option<Vec<u8>> = None;
        for log in &applied.logs {
            if let Some(found) = log.get(&index) {
                if let Some(previous) = &command {
                    assert_eq!(previous, found, "committed values do not match at index {index}");
                }
                count += 1;
                command = Some(found.clone());
            }
        }
        (count, command)
    }

    /// Waits until at least `n` peers applied `index`. Gives up with `None`
    /// if a peer moves past `start_term`.
    pub async fn wait(&self, index: u64, n: usize, start_term: Option<u64>) -> Option<Vec<u8>> {
        let mut backoff = Duration::from_millis(10);
        for _ in 0..30 {
            if self.n_committed(index).0 >= n {
                break;
            }
            sleep(backoff).await;
            if backoff < Duration::from_secs(1) {
                backoff *= 2;
            }
            if let Some(start_term) = start_term {
                let moved_on = self
                    .rafts
                    .iter()
                    .flatten()
                    .any(|raft| raft.get_state().0 > start_term);
                if moved_on {
                    return None;
                }
            }
        }
        let (count, command) = self.n_committed(index);
        assert!(count >= n, "only {count} decided for index {index}; wanted {n}");
        command
    }

    /// Submits `command` until `expected` peers apply it; returns its index.
    pub async fn one(&self, command: &[u8], expected: usize, retry: bool) -> u64 {
        let started = Instant::now();
        let mut next = 0;
        while started.elapsed() < Duration::from_secs(10) {
            let mut index = None;
            for _ in 0..self.n {
                next = (next + 1) % self.n;
                if !self.connected[next] {
                    continue;
                }
                if let Some(raft) = &self.rafts[next] {
                    if let Ok(proposal) = raft.start(command.to_vec()) {
                        index = Some(proposal.index);
                        break;
                    }
                }
            }

            match index {
                Some(index) => {
                    let submitted = Instant::now();
                    while submitted.elapsed() < Duration::from_secs(2) {
                        let (count, found) = self.n_committed(index);
                        if count > 0 && count >= expected && found.as_deref() == Some(command) {
                            return index;
                        }
                        sleep(Duration::from_millis(20)).await;
                    }
                    assert!(retry, "one({:?}) failed to reach agreement", String::from_utf8_lossy(command));
                }
                None => sleep(Duration::from_millis(50)).await,
            }
        }
        panic!("one({:?}) failed to reach agreement", String::from_utf8_lossy(command));
    }

    /// Kills every peer and fails if any peer applied something inconsistent.
    pub fn end(mut self) {
        self.shutdown();
        if let Some(error) = &self.applied().error {
            panic!("{error}");
        }
    }

    fn shutdown(&mut self) {
        for raft in self.rafts.iter_mut().filter_map(Option::take) {
            raft.kill();
        }
        for applier in self.appliers.iter_mut().filter_map(Option::take) {
            applier.abort();
        }
        self.net.cleanup();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn consume(
    server: usize,
    mut apply_rx: mpsc::Receiver<ApplyMsg>,
    raft: Raft<ClientEnd>,
    applied: Arc<Mutex<Applied>>,
    snapshot_every: Option<u64>,
) {
    while let Some(msg) = apply_rx.recv().await {
        match msg {
            ApplyMsg::Command { index, command, .. } => {
                let snapshot = {
                    let mut applied = applied.lock().unwrap();
                    applied.record(server, index, command);
                    match snapshot_every {
                        Some(every) if index % every == 0 => {
                            Some(serde_json::to_vec(&applied.logs[server]).unwrap())
                        }
                        _ => None,
                    }
                };
                if let Some(data) = snapshot {
                    if let Err(err) = raft.snapshot(index, data) {
                        applied.lock().unwrap().error = Some(format!("server {server} snapshot failed: {err}"));
                    }
                }
            }
            ApplyMsg::Snapshot { term, index, data } => match raft.cond_install_snapshot(term, index, data.clone()) {
                Ok(true) => {
                    let log: AppliedLog = serde_json::from_slice(&data).unwrap();
                    applied.lock().unwrap().install(server, index, log);
                }
                Ok(false) => {}
                Err(err) => {
                    applied.lock().unwrap().error = Some(format!("server {server} install failed: {err}"));
                }
            },
        }
    }
}
