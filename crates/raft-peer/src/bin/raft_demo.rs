//! # raft-demo
//!
//! why: watch a small cluster elect a leader and agree on commands
//! relations: runs raft-peer peers over the in-process Network with in-memory storage
//! what: clap cli, tracing setup, one cluster run that prints applied commands

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use raft_peer::{ApplyMsg, ClientEnd, Network, NodeId, Raft, RaftConfig};
use raft_storage::InMemoryStorage;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "raft-demo", about = "Run a local raft cluster over a simulated network")]
struct Cli {
    /// Number of peers in the cluster
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Number of commands to submit once a leader exists
    #[arg(long, default_value_t = 5)]
    commands: usize,

    /// Optional json file with timing configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drop and delay messages at random
    #[arg(long)]
    unreliable: bool,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if cli.nodes == 0 {
        bail!("a cluster needs at least one node");
    }
    let config = match &cli.config {
        Some(path) => RaftConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RaftConfig::default(),
    };

    let net = Network::new();
    net.set_reliable(!cli.unreliable);

    let mut rafts = Vec::with_capacity(cli.nodes);
    for me in 0..cli.nodes as NodeId {
        let ends: Vec<ClientEnd> = (0..cli.nodes as NodeId).map(|to| net.client_end(me, to)).collect();
        let (apply_tx, apply_rx) = mpsc::channel(config.apply_channel_capacity);
        let raft = Raft::with_config(ends, me, InMemoryStorage::new(), apply_tx, config.clone())?;
        net.add_server(me, Arc::new(raft.clone()));
        tokio::spawn(print_applied(me, apply_rx));
        rafts.push(raft);
    }
    for from in 0..cli.nodes as NodeId {
        for to in 0..cli.nodes as NodeId {
            net.enable(from, to, true);
        }
    }

    let mut submitted = 0;
    while submitted < cli.commands {
        let Some(leader) = wait_for_leader(&rafts).await else {
            bail!("no leader elected");
        };
        let command = format!("command-{submitted}");
        match leader.start(command.clone().into_bytes()) {
            Ok(proposal) => {
                info!(leader = leader.me(), index = proposal.index, term = proposal.term, %command, "submitted");
                submitted += 1;
            }
            Err(err) => warn!(leader = leader.me(), %err, "submit refused, retrying"),
        }
        sleep(Duration::from_millis(50)).await;
    }

    // give followers a few heartbeats to catch up before shutting down
    sleep(config.heartbeat() * 5).await;
    for raft in &rafts {
        let status = raft.status();
        info!(
            node = status.id,
            state = ?status.state,
            term = status.term,
            commit_index = status.commit_index,
            last_applied = status.last_applied,
            "final status"
        );
        raft.kill();
    }
    net.cleanup();
    Ok(())
}

async fn wait_for_leader(rafts: &[Raft<ClientEnd>]) -> Option<&Raft<ClientEnd>> {
    let search = async {
        loop {
            if let Some(leader) = rafts.iter().find(|raft| raft.get_state().1) {
                return leader;
            }
            sleep(Duration::from_millis(20)).await;
        }
    };
    timeout(Duration::from_secs(10), search).await.ok()
}

async fn print_applied(me: NodeId, mut apply_rx: mpsc::Receiver<ApplyMsg>) {
    while let Some(msg) = apply_rx.recv().await {
        match msg {
            ApplyMsg::Command { index, term, command } => {
                println!("node {me} applied #{index} (term {term}): {}", String::from_utf8_lossy(&command));
            }
            ApplyMsg::Snapshot { index, .. } => println!("node {me} received snapshot through #{index}"),
        }
    }
}
