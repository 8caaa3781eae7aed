//! # network
//!
//! why: exercise peers over a lossy, partitionable fabric without sockets
//! relations: ClientEnd implements transport.rs, servers are Raft handles via RpcHandler
//! what: Network (servers, per-link enable, reliability knobs, rpc counters), ClientEnd

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use raft_core::{NodeId, RaftMessage};
use tokio::time::sleep;
use tracing::trace;

use crate::{Raft, Transport};

/// Something that answers raft requests synchronously.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, msg: RaftMessage) -> Option<RaftMessage>;
}

impl<T: Transport> RpcHandler for Raft<T> {
    fn handle(&self, msg: RaftMessage) -> Option<RaftMessage> {
        Raft::handle(self, msg)
    }
}

#[derive(Default)]
struct Fabric {
    reliable: bool,
    long_delays: bool,
    servers: HashMap<NodeId, Arc<dyn RpcHandler>>,
    enabled: HashSet<(NodeId, NodeId)>,
    counts: HashMap<NodeId, u64>,
    total: u64,
}

/// What happens to one call on an unreliable network, decided up front.
struct Fate {
    delay: Duration,
    drop_request: bool,
    drop_reply: bool,
    timeout: Duration,
}

impl Fate {
    fn roll(reliable: bool, long_delays: bool) -> Self {
        let mut rng = rand::thread_rng();
        let timeout = if long_delays {
            Duration::from_millis(rng.gen_range(0..7000))
        } else {
            Duration::from_millis(rng.gen_range(0..100))
        };
        if reliable {
            return Self {
                delay: Duration::ZERO,
                drop_request: false,
                drop_reply: false,
                timeout,
            };
        }
        Self {
            delay: Duration::from_millis(rng.gen_range(0..27)),
            drop_request: rng.gen_ratio(1, 10),
            drop_reply: rng.gen_ratio(1, 10),
            timeout,
        }
    }
}

/// In-process network connecting [`ClientEnd`]s to registered servers.
///
/// Links are directed and start disabled. A call over a disabled link, or
/// to a missing server, fails after a delay, like a real rpc timing out.
#[derive(Clone)]
pub struct Network {
    fabric: Arc<Mutex<Fabric>>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Self {
            fabric: Arc::new(Mutex::new(Fabric {
                reliable: true,
                ..Fabric::default()
            })),
        }
    }

    fn fabric(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An endpoint `from` uses to call server `to`.
    pub fn client_end(&self, from: NodeId, to: NodeId) -> ClientEnd {
        ClientEnd {
            net: self.clone(),
            from,
            to,
        }
    }

    pub fn add_server(&self, id: NodeId, handler: Arc<dyn RpcHandler>) {
        self.fabric().servers.insert(id, handler);
    }

    pub fn remove_server(&self, id: NodeId) {
        self.fabric().servers.remove(&id);
    }

    /// Enables or disables the directed link `from -> to`.
    pub fn enable(&self, from: NodeId, to: NodeId, enabled: bool) {
        let mut fabric = self.fabric();
        if enabled {
            fabric.enabled.insert((from, to));
        } else {
            fabric.enabled.remove(&(from, to));
        }
    }

    /// When unreliable, calls are delayed a little and about one in ten
    /// requests and one in ten replies are lost.
    pub fn set_reliable(&self, reliable: bool) {
        self.fabric().reliable = reliable;
    }

    /// Calls over disabled links take up to seven seconds to fail.
    pub fn set_long_delays(&self, long_delays: bool) {
        self.fabric().long_delays = long_delays;
    }

    /// Requests delivered to `server` so far.
    pub fn rpc_count(&self, server: NodeId) -> u64 {
        self.fabric().counts.get(&server).copied().unwrap_or(0)
    }

    pub fn total_count(&self) -> u64 {
        self.fabric().total
    }

    /// Drops every server, breaking the cycle between peers and the network.
    pub fn cleanup(&self) {
        self.fabric().servers.clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> (Option<Arc<dyn RpcHandler>>, Fate) {
        let mut fabric = self.fabric();
        fabric.total += 1;
        let fate = Fate::roll(fabric.reliable, fabric.long_delays);
        if !fabric.enabled.contains(&(from, to)) {
            return (None, fate);
        }
        let server = fabric.servers.get(&to).cloned();
        if server.is_some() {
            *fabric.counts.entry(to).or_default() += 1;
        }
        (server, fate)
    }

    /// Whether `server` is still the one registered at `to` and reachable from `from`.
    fn still_routed(&self, from: NodeId, to: NodeId, server: &Arc<dyn RpcHandler>) -> bool {
        let fabric = self.fabric();
        fabric.enabled.contains(&(from, to))
            && fabric
                .servers
                .get(&to)
                .is_some_and(|current| Arc::ptr_eq(current, server))
    }

    async fn deliver(&self, from: NodeId, to: NodeId, msg: RaftMessage) -> Option<RaftMessage> {
        let (server, fate) = self.route(from, to);
        let Some(server) = server else {
            sleep(fate.timeout).await;
            return None;
        };

        if !fate.delay.is_zero() {
            sleep(fate.delay).await;
        }
        if fate.drop_request {
            trace!(from, to, kind = msg.kind(), "request lost");
            sleep(fate.timeout).await;
            return None;
        }

        let reply = server.handle(msg);

        // the server was disconnected or replaced while handling the request
        if !self.still_routed(from, to, &server) {
            sleep(fate.timeout).await;
            return None;
        }
        if fate.drop_reply {
            trace!(from, to, "reply lost");
            return None;
        }
        reply
    }
}

/// Calls one server over a [`Network`].
#[derive(Clone)]
pub struct ClientEnd {
    net: Network,
    from: NodeId,
    to: NodeId,
}

impl Transport for ClientEnd {
    fn call(&self, msg: RaftMessage) -> impl std::future::Future<Output = Option<RaftMessage>> + Send {
        let net = self.net.clone();
        let (from, to) = (self.from, self.to);
        async move { net.deliver(from, to, msg).await }
    }
}
