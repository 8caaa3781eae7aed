//! # applier
//!
//! why: deliver committed entries to the application without holding the state lock
//! relations: spawned by peer.rs, drains raft-core's apply batches, woken via the apply notify
//! what: the apply loop

use std::sync::Arc;

use raft_core::ApplyMsg;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::peer::Shared;
use crate::Transport;

/// Sends every committed entry, in index order, exactly once.
///
/// Stops when the peer is killed or the receiver is dropped.
pub(crate) async fn run<T: Transport>(shared: Arc<Shared<T>>, apply_tx: mpsc::Sender<ApplyMsg>) {
    while !shared.killed() {
        let batch = shared.lock().node.take_apply_batch();
        if batch.is_empty() {
            tokio::select! {
                _ = shared.apply.notified() => {}
                _ = sleep(shared.config.heartbeat()) => {}
                _ = apply_tx.closed() => break,
            }
            continue;
        }

        for msg in batch {
            if shared.killed() {
                break;
            }
            trace!(node = shared.me, index = msg.index(), "applying");
            if apply_tx.send(msg).await.is_err() {
                debug!(node = shared.me, "apply receiver dropped");
                return;
            }
        }
    }
    debug!(node = shared.me, "applier stopped");
}
