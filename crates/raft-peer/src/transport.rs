//! # transport
//!
//! why: keep the peer independent of how rpcs travel between processes
//! relations: implemented by network.rs ClientEnd, called by election.rs and replication.rs
//! what: Transport trait, one request in and at most one reply out

use std::future::Future;

use raft_core::RaftMessage;

/// A client endpoint pointing at one other peer.
///
/// `None` means the request or its reply was lost, the peer is down, or the
/// call timed out. Callers treat it as "no answer" and retry on the next
/// round; it is never an error.
pub trait Transport: Send + Sync + 'static {
    fn call(&self, msg: RaftMessage) -> impl Future<Output = Option<RaftMessage>> + Send;
}
