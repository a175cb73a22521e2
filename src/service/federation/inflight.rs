// =============================================================================
// Nucleon Matrix Federation Server - In-Flight Transaction Registry Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-10-12
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Deduplication of concurrent transaction submissions. The first
//   request for an (origin, txnID) pair becomes the leader and processes
//   the transaction; retransmissions arriving while the work is still in
//   flight attach as followers and wait for the leader's result instead
//   of creating more work.
//
// =============================================================================

use dashmap::{mapref::entry::Entry, DashMap};
use ruma::{ServerName, TransactionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::TransactionResults;
use crate::utils;

/// How long a follower waits for the leader before giving up with 408.
pub const FOLLOWER_WAIT: Duration = Duration::from_secs(300);

type ResultReceiver = watch::Receiver<Option<Arc<TransactionResults>>>;
type ResultSender = watch::Sender<Option<Arc<TransactionResults>>>;

/// Registry of transactions currently being worked on, keyed by the
/// NUL-joined (origin, txnID) pair.
#[derive(Clone, Default)]
pub struct InflightTxns {
    txns: Arc<DashMap<String, ResultReceiver>>,
}

/// The role assigned to one inbound request for a transaction.
pub enum TxnAdmission {
    /// This request owns the transaction and must process it.
    Leader(TxnGuard),
    /// The transaction is already being worked on; wait for its result.
    Follower(ResultReceiver),
}

/// Held by the leader for the lifetime of the processing. Dropping the
/// guard without publishing signals "ended without a result" to any
/// followers and frees the registry entry either way.
pub struct TxnGuard {
    key: String,
    tx: ResultSender,
    txns: Arc<DashMap<String, ResultReceiver>>,
}

/// What a follower observed at the end of its wait.
#[derive(Debug)]
pub enum FollowerOutcome {
    /// The leader delivered its final response.
    Result(Arc<TransactionResults>),
    /// The leader finished without producing a response.
    Ended,
    /// The leader is still running after [`FOLLOWER_WAIT`].
    TimedOut,
}

impl InflightTxns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic load-or-store admission for an (origin, txnID) pair.
    pub fn admit(&self, origin: &ServerName, txn_id: &TransactionId) -> TxnAdmission {
        let key = utils::inflight_key(origin.as_str(), txn_id.as_str());
        match self.txns.entry(key.clone()) {
            Entry::Occupied(entry) => TxnAdmission::Follower(entry.get().clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx);
                TxnAdmission::Leader(TxnGuard {
                    key,
                    tx,
                    txns: Arc::clone(&self.txns),
                })
            }
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.txns.len()
    }
}

impl TxnGuard {
    /// Deliver the final response to every attached follower.
    pub fn publish(&self, results: Arc<TransactionResults>) {
        let _ = self.tx.send(Some(results));
    }
}

impl Drop for TxnGuard {
    fn drop(&mut self) {
        self.txns.remove(&self.key);
    }
}

/// Follower wait: bounded by [`FOLLOWER_WAIT`]; the caller's request
/// context bounds it further by dropping this future.
pub async fn await_leader(mut rx: ResultReceiver) -> FollowerOutcome {
    match tokio::time::timeout(FOLLOWER_WAIT, rx.wait_for(|v| v.is_some())).await {
        Err(_) => FollowerOutcome::TimedOut,
        Ok(Err(_)) => FollowerOutcome::Ended,
        Ok(Ok(value)) => match value.as_ref() {
            Some(results) => FollowerOutcome::Result(Arc::clone(results)),
            None => FollowerOutcome::Ended,
        },
    }
}
