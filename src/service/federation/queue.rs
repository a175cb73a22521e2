// =============================================================================
// Nucleon Matrix Federation Server - Room Worker Queue Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-10-12
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Per-room FIFO queues with lazily spawned, self-terminating workers.
//   Work within one room is strictly serialized; rooms proceed in
//   parallel. At most one worker exists per room at any time, guarded by
//   a compare-and-set on the worker's running flag.
//
// =============================================================================

use dashmap::DashMap;
use ruma::{OwnedRoomId, OwnedServerName, RoomId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::service::pdu::HeaderedPdu;
use crate::Error;

/// One unit of per-event work queued to a room's worker.
pub struct InputTask {
    /// The server that sent the enclosing transaction.
    pub origin: OwnedServerName,
    /// The parsed, version-tagged event.
    pub event: HeaderedPdu,
    /// Cancelled when the originating request goes away. Checked once,
    /// before the work starts; running work is never interrupted by it.
    pub cancelled: CancellationToken,
    /// Completion handle; carries the outcome back to the transaction.
    pub done: oneshot::Sender<TaskOutcome>,
}

/// Written by the worker exactly once, read only after `done` fires.
#[derive(Debug)]
pub struct TaskOutcome {
    pub err: Option<Error>,
    pub duration: Duration,
}

/// FIFO queue plus the spawn gate for a single room.
#[derive(Default)]
pub struct RoomWorker {
    queue: Mutex<VecDeque<InputTask>>,
    running: AtomicBool,
}

impl RoomWorker {
    /// Append a task. The caller must follow up with [`try_claim`] and
    /// spawn the worker if the claim succeeds.
    ///
    /// [`try_claim`]: RoomWorker::try_claim
    pub fn push(&self, task: InputTask) {
        self.queue.lock().unwrap().push_back(task);
    }

    /// The `false -> true` edge of the running flag is the admission gate:
    /// whoever wins it spawns the worker task.
    pub fn try_claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pop the next task in FIFO order. On observing an empty queue the
    /// worker parks: `running` is reset under the same lock producers push
    /// through, so a concurrent push either lands before this observation
    /// or happens after the reset and wins [`try_claim`] again. No task
    /// can be stranded between a drain and a respawn.
    pub fn next_task(&self) -> Option<InputTask> {
        let mut queue = self.queue.lock().unwrap();
        match queue.pop_front() {
            Some(task) => {
                if queue.is_empty() {
                    // Release the backing storage after a burst.
                    *queue = VecDeque::new();
                }
                Some(task)
            }
            None => {
                self.running.store(false, Ordering::Release);
                None
            }
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Process-wide map of room ID to its worker record. Insertion is
/// idempotent under concurrent access.
#[derive(Default)]
pub struct RoomWorkers {
    workers: DashMap<OwnedRoomId, Arc<RoomWorker>>,
}

impl RoomWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, room_id: &RoomId) -> Arc<RoomWorker> {
        let worker = self.workers.entry(room_id.to_owned()).or_default();
        Arc::clone(&worker)
    }

    #[cfg(test)]
    pub fn room_count(&self) -> usize {
        self.workers.len()
    }
}
