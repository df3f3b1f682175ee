//! Drain scheduling.
//!
//! Each circuit direction owns a `DrainTrigger`: a task parked on a
//! `Notify` that runs one drain pass per wake-up. Arming an idle trigger
//! wakes it; arming a trigger that is already armed or mid-pass leaves at
//! most one further pass pending, so bursts of writes coalesce.
//!
//! A pass is ordinary blocking code (it waits on the circuit's byte
//! buffers). On a multi-thread runtime it runs under `block_in_place` so the
//! worker's other tasks migrate away while it blocks. Triggers share a
//! `DrainLane`, and a pass holds one of the lane's permits while it runs, so
//! no more passes block at once than the lane has workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

/// Which half of a circuit a buffer, trigger or callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Wire bytes arriving at the circuit and the messages decoded from them.
    Inbound,
    /// Frames produced by `send`, waiting to be put on the wire.
    Outbound,
}

/// Consumer of drained data.
///
/// Callbacks are registered weakly on a circuit; a callback is invoked from
/// a pool worker and must not block for long.
pub trait DataCallback: Send + Sync {
    /// Size of the scratch buffer to drain into for `direction`. Returning 0
    /// opts out of that direction.
    fn buffer_for(&self, circuit_id: u32, direction: Direction) -> usize;

    /// Outbound: `data` is raw wire bytes and `msg_id` is 0.
    /// Inbound: `data` is one reassembled message.
    fn on_ready(&self, circuit_id: u32, direction: Direction, data: &[u8], msg_id: u32);
}

/// A runtime that runs drain passes, and the number it may run at once.
#[derive(Debug, Clone)]
pub struct DrainLane {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl DrainLane {
    pub fn new(handle: Handle, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// Coalescing wake-up for one drain direction of one circuit.
#[derive(Debug)]
pub struct DrainTrigger {
    notify: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl DrainTrigger {
    /// Spawn the trigger's task on `lane`. `pass` runs once per wake-up;
    /// returning `false` ends the task.
    pub fn spawn<F>(lane: &DrainLane, circuit_id: u32, direction: Direction, mut pass: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let waiter = notify.clone();
        let stopped = Arc::new(AtomicBool::new(false));
        let halted = stopped.clone();
        let permits = lane.permits.clone();
        let may_block_in_place = lane.handle.runtime_flavor() == RuntimeFlavor::MultiThread;

        let task = lane.handle.spawn(async move {
            loop {
                waiter.notified().await;
                if halted.load(Ordering::Acquire) {
                    break;
                }
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                // Stopped while queued for a permit.
                if halted.load(Ordering::Acquire) {
                    break;
                }
                let keep_going = if may_block_in_place {
                    tokio::task::block_in_place(&mut pass)
                } else {
                    pass()
                };
                if !keep_going {
                    break;
                }
            }
            tracing::debug!(circuit_id, ?direction, "drain trigger finished");
        });

        Self {
            notify,
            stopped,
            task,
        }
    }

    /// Request a pass. Never blocks.
    pub fn arm(&self) {
        if !self.stopped.load(Ordering::Acquire) {
            self.notify.notify_one();
        }
    }

    /// Cancel the task. A pass already running completes first; no pass
    /// starts after this returns.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for DrainTrigger {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
