//! The background thread that emerges queued blocks.
//!
//! One long-lived thread parks on a condition variable until
//! [`EmergeWorker::trigger`] is called, then pops the [`EmergeScheduler`]
//! until it is empty. Storage is called with no lock held; successful
//! results are inserted into the environment under the environment lock.
//! Every attempt is reported as an [`EmergeOutcome`] for the server loop
//! to collect on its next tick.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::coords::BlockPos;
use crate::emerge::EmergeScheduler;
use crate::error::{ServerError, StorageError};
use crate::services::WorldStorage;
use crate::shared::SharedState;

/// Name of the worker thread.
pub const WORKER_THREAD_NAME: &str = "cairn-emerge";

/// Result of one emerge attempt.
#[derive(Debug)]
pub struct EmergeOutcome {
    /// The block that was attempted.
    pub pos: BlockPos,
    /// `Ok` once the block is in the environment.
    pub result: Result<(), StorageError>,
}

#[derive(Debug, Default)]
struct Signal {
    /// A trigger arrived since the worker last looked. Single slot.
    pending: bool,
    stop: bool,
}

#[derive(Debug, Default)]
struct Wake {
    signal: Mutex<Signal>,
    condvar: Condvar,
}

impl Wake {
    fn stopping(&self) -> bool {
        self.signal.lock().stop
    }
}

/// Handle to the emerge thread.
pub struct EmergeWorker {
    wake: Arc<Wake>,
    outcomes: Receiver<EmergeOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl EmergeWorker {
    /// Spawns the worker. It stays idle until the first trigger.
    pub fn spawn(
        scheduler: Arc<EmergeScheduler>,
        storage: Arc<dyn WorldStorage>,
        shared: Arc<SharedState>,
    ) -> Result<Self, ServerError> {
        let wake = Arc::new(Wake::default());
        let (tx, outcomes) = unbounded();

        let thread_wake = Arc::clone(&wake);
        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || run(&thread_wake, &scheduler, storage.as_ref(), &shared, &tx))
            .map_err(ServerError::WorkerSpawn)?;

        debug!("emerge worker started");
        Ok(Self {
            wake,
            outcomes,
            handle: Some(handle),
        })
    }

    /// Wakes the worker. Triggers that arrive while a pass is running
    /// coalesce into exactly one more pass.
    pub fn trigger(&self) {
        let mut signal = self.wake.signal.lock();
        signal.pending = true;
        self.wake.condvar.notify_one();
    }

    /// Outcomes reported since the last call, in completion order.
    pub fn drain_outcomes(&self) -> Vec<EmergeOutcome> {
        self.outcomes.try_iter().collect()
    }

    /// Whether the thread is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the worker and waits for it. The block being emerged, if
    /// any, is finished first; the rest of the queue is left alone.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let mut signal = self.wake.signal.lock();
            signal.stop = true;
            self.wake.condvar.notify_all();
        }
        if handle.join().is_err() {
            warn!("emerge worker panicked");
        }
        debug!("emerge worker stopped");
    }
}

impl Drop for EmergeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    wake: &Wake,
    scheduler: &EmergeScheduler,
    storage: &dyn WorldStorage,
    shared: &SharedState,
    tx: &Sender<EmergeOutcome>,
) {
    loop {
        {
            let mut signal = wake.signal.lock();
            while !signal.pending && !signal.stop {
                wake.condvar.wait(&mut signal);
            }
            if signal.stop {
                return;
            }
            signal.pending = false;
        }

        while let Some(pos) = scheduler.next_emerge() {
            let result = storage.load_or_generate(pos).map(|block| {
                shared.lock_env().insert_block(pos, block);
            });
            match &result {
                Ok(()) => trace!(pos = %pos, "block emerged"),
                Err(e) => warn!(pos = %pos, error = %e, "emerge failed"),
            }
            if tx.send(EmergeOutcome { pos, result }).is_err() {
                return;
            }
            if wake.stopping() {
                return;
            }
        }
    }
}
