/**
 * manager.rs
 * One worker per library, reused across requests.
 *
 * Each library has a slot guarded by a fair async mutex. Holding the
 * slot lock IS the Busy state: callers for the same library queue on
 * the lock in FIFO order and observe a strictly serialized worker,
 * while different libraries proceed in parallel. Because a spawn also
 * happens under the slot lock, two racing callers can never start two
 * workers for one library.
 *
 * A background sweep reclaims workers that sit idle past their
 * timeout and evicts handles whose process died while idle. Shutdown,
 * per library or pool-wide, asks the worker(s) to exit, polls
 * briefly, then kills the stragglers.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::model::{GlobalSettings, LibraryConfig};
use crate::errors::{BridgeError, Result};
use crate::pool::worker::{WorkerProcess, WorkerSpawner};
use crate::rpc::RpcChannel;

/// How often idle workers are checked for expiry.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Grace polling after a terminate request: 10 rounds of 100ms.
const STOP_POLL_ROUNDS: u32 = 10;
const STOP_POLL_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Busy,
    Idle,
    Terminating,
    Dead,
}

struct WorkerHandle {
    process: Box<dyn WorkerProcess>,
    channel: RpcChannel,
    state: WorkerState,
    last_activity: Instant,
}

impl WorkerHandle {
    /// A worker is reusable only while its process lives and its
    /// channel has never timed out or lost framing.
    fn is_reusable(&mut self) -> bool {
        self.state != WorkerState::Dead
            && self.channel.is_open()
            && !self.channel.is_suspect()
            && self.process.is_alive()
    }
}

struct WorkerSlot {
    library: Arc<LibraryConfig>,
    worker: Option<WorkerHandle>,
    // Set by shutdown_library; callers still queued on the slot fail
    closed: bool,
}

type SlotRef = Arc<Mutex<WorkerSlot>>;

pub struct WorkerPoolManager {
    spawner: Arc<dyn WorkerSpawner>,
    globals: Arc<GlobalSettings>,
    slots: StdMutex<HashMap<String, SlotRef>>,
    shutting_down: AtomicBool,
    sweep_task: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerPoolManager {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, globals: Arc<GlobalSettings>) -> Arc<Self> {
        Arc::new(WorkerPoolManager {
            spawner,
            globals,
            slots: StdMutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            sweep_task: StdMutex::new(None),
        })
    }

    /// Start the periodic idle sweep. Safe to skip in tests, which
    /// drive `sweep_once` directly.
    pub fn start_sweep(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.sweep_once().await;
            }
        });
        *lock_std(&self.sweep_task) = Some(handle);
    }

    /// Lease the library's worker, spawning one if needed. The lease
    /// holds the slot for its whole lifetime; same-library callers
    /// queue behind it in arrival order.
    pub async fn acquire(&self, library: Arc<LibraryConfig>) -> Result<LeasedWorker> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::Protocol("worker pool is shut down".to_string()));
        }

        let slot = self.slot_for(&library);
        let mut guard = slot.lock_owned().await;

        // Shutdown may have begun while queued on the slot
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BridgeError::Protocol("worker pool is shut down".to_string()));
        }
        if guard.closed {
            return Err(BridgeError::Protocol(format!(
                "worker for library '{}' was shut down",
                guard.library.name
            )));
        }

        let reusable = guard
            .worker
            .as_mut()
            .map(WorkerHandle::is_reusable)
            .unwrap_or(false);

        if !reusable {
            if let Some(handle) = guard.worker.take() {
                debug!(library = %guard.library.name, "replacing unusable worker");
                stop_handle(handle, false).await;
            }
            let spawned = self
                .spawner
                .spawn(Arc::clone(&guard.library), Arc::clone(&self.globals))
                .await?;
            guard.worker = Some(WorkerHandle {
                process: spawned.process,
                channel: spawned.channel,
                state: WorkerState::Busy,
                last_activity: Instant::now(),
            });
        }

        if let Some(handle) = guard.worker.as_mut() {
            handle.state = WorkerState::Busy;
        }

        Ok(LeasedWorker {
            guard,
            call_timeout: self.globals.call_timeout(),
        })
    }

    /// Reclaim workers idle past their timeout, and evict handles
    /// whose process died or whose channel went bad while idle. Busy
    /// slots (locked by a lease) are skipped and picked up on a later
    /// pass.
    pub async fn sweep_once(&self) {
        let slots: Vec<SlotRef> = lock_std(&self.slots).values().cloned().collect();

        for slot in slots {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };

            let dead = guard
                .worker
                .as_mut()
                .map(|h| !h.is_reusable())
                .unwrap_or(false);
            if dead {
                if let Some(handle) = guard.worker.take() {
                    debug!(library = %guard.library.name, "sweeping dead worker");
                    stop_handle(handle, false).await;
                }
                continue;
            }

            let expired = match guard.worker.as_ref() {
                Some(handle) => match guard.library.idle_timeout(&self.globals) {
                    Some(timeout) => handle.last_activity.elapsed() >= timeout,
                    None => false,
                },
                None => false,
            };

            if expired {
                if let Some(handle) = guard.worker.take() {
                    info!(library = %guard.library.name, "reclaiming idle worker");
                    stop_handle(handle, true).await;
                }
            }
        }
    }

    /// Stop one library's worker, leaving the rest of the pool alone.
    /// Callers already queued on the slot fail with a terminal error;
    /// the next acquire for this library starts over with a fresh
    /// slot and worker.
    pub async fn shutdown_library(&self, name: &str) {
        let slot = match lock_std(&self.slots).get(name) {
            Some(slot) => Arc::clone(slot),
            None => return,
        };

        let mut guard = slot.lock().await;
        guard.closed = true;
        if let Some(handle) = guard.worker.take() {
            info!(library = %name, "stopping worker on request");
            stop_handle(handle, true).await;
        }
        // Removed only after the worker is fully stopped, so a fresh
        // acquire can never overlap two processes on one library
        lock_std(&self.slots).remove(name);
    }

    /// Stop everything. Future acquires fail; live workers get a
    /// terminate request, a bounded grace period, then a kill.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        if let Some(task) = lock_std(&self.sweep_task).take() {
            task.abort();
        }

        let slots: Vec<SlotRef> = lock_std(&self.slots).values().cloned().collect();
        let mut handles = Vec::new();
        for slot in slots {
            let mut guard = slot.lock().await;
            if let Some(mut handle) = guard.worker.take() {
                handle.state = WorkerState::Terminating;
                handle.channel.close();
                if !handle.process.terminate() {
                    handle.process.kill();
                }
                handles.push(handle);
            }
        }

        for _ in 0..STOP_POLL_ROUNDS {
            if handles.iter_mut().all(|h| !h.process.is_alive()) {
                break;
            }
            tokio::time::sleep(STOP_POLL_DELAY).await;
        }
        for handle in handles.iter_mut() {
            if handle.process.is_alive() {
                warn!("worker survived terminate, killing");
                handle.process.kill();
            }
        }
    }

    /// Libraries that currently hold a worker, with pids. Slots locked
    /// by a lease are reported as busy without blocking on them.
    pub fn active_workers(&self) -> Vec<(String, Option<u32>)> {
        let slots: Vec<(String, SlotRef)> = lock_std(&self.slots)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut out = Vec::new();
        for (name, slot) in slots {
            match slot.try_lock() {
                Ok(guard) => {
                    if let Some(handle) = guard.worker.as_ref() {
                        out.push((name, handle.process.pid()));
                    }
                }
                // Locked means a lease is active, so a worker exists
                Err(_) => out.push((name, None)),
            }
        }
        out
    }

    fn slot_for(&self, library: &Arc<LibraryConfig>) -> SlotRef {
        let mut slots = lock_std(&self.slots);
        Arc::clone(slots.entry(library.name.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(WorkerSlot {
                library: Arc::clone(library),
                worker: None,
                closed: false,
            }))
        }))
    }
}

/// An acquired worker. Dropping the lease releases the library's slot;
/// a worker whose channel went suspect or whose process died is
/// evicted on release instead of being returned to the pool.
pub struct LeasedWorker {
    guard: OwnedMutexGuard<WorkerSlot>,
    call_timeout: Duration,
}

impl std::fmt::Debug for LeasedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedWorker")
            .field("library", &self.guard.library.name)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl LeasedWorker {
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let timeout = self.call_timeout;
        let handle = self
            .guard
            .worker
            .as_mut()
            .ok_or_else(|| BridgeError::Protocol("lease holds no worker".to_string()))?;

        match handle.channel.call(method, params, timeout).await {
            Err(BridgeError::Protocol(msg)) if !handle.process.is_alive() => {
                handle.state = WorkerState::Dead;
                let detail = handle
                    .process
                    .crash_diagnostic()
                    .unwrap_or_else(|| msg.clone());
                Err(BridgeError::Protocol(format!(
                    "worker died during '{}': {}",
                    method, detail
                )))
            }
            other => other,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.guard.worker.as_ref().and_then(|h| h.process.pid())
    }

    pub fn library_name(&self) -> &str {
        &self.guard.library.name
    }
}

impl Drop for LeasedWorker {
    fn drop(&mut self) {
        let evict = match self.guard.worker.as_mut() {
            Some(handle) => {
                if handle.state != WorkerState::Dead
                    && handle.channel.is_open()
                    && !handle.channel.is_suspect()
                    && handle.process.is_alive()
                {
                    handle.state = WorkerState::Idle;
                    handle.last_activity = Instant::now();
                    false
                } else {
                    true
                }
            }
            None => false,
        };

        if evict {
            if let Some(mut handle) = self.guard.worker.take() {
                debug!(library = %self.guard.library.name, "evicting worker on release");
                handle.state = WorkerState::Dead;
                handle.channel.close();
                handle.process.kill();
            }
        }
    }
}

async fn stop_handle(mut handle: WorkerHandle, graceful: bool) {
    handle.state = WorkerState::Terminating;
    handle.channel.close();

    if graceful && handle.process.terminate() {
        for _ in 0..STOP_POLL_ROUNDS {
            if !handle.process.is_alive() {
                return;
            }
            tokio::time::sleep(STOP_POLL_DELAY).await;
        }
    }
    handle.process.kill();
}

fn lock_std<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
