//! The execution pool.
//!
//! Units are created on demand up to the configured ceiling and handed
//! out exclusively. Idle units wait in a bounded channel; a unit lost to
//! a claim race is set aside for the rest of the attempt so one busy
//! unit cannot starve the scan. Expired units leave the live count
//! immediately and are torn down after a grace delay on a detached
//! thread, so in-flight event deliveries drain harmlessly first.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use engine::{CompletionSink, EngineOptions, ExecutionUnit, ScriptError};
use fetch::{AlertHook, FetchBridge};

use crate::config::PoolConfig;

const ACQUIRE_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Invoked when the pool gives up after sustained acquire failures.
pub type ExitHandler = Arc<dyn Fn() + Send + Sync>;

/// Acquisition ran out its timeout without obtaining a unit. Creation
/// failures are transient and retried inside the loop; only the
/// exhausted budget surfaces.
#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for an execution unit")]
pub struct PoolExhausted;

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("no execution unit available: {0}")]
    Exhausted(#[from] PoolExhausted),
    #[error("unit {unit_id}: script failed: {source}")]
    Script {
        unit_id: u32,
        #[source]
        source: ScriptError,
    },
}

pub struct UnitPool {
    config: PoolConfig,
    engine_options: EngineOptions,
    bridge: Arc<FetchBridge>,
    completions: Arc<dyn CompletionSink>,
    idle_tx: Sender<Arc<ExecutionUnit>>,
    idle_rx: Receiver<Arc<ExecutionUnit>>,
    live: AtomicI32,
    next_id: AtomicU32,
    create_lock: Mutex<()>,
    consecutive_failures: AtomicU32,
    dump_requested: AtomicBool,
    alert: Option<AlertHook>,
    exit: ExitHandler,
}

impl UnitPool {
    pub fn new(
        config: PoolConfig,
        server_bundle: Option<String>,
        bridge: Arc<FetchBridge>,
        completions: Arc<dyn CompletionSink>,
        alert: Option<AlertHook>,
    ) -> Self {
        Self::with_exit_handler(
            config,
            server_bundle,
            bridge,
            completions,
            alert,
            Arc::new(|| std::process::exit(1)),
        )
    }

    pub fn with_exit_handler(
        config: PoolConfig,
        server_bundle: Option<String>,
        bridge: Arc<FetchBridge>,
        completions: Arc<dyn CompletionSink>,
        alert: Option<AlertHook>,
        exit: ExitHandler,
    ) -> Self {
        let config = config.normalized();
        let engine_options = EngineOptions {
            max_heap_bytes: (config.heap_limit_mb as usize) * 1024 * 1024,
            server_bundle,
        };
        // Slack above the ceiling absorbs returns racing with retirement.
        let (idle_tx, idle_rx) = bounded(config.max_units as usize + 100);
        tracing::info!(
            "execution pool: max {} units, lifetime {}s, heap floor {}MB limit {}MB",
            config.max_units,
            config.unit_lifetime_secs,
            config.heap_floor_mb,
            config.heap_limit_mb
        );
        Self {
            config,
            engine_options,
            bridge,
            completions,
            idle_tx,
            idle_rx,
            live: AtomicI32::new(0),
            next_id: AtomicU32::new(0),
            create_lock: Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
            dump_requested: AtomicBool::new(false),
            alert,
            exit,
        }
    }

    /// Acquire a unit for exclusive use, creating one when under the
    /// ceiling, waiting otherwise. Sustained failure trips the fail-fast
    /// exit handler.
    pub fn acquire(&self) -> Result<Arc<ExecutionUnit>, PoolExhausted> {
        let mut stash = Vec::new();
        let result = self.acquire_inner(&mut stash);
        for unit in stash {
            let _ = self.idle_tx.send(unit);
        }
        match result {
            Ok(unit) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                Ok(unit)
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::error!("acquire failed ({} consecutive): {}", failures, err);
                if let Some(alert) = &self.alert {
                    alert(&format!("execution pool exhausted: {}", err));
                }
                if failures >= self.config.fail_exit_threshold {
                    tracing::error!("{} consecutive acquire failures, giving up", failures);
                    (self.exit)();
                }
                Err(err)
            }
        }
    }

    fn acquire_inner(
        &self,
        stash: &mut Vec<Arc<ExecutionUnit>>,
    ) -> Result<Arc<ExecutionUnit>, PoolExhausted> {
        let timeout = Duration::from_secs(self.config.acquire_timeout_secs);
        let start = Instant::now();
        loop {
            match self.idle_rx.try_recv() {
                Ok(unit) => {
                    if unit.try_acquire() {
                        return Ok(unit);
                    }
                    // Lost the claim race; set the unit aside so the
                    // scan moves on instead of cycling over it.
                    stash.push(unit);
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            if (self.live.load(Ordering::SeqCst).max(0) as u32) < self.config.max_units {
                if let Some(unit) = self.try_create() {
                    return Ok(unit);
                }
                // Slot raced away or creation failed; wait and retry.
            }

            if start.elapsed() >= timeout {
                return Err(PoolExhausted);
            }
            // Hand stashed units back before waiting so other acquirers
            // see them as soon as their claims clear.
            for unit in stash.drain(..) {
                let _ = self.idle_tx.send(unit);
            }
            std::thread::sleep(ACQUIRE_RETRY_SLEEP);
        }
    }

    /// Reserve a slot under the creation lock, then build the unit
    /// outside it. Returns `None` when a racing creator took the slot
    /// or construction failed; either way the slot is accounted for.
    fn try_create(&self) -> Option<Arc<ExecutionUnit>> {
        {
            let _guard = self
                .create_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.live.load(Ordering::SeqCst).max(0) as u32 >= self.config.max_units {
                return None;
            }
            self.live.fetch_add(1, Ordering::SeqCst);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        match ExecutionUnit::spawn(
            id,
            self.engine_options.clone(),
            Arc::clone(&self.bridge),
            Arc::clone(&self.completions),
        ) {
            Ok(unit) => {
                if self.config.unit_lifetime_secs > 0 {
                    unit.set_expiry(Utc::now().timestamp() + self.config.unit_lifetime_secs as i64);
                }
                let claimed = unit.try_acquire();
                debug_assert!(claimed);
                tracing::info!(
                    "unit {} created ({} live)",
                    id,
                    self.live.load(Ordering::SeqCst)
                );
                Some(unit)
            }
            Err(err) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                tracing::error!("unit {} creation failed: {}", id, err);
                None
            }
        }
    }

    /// Return a unit after use. An expired unit leaves the live count
    /// now and is disposed after the grace delay, off this thread.
    pub fn release(&self, unit: Arc<ExecutionUnit>) {
        unit.release();
        if unit.is_expired() {
            let live = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
            let delay = Duration::from_secs(self.config.dispose_delay_secs);
            tracing::info!(
                "unit {} expired ({} live), disposal in {:?}",
                unit.id(),
                live,
                delay
            );
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                unit.dispose();
            });
        } else {
            let _ = self.idle_tx.send(unit);
        }
    }

    /// Acquire, evaluate, maintain the heap, release. The name labels
    /// the script in exception traces. Returns the id of the unit that
    /// ran the script.
    pub fn execute(&self, script: String, name: String) -> Result<u32, ExecuteError> {
        let unit = self.acquire()?;
        let result = unit.run(script, name);
        self.maintain_heap(&unit);
        let unit_id = unit.id();
        self.release(unit);
        match result {
            Ok(()) => Ok(unit_id),
            Err(source) => Err(ExecuteError::Script { unit_id, source }),
        }
    }

    fn maintain_heap(&self, unit: &Arc<ExecutionUnit>) {
        let floor = (self.config.heap_floor_mb as usize) * 1024 * 1024;
        let forced = unit.check_heap(
            floor,
            self.config.heap_growth_pct,
            self.config.heap_check_interval_secs,
        );
        let signaled = self
            .dump_requested
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if (forced && self.config.dev_mode) || signaled {
            let path = self.snapshot_path(unit.id());
            match unit.dump_heap(path.clone()) {
                Ok(()) => tracing::info!("heap snapshot written to {}", path.display()),
                Err(err) => tracing::error!("heap snapshot failed: {}", err),
            }
        }
    }

    /// Request a heap snapshot from the next unit that finishes a run.
    pub fn signal_dump_heap(&self) {
        self.dump_requested.store(true, Ordering::SeqCst);
    }

    fn snapshot_path(&self, unit_id: u32) -> PathBuf {
        let dir = if self.config.snapshot_dir.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.config.snapshot_dir)
        };
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        dir.join(format!("{}-{:03}.heapsnapshot", stamp, unit_id))
    }

    pub fn live_units(&self) -> i32 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn consecutive_acquire_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Dispose every idle unit. Units still claimed are left to their
    /// holders.
    pub fn shutdown(&self) {
        while let Ok(unit) = self.idle_rx.try_recv() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            unit.dispose();
        }
    }
}
