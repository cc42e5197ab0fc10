//! Execution units.
//!
//! A unit is one JavaScript runtime plus the bookkeeping to share it
//! safely: an exclusive-use flag, a pending event queue and heap growth
//! tracking. The runtime itself is not `Send`, so each unit owns a
//! dedicated OS thread that drives it; the unit handle is the shareable
//! front and forwards work to that thread over a command channel.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use deno_core::{v8, JsRuntime, ModuleCodeString, RuntimeOptions};
use fetch::{EventSink, FetchBridge, FetchEvent};

use crate::error::{ScriptError, UnitCreationError};
use crate::ops::{register_ops, CompletionSink, HostState};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Default)]
pub struct EngineOptions {
    /// Hard V8 heap ceiling in bytes; 0 leaves the default limit.
    pub max_heap_bytes: usize,
    /// Application bundle evaluated once after the bootstrap script.
    pub server_bundle: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct HeapUsage {
    pub used: usize,
    pub limit: usize,
}

enum UnitCommand {
    Run {
        script: String,
        name: String,
        done: Sender<Result<(), ScriptError>>,
    },
    Dispatch {
        payload: String,
    },
    HeapStats {
        done: Sender<HeapUsage>,
    },
    ForceGc,
    DumpHeap {
        path: PathBuf,
        done: Sender<Result<(), String>>,
    },
    Shutdown,
}

#[derive(Default)]
struct UnitState {
    running: bool,
    disposed: bool,
    pending: VecDeque<FetchEvent>,
}

pub struct ExecutionUnit {
    id: u32,
    state: Mutex<UnitState>,
    /// Unix seconds after which the unit must be retired; 0 = no expiry.
    expire_at: AtomicI64,
    /// Heap baseline from the last forced collection.
    last_heap: AtomicUsize,
    next_heap_check: AtomicI64,
    cmd_tx: Sender<UnitCommand>,
}

impl ExecutionUnit {
    /// Create a unit and wait for its runtime to finish bootstrapping.
    pub fn spawn(
        id: u32,
        options: EngineOptions,
        bridge: Arc<FetchBridge>,
        completions: Arc<dyn CompletionSink>,
    ) -> Result<Arc<Self>, UnitCreationError> {
        let (cmd_tx, cmd_rx) = unbounded();
        let unit = Arc::new(Self {
            id,
            state: Mutex::new(UnitState::default()),
            expire_at: AtomicI64::new(0),
            last_heap: AtomicUsize::new(0),
            next_heap_check: AtomicI64::new(0),
            cmd_tx,
        });

        let sink: Weak<dyn EventSink> = Arc::downgrade(&unit);
        let (ready_tx, ready_rx) = bounded(1);
        std::thread::Builder::new()
            .name(format!("unit-{}", id))
            .spawn(move || run_unit_thread(id, options, bridge, completions, sink, cmd_rx, ready_tx))?;

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => Ok(unit),
            Ok(Err(message)) => Err(UnitCreationError::Startup(message)),
            Err(_) => Err(UnitCreationError::StartupTimeout),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Claim the unit for exclusive execution. Fails when it is already
    /// claimed or disposed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("unit state poisoned");
        if state.running || state.disposed {
            return false;
        }
        state.running = true;
        true
    }

    /// Return the unit to the idle state, first flushing every event
    /// that queued up during the execution, in arrival order.
    pub fn release(&self) {
        let mut state = self.state.lock().expect("unit state poisoned");
        while let Some(event) = state.pending.pop_front() {
            // A failed delivery must not strand the rest of the queue.
            if let Err(err) = self.dispatch_now(&event) {
                tracing::error!("unit {}: flush failed: {}", self.id, err);
            }
        }
        state.running = false;
    }

    /// Evaluate a script on the unit thread and wait for the result.
    /// The name labels the script in exception stack traces.
    pub fn run(&self, script: String, name: String) -> Result<(), ScriptError> {
        let (done_tx, done_rx) = bounded(1);
        self.cmd_tx
            .send(UnitCommand::Run {
                script,
                name,
                done: done_tx,
            })
            .map_err(|_| ScriptError::new(format!("unit {} terminated", self.id)))?;
        done_rx
            .recv()
            .map_err(|_| ScriptError::new(format!("unit {} terminated", self.id)))?
    }

    fn dispatch_now(&self, event: &FetchEvent) -> Result<(), String> {
        let payload = serde_json::to_string(event).map_err(|err| err.to_string())?;
        self.cmd_tx
            .send(UnitCommand::Dispatch { payload })
            .map_err(|_| format!("unit {} terminated", self.id))
    }

    pub fn pending_events(&self) -> usize {
        self.state.lock().expect("unit state poisoned").pending.len()
    }

    pub fn set_expiry(&self, at_unix: i64) {
        self.expire_at.store(at_unix, Ordering::Relaxed);
    }

    pub fn is_expired(&self) -> bool {
        let at = self.expire_at.load(Ordering::Relaxed);
        at > 0 && unix_now() >= at
    }

    /// Inspect heap usage and force a collection when growth since the
    /// last baseline exceeds the configured ratio. Rate limited to one
    /// inspection per `interval_secs`; returns whether a collection was
    /// forced.
    pub fn check_heap(&self, floor_bytes: usize, growth_pct: u32, interval_secs: u64) -> bool {
        let now = unix_now();
        if now < self.next_heap_check.load(Ordering::Relaxed) {
            return false;
        }
        self.next_heap_check
            .store(now + interval_secs as i64, Ordering::Relaxed);

        let (done_tx, done_rx) = bounded(1);
        if self
            .cmd_tx
            .send(UnitCommand::HeapStats { done: done_tx })
            .is_err()
        {
            return false;
        }
        let usage = match done_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(usage) => usage,
            Err(_) => return false,
        };

        let baseline = self.last_heap.load(Ordering::Relaxed);
        if !should_force_gc(usage.used, baseline, floor_bytes, growth_pct) {
            return false;
        }
        tracing::info!(
            "unit {}: heap {} over baseline {} (limit {}), forcing gc",
            self.id,
            usage.used,
            baseline,
            usage.limit
        );
        self.last_heap.store(usage.used, Ordering::Relaxed);
        let _ = self.cmd_tx.send(UnitCommand::ForceGc);
        true
    }

    /// Write a heap snapshot to `path` from the unit thread.
    pub fn dump_heap(&self, path: PathBuf) -> Result<(), String> {
        let (done_tx, done_rx) = bounded(1);
        self.cmd_tx
            .send(UnitCommand::DumpHeap {
                path,
                done: done_tx,
            })
            .map_err(|_| format!("unit {} terminated", self.id))?;
        done_rx
            .recv_timeout(Duration::from_secs(30))
            .map_err(|_| format!("unit {}: heap dump timed out", self.id))?
    }

    /// Tear the unit down. Pending events are discarded and the backing
    /// thread exits once in-flight commands drain. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock().expect("unit state poisoned");
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.pending.clear();
        drop(state);
        let _ = self.cmd_tx.send(UnitCommand::Shutdown);
        tracing::info!("unit {} disposed", self.id);
    }
}

impl EventSink for ExecutionUnit {
    fn deliver(&self, event: &FetchEvent) -> Result<(), String> {
        let mut state = self.state.lock().expect("unit state poisoned");
        if state.disposed {
            tracing::debug!("unit {}: dropping event for disposed unit", self.id);
            return Ok(());
        }
        // While a script holds the unit, or older events are still
        // queued, preserve arrival order by queueing behind them.
        if state.running || !state.pending.is_empty() {
            state.pending.push_back(event.clone());
            return Ok(());
        }
        drop(state);
        self.dispatch_now(event)
    }
}

/// Growth predicate behind forced collections: the heap must clear the
/// absolute floor and exceed the baseline by the growth percentage.
pub fn should_force_gc(used: usize, baseline: usize, floor: usize, growth_pct: u32) -> bool {
    used > floor && (used as u128) * 100 > (baseline as u128) * (growth_pct as u128)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

const INIT_JS: &str = include_str!("init.js");

fn run_unit_thread(
    id: u32,
    options: EngineOptions,
    bridge: Arc<FetchBridge>,
    completions: Arc<dyn CompletionSink>,
    sink: Weak<dyn EventSink>,
    cmd_rx: Receiver<UnitCommand>,
    ready_tx: Sender<Result<(), String>>,
) {
    let mut runtime = match build_runtime(id, &options, bridge, completions, sink) {
        Ok(runtime) => {
            let _ = ready_tx.send(Ok(()));
            runtime
        }
        Err(message) => {
            let _ = ready_tx.send(Err(message));
            return;
        }
    };

    for cmd in cmd_rx.iter() {
        match cmd {
            UnitCommand::Run { script, name, done } => {
                let result = runtime
                    .execute_script(name, ModuleCodeString::from(script))
                    .map(|_| ())
                    .map_err(|err| ScriptError::new(err.to_string()));
                runtime.v8_isolate().perform_microtask_checkpoint();
                let _ = done.send(result);
            }
            UnitCommand::Dispatch { payload } => {
                let code = format!("globalThis.__ssr.dispatchFetchEvent({})", payload);
                if let Err(err) =
                    runtime.execute_script("dispatch.js", ModuleCodeString::from(code))
                {
                    tracing::error!("unit {}: event dispatch failed: {}", id, err);
                }
                runtime.v8_isolate().perform_microtask_checkpoint();
            }
            UnitCommand::HeapStats { done } => {
                let stats = runtime.v8_isolate().get_heap_statistics();
                let _ = done.send(HeapUsage {
                    used: stats.used_heap_size(),
                    limit: stats.heap_size_limit(),
                });
            }
            UnitCommand::ForceGc => {
                runtime.v8_isolate().low_memory_notification();
            }
            UnitCommand::DumpHeap { path, done } => {
                let _ = done.send(write_heap_snapshot(&mut runtime, &path));
            }
            UnitCommand::Shutdown => break,
        }
    }
    tracing::debug!("unit {} thread exiting", id);
}

fn build_runtime(
    id: u32,
    options: &EngineOptions,
    bridge: Arc<FetchBridge>,
    completions: Arc<dyn CompletionSink>,
    sink: Weak<dyn EventSink>,
) -> Result<JsRuntime, String> {
    let create_params = if options.max_heap_bytes > 0 {
        Some(v8::CreateParams::default().heap_limits(0, options.max_heap_bytes))
    } else {
        None
    };
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![register_ops()],
        create_params,
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(HostState {
        unit_id: id,
        sink,
        bridge,
        completions,
    });
    runtime
        .execute_script("init.js", ModuleCodeString::from(INIT_JS.to_string()))
        .map_err(|err| format!("bootstrap failed: {}", err))?;
    if let Some(bundle) = &options.server_bundle {
        runtime
            .execute_script("server.js", ModuleCodeString::from(bundle.clone()))
            .map_err(|err| format!("server bundle failed: {}", err))?;
    }
    Ok(runtime)
}

fn write_heap_snapshot(runtime: &mut JsRuntime, path: &Path) -> Result<(), String> {
    let file = std::fs::File::create(path).map_err(|err| err.to_string())?;
    let mut writer = std::io::BufWriter::new(file);
    let mut write_err = None;
    runtime.v8_isolate().take_heap_snapshot(|chunk| {
        match writer.write_all(chunk) {
            Ok(()) => true,
            Err(err) => {
                write_err = Some(err);
                false
            }
        }
    });
    if let Some(err) = write_err {
        return Err(err.to_string());
    }
    writer.flush().map_err(|err| err.to_string())
}
