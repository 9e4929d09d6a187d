//! The engine façade: task execution, deadline timers, and lifetime contract.
//!
//! An [`Engine`] owns a multi-threaded runtime that doubles as the worker
//! pool, timer manager, and poller backend. Immediate closures flow through a
//! single FIFO ready queue, so closures scheduled from one thread run in
//! program order. Deferred closures live in a generation-tagged slot table
//! until they are dispatched or cancelled; cancellation is a crisp contract —
//! `true` means the closure will never run, `false` means it runs exactly
//! once regardless.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::{EndpointConfig, TcpOptions, KEY_RESOURCE_QUOTA};
use crate::connect::PendingConnect;
use crate::dns::PendingLookup;
use crate::error::{EngineError, Result};
use crate::quota::{MemoryAllocatorFactory, MemoryQuota};
use crate::task::{HandleSlab, TaskHandle};

/// A closure queued for execution on the engine.
pub(crate) type ReadyClosure = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct TimerEntry {
    closure: ReadyClosure,
    abort: Option<AbortHandle>,
}

/// Shared engine state reachable from spawned work.
pub(crate) struct EngineInner {
    pub(crate) rt: tokio::runtime::Handle,
    ready_tx: mpsc::UnboundedSender<ReadyClosure>,
    timers: HandleSlab<TimerEntry>,
    pub(crate) lookups: HandleSlab<PendingLookup>,
    pub(crate) connects: HandleSlab<PendingConnect>,
    pub(crate) live_endpoints: AtomicUsize,
    pub(crate) live_listeners: AtomicUsize,
    pub(crate) options: TcpOptions,
    quota: Arc<MemoryQuota>,
}

impl EngineInner {
    /// Pushes a closure onto the FIFO ready queue.
    pub(crate) fn enqueue(&self, closure: ReadyClosure) {
        // Send only fails after shutdown, when nothing can run anyway.
        let _ = self.ready_tx.send(closure);
    }

    pub(crate) fn cancel_inner(&self, handle: TaskHandle) -> bool {
        let (index, generation) = handle.parts();
        match self.timers.take(index, generation) {
            Some(entry) => {
                if let Some(abort) = entry.abort {
                    abort.abort();
                }
                // The closure drops here, immediately.
                true
            }
            None => false,
        }
    }

    pub(crate) fn outstanding_timers(&self) -> usize {
        self.timers.len()
    }
}

fn schedule_at(inner: &Arc<EngineInner>, deadline: Instant, closure: ReadyClosure) -> TaskHandle {
    let (index, generation) = inner.timers.insert(TimerEntry {
        closure,
        abort: None,
    });
    let sleeper_inner = Arc::clone(inner);
    let sleeper = inner.rt.spawn(async move {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        // Whoever takes the entry owns the closure; a concurrent cancel that
        // wins here simply drops it.
        if let Some(entry) = sleeper_inner.timers.take(index, generation) {
            sleeper_inner.enqueue(entry.closure);
        }
    });
    inner.timers.with_mut(index, generation, |entry| {
        entry.abort = Some(sleeper.abort_handle())
    });
    TaskHandle::from_parts(index, generation)
}

/// Cheap, cloneable scheduling capability onto an [`Engine`].
///
/// Components that outlive a single call (the idle tracker, endpoints,
/// listeners) hold one of these instead of the engine itself; the engine
/// always outlives them per the destruction contract.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) inner: Arc<EngineInner>,
}

impl EngineHandle {
    /// Enqueues `closure` for earliest-possible execution. Uncancelable;
    /// runs exactly once. Closures enqueued from one thread run in order.
    pub fn run_now(&self, closure: impl FnOnce() + Send + 'static) {
        self.inner.enqueue(Box::new(closure));
    }

    /// Schedules `closure` for execution at `deadline`.
    ///
    /// Past deadlines dispatch immediately, but still through the ready
    /// queue, never inline.
    pub fn run_at(&self, deadline: Instant, closure: impl FnOnce() + Send + 'static) -> TaskHandle {
        schedule_at(&self.inner, deadline, Box::new(closure))
    }

    /// Schedules `closure` to run after `delay`.
    pub fn run_after(&self, delay: Duration, closure: impl FnOnce() + Send + 'static) -> TaskHandle {
        self.run_at(Instant::now() + delay, closure)
    }

    /// Attempts to cancel a deferred closure.
    ///
    /// On `true` the closure is destroyed and will never run. On `false` it
    /// has been (or is being) dispatched and will run exactly once.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.inner.cancel_inner(handle)
    }
}

/// The pluggable asynchronous I/O engine.
///
/// Composes task execution, deadline timers, listeners, outbound connects,
/// and DNS resolution behind one object with a documented lifetime contract:
/// at drop there must be no outstanding tasks, lookups, connect attempts,
/// endpoints, or listeners. Violations are detected where feasible and abort
/// the process.
pub struct Engine {
    inner: Arc<EngineInner>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Engine {
    /// Builds an engine from `config`.
    ///
    /// The worker pool, timers, and poller are engine-scoped; nothing is
    /// shared between engines.
    pub fn new(config: &EndpointConfig) -> Result<Engine> {
        let options = TcpOptions::from_config(config);
        if let Some(strategy) = &options.poll_strategy {
            tracing::debug!(
                strategy = strategy.as_str(),
                "poll strategy requested; runtime default poller in use"
            );
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("rivet-io")
            .enable_all()
            .build()
            .map_err(|e| EngineError::internal(format!("failed to build runtime: {e}")))?;
        let quota = config
            .get_quota(KEY_RESOURCE_QUOTA)
            .unwrap_or_else(|| MemoryQuota::unlimited("engine"));
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<ReadyClosure>();
        let inner = Arc::new(EngineInner {
            rt: runtime.handle().clone(),
            ready_tx,
            timers: HandleSlab::new(),
            lookups: HandleSlab::new(),
            connects: HandleSlab::new(),
            live_endpoints: AtomicUsize::new(0),
            live_listeners: AtomicUsize::new(0),
            options,
            quota,
        });
        runtime.spawn(async move {
            while let Some(closure) = ready_rx.recv().await {
                closure();
            }
        });
        tracing::debug!("engine started");
        Ok(Engine {
            inner,
            runtime: Some(runtime),
        })
    }

    /// Returns a cloneable scheduling handle.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// See [`EngineHandle::run_now`].
    pub fn run_now(&self, closure: impl FnOnce() + Send + 'static) {
        self.inner.enqueue(Box::new(closure));
    }

    /// See [`EngineHandle::run_at`].
    pub fn run_at(&self, deadline: Instant, closure: impl FnOnce() + Send + 'static) -> TaskHandle {
        schedule_at(&self.inner, deadline, Box::new(closure))
    }

    /// See [`EngineHandle::run_after`].
    pub fn run_after(&self, delay: Duration, closure: impl FnOnce() + Send + 'static) -> TaskHandle {
        self.run_at(Instant::now() + delay, closure)
    }

    /// See [`EngineHandle::cancel`].
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.inner.cancel_inner(handle)
    }

    /// The quota this engine charges, from the `resource_quota` config key
    /// (unlimited when the key is absent).
    pub fn resource_quota(&self) -> &Arc<MemoryQuota> {
        &self.inner.quota
    }

    /// An allocator factory over this engine's quota, for upper layers that
    /// create per-endpoint allocators.
    pub fn allocator_factory(&self) -> MemoryAllocatorFactory {
        MemoryAllocatorFactory::new(Arc::clone(&self.inner.quota))
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let timers = self.inner.outstanding_timers();
        let lookups = self.inner.lookups.len();
        let connects = self.inner.connects.len();
        let endpoints = self.inner.live_endpoints.load(Ordering::Acquire);
        let listeners = self.inner.live_listeners.load(Ordering::Acquire);
        if timers + lookups + connects + endpoints + listeners != 0 {
            tracing::error!(
                timers,
                lookups,
                connects,
                endpoints,
                listeners,
                "engine dropped with outstanding work, aborting"
            );
            std::process::abort();
        }
        if let Some(runtime) = self.runtime.take() {
            // Let in-flight callbacks finish; nothing new can be scheduled
            // once the precondition above held.
            runtime.shutdown_timeout(Duration::from_secs(2));
        }
        tracing::debug!("engine shut down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("timers", &self.inner.outstanding_timers())
            .field("lookups", &self.inner.lookups.len())
            .field("connects", &self.inner.connects.len())
            .field(
                "endpoints",
                &self.inner.live_endpoints.load(Ordering::Relaxed),
            )
            .field(
                "listeners",
                &self.inner.live_listeners.load(Ordering::Relaxed),
            )
            .finish()
    }
}
