//! The slave-capable event loop.
//!
//! An [`EventLoop`] is a single-threaded cooperative scheduler. It either
//! drives its own iteration (standalone, with a `poll(2)` selector over the
//! fds registered with it) or runs as a *slave* of a native main loop: every
//! readiness source is then mirrored into the native loop by the bridge and
//! scheduler callbacks run from native dispatches.
//!
//! - `run.rs`: `run_until_complete`, `run_without_glib_until_complete`,
//!   `run_forever` and the per-mode iteration steps
//! - `slave.rs`: slave lifecycle, mirroring and the native callbacks
//!
//! The loop state lives in [`LoopInner`] behind an `Rc`. Scheduler and bridge
//! borrows are never held while user code runs, so callbacks can call back
//! into the loop freely, including nested runs.

mod run;
mod slave;

use crate::bridge::{Bridge, MirrorKey};
use crate::config::LoopConfig;
use crate::error::{LoopError, panic_message};
use crate::metrics::LoopMetrics;
use crate::native::{Application, IoCondition, NativeLoop, SourceId};
use crate::policy;
use crate::scheduler::task::{ForeignWakeups, TaskCore, step_handle};
use crate::scheduler::{Bookkeeping, Handle, LoopFuture, Scheduler, Task, TaskId, TimerHandle, TimerId};
use crate::state::{LoopState, StateChange, StateManager};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// What went wrong in a callback, passed to the exception handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionContext {
    pub message: String,
    /// Label of the callback, if the error came from one
    pub handle: Option<String>,
    /// Panic message, if the callback panicked
    pub panic: Option<String>,
}

type ExceptionHandler = Rc<dyn Fn(&ExceptionContext)>;

pub(crate) struct LoopInner {
    id: u64,
    this: Weak<LoopInner>,
    config: RefCell<LoopConfig>,
    sched: RefCell<Scheduler>,
    bridge: RefCell<Bridge>,
    status: StateManager,
    metrics: Arc<LoopMetrics>,
    foreign: Arc<ForeignWakeups>,
    run_depth: Cell<u32>,
    stopping: Cell<bool>,
    exception_handler: RefCell<Option<ExceptionHandler>>,
}

/// Cooperative scheduler that can run as a slave of a native main loop
///
/// Cloning is cheap and yields another reference to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    pub fn new(native: Rc<dyn NativeLoop>, config: LoopConfig) -> Self {
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let metrics = Arc::new(LoopMetrics::new());
        let inner = Rc::new_cyclic(|this| LoopInner {
            id,
            this: this.clone(),
            config: RefCell::new(config),
            sched: RefCell::new(Scheduler::default()),
            bridge: RefCell::new(Bridge::new(native, metrics.clone())),
            status: StateManager::new(),
            metrics,
            foreign: Arc::new(ForeignWakeups::new()),
            run_depth: Cell::new(0),
            stopping: Cell::new(false),
            exception_handler: RefCell::new(None),
        });
        policy::register_loop(id, Rc::downgrade(&inner));
        tracing::debug!("Created event loop {}", id);
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Rc<LoopInner>) -> Self {
        Self { inner }
    }

    /// Identifier of this loop, unique in the process
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> LoopState {
        self.inner.state()
    }

    pub fn is_slave(&self) -> bool {
        self.inner.is_slave()
    }

    /// True while the loop is a slave or inside one of its run methods
    pub fn is_running(&self) -> bool {
        self.inner.is_slave() || self.inner.run_depth.get() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// The loop's clock
    pub fn time(&self) -> Instant {
        Instant::now()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.status.subscribe()
    }

    /// Shared status record; clones observe the same loop but cannot change it
    ///
    /// ```compile_fail
    /// use gasyncio::native::LocalMainContext;
    /// use gasyncio::{EventLoop, LoopConfig};
    /// use std::rc::Rc;
    ///
    /// let event_loop = EventLoop::new(Rc::new(LocalMainContext::new()), LoopConfig::default());
    /// event_loop.status().enter_slave(0);
    /// ```
    pub fn status(&self) -> StateManager {
        self.inner.status.clone()
    }

    pub fn metrics(&self) -> Arc<LoopMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Snapshot of scheduler-level registrations
    pub fn bookkeeping(&self) -> Bookkeeping {
        self.inner.sched.borrow().bookkeeping()
    }

    /// Sources currently mirrored into the native loop
    pub fn mirrored_sources(&self) -> Vec<MirrorKey> {
        self.inner.bridge.borrow().keys()
    }

    /// Native source currently mirroring `key`
    pub fn native_source(&self, key: MirrorKey) -> Option<SourceId> {
        self.inner.bridge.borrow().source_of(key)
    }

    /// Scheduler source mirrored by the native source `source`
    pub fn mirror_key(&self, source: SourceId) -> Option<MirrorKey> {
        self.inner.bridge.borrow().key_of(source)
    }

    pub fn native(&self) -> Rc<dyn NativeLoop> {
        Rc::clone(self.inner.bridge.borrow().native())
    }

    pub fn config(&self) -> LoopConfig {
        self.inner.config.borrow().clone()
    }

    pub fn get_debug(&self) -> bool {
        self.inner.config.borrow().debug
    }

    pub fn set_debug(&self, enabled: bool) {
        self.inner.config.borrow_mut().debug = enabled;
    }

    // Slave lifecycle

    /// Let the native main loop own iteration from now on
    pub fn start_slave_loop(&self) -> Result<(), LoopError> {
        self.inner.start_slave_loop()
    }

    /// Undo [`start_slave_loop`](Self::start_slave_loop); scheduler
    /// registrations are kept
    pub fn stop_slave_loop(&self) -> Result<(), LoopError> {
        self.inner.stop_slave_loop()
    }

    /// Run `app` with the loop enslaved to the native main loop.
    ///
    /// Slave mode ends when `app.run` returns or unwinds; the loop stays
    /// open.
    pub fn run_application(&self, app: &dyn Application, argv: &[String]) -> Result<i32, LoopError> {
        self.inner.start_slave_loop()?;

        struct StopOnExit<'a>(&'a LoopInner);
        impl Drop for StopOnExit<'_> {
            fn drop(&mut self) {
                if self.0.is_slave() {
                    if let Err(e) = self.0.stop_slave_loop() {
                        tracing::warn!("Failed to leave slave mode after the application: {}", e);
                    }
                }
            }
        }

        let _stop = StopOnExit(&self.inner);
        let status = app.run(argv);
        tracing::debug!("Application returned {}", status);
        Ok(status)
    }

    // Runs

    /// Drive the loop until `future` completes and return its output
    pub fn run_until_complete<F, T>(&self, future: F) -> Result<T, LoopError>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.inner.run_until_complete(future, run::RunMode::Normal)
    }

    /// Like [`run_until_complete`](Self::run_until_complete) without ever
    /// iterating the native loop
    pub fn run_without_glib_until_complete<F, T>(&self, future: F) -> Result<T, LoopError>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.inner.run_until_complete(future, run::RunMode::WithoutNative)
    }

    /// Run until [`stop`](Self::stop) is called
    pub fn run_forever(&self) -> Result<(), LoopError> {
        self.inner.run_forever()
    }

    /// Make the innermost `run_forever` return after its current iteration
    pub fn stop(&self) {
        self.inner.stopping.set(true);
    }

    /// Close the loop, cancelling everything still registered
    pub fn close(&self) -> Result<(), LoopError> {
        self.inner.close()
    }

    // Scheduling

    pub fn call_soon<F>(&self, callback: F) -> Result<Handle, LoopError>
    where
        F: FnOnce() + 'static,
    {
        self.inner.check_closed()?;
        let handle = Handle::once(std::any::type_name::<F>(), callback);
        self.inner.enqueue(handle.clone());
        Ok(handle)
    }

    pub fn call_later<F>(&self, delay: Duration, callback: F) -> Result<TimerHandle, LoopError>
    where
        F: FnOnce() + 'static,
    {
        self.call_at(Instant::now() + delay, callback)
    }

    pub fn call_at<F>(&self, when: Instant, callback: F) -> Result<TimerHandle, LoopError>
    where
        F: FnOnce() + 'static,
    {
        self.inner.check_closed()?;
        let handle = Handle::once(std::any::type_name::<F>(), callback);
        Ok(self.inner.add_timer(when, handle))
    }

    /// Call `callback` every time `fd` is readable; replaces an earlier reader
    pub fn add_reader<F>(&self, fd: RawFd, callback: F) -> Result<(), LoopError>
    where
        F: FnMut() + 'static,
    {
        self.inner.check_closed()?;
        let handle = Handle::repeating(format!("reader fd={}", fd), callback);
        self.inner.set_io(fd, IoCondition::IN, handle);
        Ok(())
    }

    pub fn remove_reader(&self, fd: RawFd) -> bool {
        self.inner.clear_io(fd, IoCondition::IN)
    }

    /// Call `callback` every time `fd` is writable; replaces an earlier writer
    pub fn add_writer<F>(&self, fd: RawFd, callback: F) -> Result<(), LoopError>
    where
        F: FnMut() + 'static,
    {
        self.inner.check_closed()?;
        let handle = Handle::repeating(format!("writer fd={}", fd), callback);
        self.inner.set_io(fd, IoCondition::OUT, handle);
        Ok(())
    }

    pub fn remove_writer(&self, fd: RawFd) -> bool {
        self.inner.clear_io(fd, IoCondition::OUT)
    }

    /// A pending future whose done callbacks run on this loop
    pub fn create_future<T: 'static>(&self) -> LoopFuture<T> {
        LoopFuture::new(self.inner.this.clone())
    }

    pub fn spawn<F, T>(&self, future: F) -> Result<Task<T>, LoopError>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.inner.spawn_task(None, future)
    }

    pub fn spawn_named<F, T>(&self, name: impl Into<String>, future: F) -> Result<Task<T>, LoopError>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.inner.spawn_task(Some(name.into()), future)
    }

    /// A future resolving after `delay`; cancelling it cancels the timer.
    ///
    /// On a closed loop the future is already rejected.
    pub fn sleep(&self, delay: Duration) -> LoopFuture<()> {
        let future = self.create_future::<()>();
        let resolver = future.clone();
        match self.call_later(delay, move || {
            let _ = resolver.resolve(());
        }) {
            Ok(timer) => future.add_done_callback(move |f| {
                if f.is_cancelled() {
                    timer.cancel();
                }
            }),
            Err(e) => {
                let _ = future.reject(crate::error::TaskError::Failed(e.to_string()));
            }
        }
        future
    }

    // Exceptions

    /// Replace the exception handler; `None` restores the default one
    pub fn set_exception_handler<F>(&self, handler: Option<F>)
    where
        F: Fn(&ExceptionContext) + 'static,
    {
        *self.inner.exception_handler.borrow_mut() = handler.map(|h| Rc::new(h) as ExceptionHandler);
    }

    pub fn call_exception_handler(&self, context: &ExceptionContext) {
        self.inner.call_exception_handler(context);
    }

    pub fn default_exception_handler(context: &ExceptionContext) {
        match (&context.handle, &context.panic) {
            (Some(handle), Some(panic)) => {
                tracing::error!("{} (callback {}): {}", context.message, handle, panic)
            }
            (None, Some(panic)) => tracing::error!("{}: {}", context.message, panic),
            (Some(handle), None) => tracing::error!("{} (callback {})", context.message, handle),
            (None, None) => tracing::error!("{}", context.message),
        }
    }
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventLoop {}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .field("run_depth", &self.inner.run_depth.get())
            .field("attached", &self.inner.bridge.borrow().is_attached())
            .finish()
    }
}

impl LoopInner {
    fn state(&self) -> LoopState {
        self.status.state()
    }

    fn is_slave(&self) -> bool {
        self.state().is_slave()
    }

    fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    fn check_closed(&self) -> Result<(), LoopError> {
        if self.is_closed() {
            return Err(LoopError::Closed);
        }
        Ok(())
    }

    /// Queue a ready handle, `call_soon` style
    pub(crate) fn schedule(self: &Rc<Self>, handle: Handle) -> Result<(), LoopError> {
        self.check_closed()?;
        self.enqueue(handle);
        Ok(())
    }

    fn enqueue(self: &Rc<Self>, handle: Handle) {
        self.sched.borrow_mut().push_ready(handle);
        self.ensure_ready_pump();
    }

    /// Queue the next step of a task unless one is queued already
    pub(crate) fn schedule_task(self: &Rc<Self>, id: TaskId) {
        if self.is_closed() {
            return;
        }
        let task = self.sched.borrow().task(id);
        if let Some(task) = task {
            if task.mark_scheduled() {
                self.enqueue(step_handle(task, "task step"));
            }
        }
    }

    pub(crate) fn forget_task(&self, id: TaskId) {
        let removed = self.sched.borrow_mut().remove_task(id);
        drop(removed);
    }

    pub(crate) fn timer_cancelled(&self, id: TimerId) {
        let removed = self.sched.borrow_mut().remove_timer(id);
        drop(removed);
        self.bridge.borrow_mut().unmirror(MirrorKey::Timer(id));
    }

    fn add_timer(self: &Rc<Self>, when: Instant, handle: Handle) -> TimerHandle {
        let id = self.sched.borrow_mut().insert_timer(when, handle.clone());
        if self.bridge.borrow().is_mirroring() {
            self.mirror_timer(id, when);
        }
        TimerHandle::new(id, when, handle, self.this.clone())
    }

    fn set_io(self: &Rc<Self>, fd: RawFd, condition: IoCondition, handle: Handle) {
        let replaced = self.sched.borrow_mut().set_io(fd, condition, handle);
        if let Some(old) = replaced {
            old.cancel();
        }
        self.sync_io(fd);
    }

    fn clear_io(self: &Rc<Self>, fd: RawFd, condition: IoCondition) -> bool {
        let removed = self.sched.borrow_mut().clear_io(fd, condition);
        let found = removed.is_some();
        if let Some(handle) = removed {
            handle.cancel();
        }
        self.sync_io(fd);
        found
    }

    fn spawn_task<F, T>(self: &Rc<Self>, name: Option<String>, future: F) -> Result<Task<T>, LoopError>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.check_closed()?;
        let id = self.sched.borrow_mut().next_task_id();
        let name = name.unwrap_or_else(|| format!("Task-{}", id.0));
        let core = TaskCore::new(id, name, future, self.id, self.foreign.clone(), self.this.clone());
        let task = Task::from_core(core);
        self.sched.borrow_mut().insert_task(id, task.as_step());
        self.schedule_task(id);
        Ok(task)
    }

    /// Schedule tasks woken from other threads
    fn flush_foreign(self: &Rc<Self>) {
        for id in self.foreign.drain() {
            self.schedule_task(id);
        }
    }

    fn pending_tasks(&self) -> usize {
        self.sched.borrow().task_count()
    }

    /// Run one handle, timing it and routing a panic to the exception handler
    fn run_handle(&self, handle: &Handle) {
        let (debug, slow) = {
            let config = self.config.borrow();
            (config.debug, config.slow_callback_duration())
        };

        let started = Instant::now();
        let outcome = handle.run();
        let elapsed = started.elapsed();
        self.metrics.record_callback(elapsed);

        if debug && elapsed >= slow {
            self.metrics.record_slow_callback();
            tracing::warn!("Executing {} took {:.3} seconds", handle.label(), elapsed.as_secs_f64());
        }

        if let Err(payload) = outcome {
            self.metrics.record_callback_panic();
            self.call_exception_handler(&ExceptionContext {
                message: "Exception in callback".to_string(),
                handle: Some(handle.label().to_string()),
                panic: Some(panic_message(payload.as_ref())),
            });
        }
    }

    /// Run up to `limit` ready handles; returns how many ran
    fn run_ready_batch(self: &Rc<Self>, limit: usize) -> usize {
        self.flush_foreign();
        let batch = self.sched.borrow_mut().pop_ready_batch(limit);
        for handle in &batch {
            self.run_handle(handle);
        }
        batch.len()
    }

    fn call_exception_handler(&self, context: &ExceptionContext) {
        let handler = self.exception_handler.borrow().clone();
        match handler {
            Some(handler) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler(context)));
                if let Err(payload) = result {
                    tracing::error!(
                        "Unhandled error in exception handler: {}",
                        panic_message(payload.as_ref())
                    );
                    EventLoop::default_exception_handler(context);
                }
            }
            None => EventLoop::default_exception_handler(context),
        }
    }

    fn close(self: &Rc<Self>) -> Result<(), LoopError> {
        let state = self.state();
        if state.is_closed() {
            return Ok(());
        }
        if state.is_slave() {
            return Err(LoopError::CloseWhileSlave);
        }
        if self.run_depth.get() > 0 {
            return Err(LoopError::AlreadyRunning);
        }
        if !state.can_transition_to(LoopState::Closed) {
            return Err(LoopError::InvalidState("loop cannot be closed from this state"));
        }

        // Closed first: anything scheduled while cancelling is refused
        self.status.mark_closed();

        let drained = self.sched.borrow_mut().drain();
        let (handles, tasks) = (drained.handles.len(), drained.tasks.len());
        for handle in &drained.handles {
            handle.cancel();
        }
        for task in &drained.tasks {
            task.abort();
        }
        drop(drained);
        self.bridge.borrow_mut().detach();

        tracing::debug!(
            "Closed event loop {} ({} handles and {} tasks cancelled)",
            self.id,
            handles,
            tasks
        );
        Ok(())
    }

    /// Keep the thread's running-loop marker in sync with this loop's status
    fn refresh_running_marker(&self) {
        if self.is_slave() || self.run_depth.get() > 0 {
            policy::set_running_loop(self.id);
        } else {
            policy::clear_running_loop(self.id);
        }
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        self.bridge.get_mut().detach();
        policy::forget_loop(self.id);
    }
}
