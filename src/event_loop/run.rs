// Run modes
//
// A run spawns the awaited future as a task and iterates until the task is
// done. Each iteration picks its step from the current state, so a run that
// started as a slave and sees stop_slave_loop() mid-way carries on standalone:
// - standalone: own poll(2) selector over the loop's fds, own timers
// - slave: nested native iterations; the ready queue is processed directly
//   first so the run progresses even inside a native dispatch
// - without native: ready queue and due timers only, never the native loop

use super::LoopInner;
use crate::bridge::MirrorKey;
use crate::error::LoopError;
use crate::native::IoCondition;
use crate::policy;
use crate::sys;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunMode {
    Normal,
    WithoutNative,
}

/// Bookkeeping of one run on the stack; restores everything on drop,
/// unwinding included
struct RunGuard<'a> {
    inner: &'a Rc<LoopInner>,
    mode: RunMode,
    ready_pump_at_entry: bool,
}

impl<'a> RunGuard<'a> {
    fn enter(inner: &'a Rc<LoopInner>, mode: RunMode) -> Self {
        inner.run_depth.set(inner.run_depth.get() + 1);
        let depth = inner.status.enter_run();
        inner.refresh_running_marker();

        let ready_pump_at_entry = inner.bridge.borrow().contains(MirrorKey::Ready);
        if mode == RunMode::WithoutNative {
            inner.bridge.borrow_mut().suspend();
        }
        tracing::debug!("Event loop {}: entered {:?} run at depth {}", inner.id, mode, depth);

        Self {
            inner,
            mode,
            ready_pump_at_entry,
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let inner = self.inner;
        inner.run_depth.set(inner.run_depth.get().saturating_sub(1));
        let depth = inner.status.exit_run();

        if self.mode == RunMode::WithoutNative {
            let live = inner.bridge.borrow_mut().resume();
            if live {
                inner.reconcile();
            }
        } else if inner.bridge.borrow().is_mirroring() {
            inner.restore_ready_pump(self.ready_pump_at_entry);
        }

        inner.refresh_running_marker();
        tracing::debug!("Event loop {}: left {:?} run, depth now {}", inner.id, self.mode, depth);
    }
}

impl LoopInner {
    fn check_can_run(&self) -> Result<(), LoopError> {
        self.check_closed()?;
        // Nesting is only allowed while the native loop owns iteration
        if self.run_depth.get() > 0 && !self.is_slave() {
            return Err(LoopError::AlreadyRunning);
        }
        if let Some(other) = policy::running_loop_id() {
            if other != self.id {
                return Err(LoopError::AlreadyRunning);
            }
        }
        Ok(())
    }

    pub(super) fn run_until_complete<F, T>(self: &Rc<Self>, future: F, mode: RunMode) -> Result<T, LoopError>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.check_can_run()?;

        let (task, outcome) = {
            // Spawned inside the guard: a suspended bridge must not mirror the first step
            let _guard = RunGuard::enter(self, mode);
            let task = self.spawn_task(Some(format!("run-{}", self.run_depth.get())), future)?;
            let started = Instant::now();
            let stall_deadline = match mode {
                RunMode::WithoutNative => self.config.borrow().stall_timeout().map(|t| (t, started + t)),
                RunMode::Normal => None,
            };

            let mut outcome = Ok(());
            while !task.is_done() {
                if self.stopping.replace(false) {
                    outcome = Err(LoopError::InvalidState("event loop stopped before the future completed"));
                    break;
                }
                if let Some((timeout, deadline)) = stall_deadline {
                    if Instant::now() >= deadline {
                        outcome = Err(LoopError::Stalled(timeout));
                        break;
                    }
                }

                let step = match (mode, self.is_slave()) {
                    (RunMode::Normal, true) => self.run_once_nested(),
                    (RunMode::WithoutNative, true) => self.run_once_without_native(stall_deadline.map(|(_, d)| d)),
                    (_, false) => self.run_once_standalone(stall_deadline.map(|(_, d)| d)),
                };
                if let Err(e) = step {
                    outcome = Err(e);
                    break;
                }
            }
            self.stopping.set(false);
            (task, outcome)
        };

        if let Err(e) = outcome {
            task.abort();
            tracing::debug!("Event loop {}: run ended without a result: {}", self.id, e);
            return Err(e);
        }

        match task.take_result() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(LoopError::Task(e)),
            None => Err(LoopError::InvalidState("run finished without a result")),
        }
    }

    pub(super) fn run_forever(self: &Rc<Self>) -> Result<(), LoopError> {
        self.check_can_run()?;
        let _guard = RunGuard::enter(self, RunMode::Normal);
        loop {
            if self.is_slave() {
                self.run_once_nested()?;
            } else {
                self.run_once_standalone(None)?;
            }
            if self.stopping.replace(false) {
                return Ok(());
            }
        }
    }

    /// One standalone iteration: wait for fds or the next timer, then run
    /// what became ready, like one `_run_once` of a selector loop
    fn run_once_standalone(self: &Rc<Self>, cap: Option<Instant>) -> Result<(), LoopError> {
        self.flush_foreign();

        let now = Instant::now();
        let (mut timeout, mut watches) = {
            let sched = self.sched.borrow();
            let timeout = if sched.has_ready() || self.stopping.get() {
                Some(Duration::ZERO)
            } else {
                sched.next_deadline().map(|d| d.saturating_duration_since(now))
            };
            (timeout, sched.io_interests())
        };
        if let Some(cap) = cap {
            let until_cap = cap.saturating_duration_since(now);
            timeout = Some(timeout.map_or(until_cap, |t| t.min(until_cap)));
        }

        let wake_fd = self.foreign.wake_fd();
        if let Some(fd) = wake_fd {
            watches.push((fd, IoCondition::IN));
        }
        if timeout.is_none() && watches.is_empty() {
            return Err(LoopError::NoProgress {
                pending_tasks: self.pending_tasks(),
            });
        }

        let reported = sys::wait_fds(&watches, timeout)?;

        let mut ready = Vec::new();
        {
            let sched = self.sched.borrow();
            for ((fd, _), condition) in watches.iter().zip(&reported) {
                if Some(*fd) == wake_fd || condition.is_empty() {
                    continue;
                }
                ready.extend(sched.io_ready_handles(*fd, *condition));
            }
        }
        let due = self.sched.borrow_mut().take_due(Instant::now());
        {
            let mut sched = self.sched.borrow_mut();
            for handle in ready {
                sched.push_ready(handle);
            }
            for (_, handle) in due {
                sched.push_ready(handle);
            }
        }

        let ntodo = self.sched.borrow().ready_len();
        self.run_ready_batch(ntodo);
        Ok(())
    }

    /// One slave iteration from inside the running native loop
    fn run_once_nested(self: &Rc<Self>) -> Result<(), LoopError> {
        self.flush_foreign();
        let native = self.bridge.borrow().native().clone();

        if self.stopping.get() || self.sched.borrow().has_ready() {
            let limit = self.config.borrow().ready_batch_limit();
            self.run_ready_batch(limit);
            // Give other native sources their turn
            self.metrics.record_native_iteration();
            native.iteration(false);
            return Ok(());
        }

        self.metrics.record_native_iteration();
        let dispatched = native.iteration(true);
        if !dispatched && !self.sched.borrow().has_ready() {
            self.flush_foreign();
            if !self.sched.borrow().has_ready() {
                return Err(LoopError::NoProgress {
                    pending_tasks: self.pending_tasks(),
                });
            }
        }
        Ok(())
    }

    /// One slave iteration that must not touch the native loop: the ready
    /// queue and timers that are already due. An empty queue with no timer
    /// due before `cap` means the future cannot complete this way.
    fn run_once_without_native(self: &Rc<Self>, cap: Option<Instant>) -> Result<(), LoopError> {
        self.flush_foreign();

        let due = self.sched.borrow_mut().take_due(Instant::now());
        if !due.is_empty() {
            let mut sched = self.sched.borrow_mut();
            for (_, handle) in due {
                sched.push_ready(handle);
            }
        }

        if !self.sched.borrow().has_ready() {
            let next = self.sched.borrow().next_deadline();
            match (next, cap) {
                (Some(when), Some(cap)) if when <= cap => {
                    std::thread::sleep(when.saturating_duration_since(Instant::now()));
                    return Ok(());
                }
                _ => {
                    let sched = self.sched.borrow();
                    tracing::debug!(
                        "Event loop {}: nothing runnable without the native loop (timers: {}, fd watches: {})",
                        self.id,
                        sched.has_timers(),
                        sched.has_io()
                    );
                    return Err(LoopError::NoProgress {
                        pending_tasks: self.pending_tasks(),
                    });
                }
            }
        }

        let ntodo = self.sched.borrow().ready_len();
        self.run_ready_batch(ntodo);
        Ok(())
    }
}
