// Slave lifecycle and mirroring
//
// While the loop is a slave, each scheduler readiness source has one native
// mirror registered through the bridge. The native callbacks below are the
// only way scheduler work runs from a native dispatch. Each one checks its
// token first: a mirror that was detached, replaced or reconciled away does
// nothing when it fires.

use super::LoopInner;
use crate::bridge::{MirrorKey, MirrorKind, MirrorToken, NativeCallback};
use crate::error::LoopError;
use crate::native::{ControlFlow, IoCondition};
use crate::policy;
use crate::scheduler::TimerId;
use crate::state::LoopState;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

impl LoopInner {
    pub(super) fn start_slave_loop(&self) -> Result<(), LoopError> {
        let state = self.state();
        match state {
            LoopState::Closed => return Err(LoopError::Closed),
            LoopState::SlaveActive => return Err(LoopError::AlreadySlave),
            _ => {}
        }
        if self.run_depth.get() > 0 {
            return Err(LoopError::AlreadyRunning);
        }
        if let Some(other) = policy::active_slave() {
            if other != self.id {
                return Err(LoopError::SlaveLoopActive);
            }
        }
        if let Some(other) = policy::running_loop_id() {
            if other != self.id {
                return Err(LoopError::AlreadyRunning);
            }
        }
        if !state.can_transition_to(LoopState::SlaveActive) {
            return Err(LoopError::InvalidState("loop cannot become a slave from this state"));
        }

        policy::set_active_slave(self.id);
        self.bridge.borrow_mut().attach();
        let mirrors = self.reconcile();
        self.status.enter_slave(mirrors);
        self.refresh_running_marker();

        tracing::debug!("Event loop {}: slave mode started, {} sources mirrored", self.id, mirrors);
        Ok(())
    }

    pub(super) fn stop_slave_loop(&self) -> Result<(), LoopError> {
        if !self.is_slave() {
            return Err(LoopError::NotSlave);
        }

        let detached = self.bridge.borrow_mut().detach();
        policy::clear_active_slave(self.id);
        self.status.leave_slave(detached);
        self.refresh_running_marker();

        tracing::debug!("Event loop {}: slave mode stopped, {} native sources removed", self.id, detached);
        Ok(())
    }

    /// Make the mirror table match the scheduler: drop mirrors whose source
    /// is gone, add mirrors for sources that have none. Returns the number
    /// of mirrors afterwards.
    pub(super) fn reconcile(&self) -> usize {
        if !self.bridge.borrow().is_mirroring() {
            return 0;
        }

        let (has_ready, timers, interests) = {
            let sched = self.sched.borrow();
            (sched.has_ready(), sched.timer_entries(), sched.io_interests())
        };
        let wake_fd = self.foreign.wake_fd();

        let keys = self.bridge.borrow().keys();
        for key in keys {
            let keep = match key {
                MirrorKey::Ready => has_ready,
                MirrorKey::Timer(id) => timers.iter().any(|(t, _)| *t == id),
                MirrorKey::Io(fd) => interests.iter().any(|(f, c)| *f == fd && !c.is_empty()),
                MirrorKey::Wakeup => wake_fd.is_some(),
            };
            if !keep {
                self.bridge.borrow_mut().unmirror(key);
            }
        }

        if has_ready {
            self.ensure_ready_pump();
        }
        for (id, when) in timers {
            if !self.bridge.borrow().contains(MirrorKey::Timer(id)) {
                self.mirror_timer(id, when);
            }
        }
        for (fd, _) in interests {
            self.sync_io(fd);
        }
        if let Some(fd) = wake_fd {
            if !self.bridge.borrow().contains(MirrorKey::Wakeup) {
                self.mirror_wakeup(fd);
            }
        }

        self.bridge.borrow().len()
    }

    /// Mirror the ready queue if it has work and no pump is registered
    pub(super) fn ensure_ready_pump(&self) {
        let mut bridge = self.bridge.borrow_mut();
        if !bridge.is_mirroring() || bridge.contains(MirrorKey::Ready) {
            return;
        }
        let weak = self.this.clone();
        bridge.mirror(MirrorKey::Ready, MirrorKind::Timeout(Duration::ZERO), move |token| {
            NativeCallback::Plain(Box::new(move || match weak.upgrade() {
                Some(inner) => inner.on_ready_pump(token),
                None => ControlFlow::Break,
            }))
        });
    }

    /// After a nested run: keep or add the pump while work is left for it.
    /// An empty queue keeps a pump only if one was there at entry; that pump
    /// removes itself on its next dispatch.
    pub(super) fn restore_ready_pump(&self, was_mirrored: bool) {
        let has_ready = self.sched.borrow().has_ready();
        if has_ready {
            self.ensure_ready_pump();
        } else if !was_mirrored {
            self.bridge.borrow_mut().unmirror(MirrorKey::Ready);
        }
    }

    pub(super) fn mirror_timer(&self, id: TimerId, when: Instant) {
        let delay = when.saturating_duration_since(Instant::now());
        let weak = self.this.clone();
        self.bridge
            .borrow_mut()
            .mirror(MirrorKey::Timer(id), MirrorKind::Timeout(delay), move |token| {
                NativeCallback::Plain(Box::new(move || match weak.upgrade() {
                    Some(inner) => inner.on_timer(id, token),
                    None => ControlFlow::Break,
                }))
            });
    }

    /// Bring the mirror of `fd` in line with its reader/writer interest
    pub(super) fn sync_io(&self, fd: RawFd) {
        if !self.bridge.borrow().is_mirroring() {
            return;
        }
        let wanted = self.sched.borrow().io_condition(fd);
        let current = self.bridge.borrow().condition(MirrorKey::Io(fd));

        if wanted.is_empty() {
            if current.is_some() {
                self.bridge.borrow_mut().unmirror(MirrorKey::Io(fd));
            }
            return;
        }
        if current == Some(wanted) {
            return;
        }

        let weak = self.this.clone();
        self.bridge
            .borrow_mut()
            .mirror(MirrorKey::Io(fd), MirrorKind::Fd(fd, wanted), move |token| {
                NativeCallback::Fd(Box::new(move |_, reported| match weak.upgrade() {
                    Some(inner) => inner.on_io(fd, token, reported),
                    None => ControlFlow::Break,
                }))
            });
    }

    fn mirror_wakeup(&self, fd: RawFd) {
        let weak = self.this.clone();
        self.bridge
            .borrow_mut()
            .mirror(MirrorKey::Wakeup, MirrorKind::Fd(fd, IoCondition::IN), move |token| {
                NativeCallback::Fd(Box::new(move |_, _| match weak.upgrade() {
                    Some(inner) => inner.on_wakeup(token),
                    None => ControlFlow::Break,
                }))
            });
    }

    fn is_current(&self, key: MirrorKey, token: MirrorToken) -> bool {
        let current = self.bridge.borrow().is_current(key, token);
        if !current {
            self.metrics.record_stale_fire();
            tracing::trace!("Event loop {}: ignoring stale native fire for {:?}", self.id, key);
        }
        current
    }

    // Native callbacks

    fn on_ready_pump(&self, token: MirrorToken) -> ControlFlow {
        if !self.is_current(MirrorKey::Ready, token) {
            return ControlFlow::Break;
        }
        let limit = self.config.borrow().ready_batch_limit();
        if let Some(inner) = self.this.upgrade() {
            inner.run_ready_batch(limit);
        }

        if !self.bridge.borrow().is_current(MirrorKey::Ready, token) {
            // Replaced or removed while the batch ran
            return ControlFlow::Break;
        }
        if self.sched.borrow().has_ready() {
            ControlFlow::Continue
        } else {
            self.bridge.borrow_mut().forget(MirrorKey::Ready, token);
            ControlFlow::Break
        }
    }

    fn on_timer(&self, id: TimerId, token: MirrorToken) -> ControlFlow {
        if !self.is_current(MirrorKey::Timer(id), token) {
            return ControlFlow::Break;
        }

        let deadline = self.sched.borrow().timer_deadline(id);
        match deadline {
            None => {
                self.bridge.borrow_mut().forget(MirrorKey::Timer(id), token);
            }
            Some(when) if when > Instant::now() => {
                // Fired early; wait out the rest
                self.mirror_timer(id, when);
            }
            Some(_) => {
                self.bridge.borrow_mut().forget(MirrorKey::Timer(id), token);
                let handle = self.sched.borrow_mut().remove_timer(id);
                if let Some(handle) = handle {
                    self.run_handle(&handle);
                }
            }
        }
        ControlFlow::Break
    }

    fn on_io(&self, fd: RawFd, token: MirrorToken, reported: IoCondition) -> ControlFlow {
        if !self.is_current(MirrorKey::Io(fd), token) {
            return ControlFlow::Break;
        }

        let handles = self.sched.borrow().io_ready_handles(fd, reported);
        if handles.is_empty() {
            tracing::warn!(
                "Event loop {}: fd {} reported {:?} without a matching reader or writer",
                self.id,
                fd,
                reported
            );
        }
        for handle in &handles {
            self.run_handle(handle);
        }

        if self.bridge.borrow().is_current(MirrorKey::Io(fd), token) {
            ControlFlow::Continue
        } else {
            ControlFlow::Break
        }
    }

    fn on_wakeup(&self, token: MirrorToken) -> ControlFlow {
        if !self.is_current(MirrorKey::Wakeup, token) {
            return ControlFlow::Break;
        }
        if let Some(inner) = self.this.upgrade() {
            inner.flush_foreign();
        }
        ControlFlow::Continue
    }
}
