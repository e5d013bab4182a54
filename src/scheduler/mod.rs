//! Cooperative scheduler bookkeeping.
//!
//! [`Scheduler`] is plain data: the ready queue, the timer table, fd
//! interests and the live task table. It never runs user code; the event loop
//! takes handles out of it and runs them after releasing its borrow, which
//! keeps every callback free to call back into the loop.
//!
//! - [`Handle`] / [`TimerHandle`]: cancellable scheduled callbacks
//! - [`LoopFuture`]: single-assignment promise
//! - [`Task`]: spawned Rust future with an explicit state machine

pub mod future;
pub mod handle;
pub mod task;

pub use future::{FutureStatus, LoopFuture};
pub use handle::{Handle, TimerHandle, TimerId};
pub use task::{Task, TaskId, TaskState};

use crate::native::IoCondition;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;
use task::TaskStep;

#[derive(Default)]
pub(crate) struct IoRegistration {
    pub(crate) reader: Option<Handle>,
    pub(crate) writer: Option<Handle>,
}

impl IoRegistration {
    pub(crate) fn condition(&self) -> IoCondition {
        let mut condition = IoCondition::empty();
        if self.reader.is_some() {
            condition |= IoCondition::IN;
        }
        if self.writer.is_some() {
            condition |= IoCondition::OUT;
        }
        condition
    }

    /// Handles to run for a reported condition
    pub(crate) fn ready_handles(&self, reported: IoCondition) -> Vec<Handle> {
        let mut handles = Vec::with_capacity(2);
        if let Some(reader) = &self.reader {
            if reported.intersects(IoCondition::READABLE) {
                handles.push(reader.clone());
            }
        }
        if let Some(writer) = &self.writer {
            if reported.intersects(IoCondition::WRITABLE) {
                handles.push(writer.clone());
            }
        }
        handles
    }
}

/// Comparable snapshot of scheduler-level registrations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookkeeping {
    pub ready: usize,
    pub timers: Vec<(TimerId, Instant)>,
    pub readers: Vec<RawFd>,
    pub writers: Vec<RawFd>,
    pub tasks: Vec<TaskId>,
}

impl Bookkeeping {
    pub fn is_empty(&self) -> bool {
        self.ready == 0
            && self.timers.is_empty()
            && self.readers.is_empty()
            && self.writers.is_empty()
            && self.tasks.is_empty()
    }
}

/// Everything `close()` takes out of the scheduler to drop outside the borrow
pub(crate) struct Drained {
    pub(crate) handles: Vec<Handle>,
    pub(crate) tasks: Vec<Rc<dyn TaskStep>>,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    ready: VecDeque<Handle>,
    timers: BTreeMap<(Instant, TimerId), Handle>,
    deadlines: HashMap<TimerId, Instant>,
    io: IndexMap<RawFd, IoRegistration>,
    tasks: HashMap<TaskId, Rc<dyn TaskStep>>,
    next_id: u64,
}

impl Scheduler {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // Ready queue

    pub(crate) fn push_ready(&mut self, handle: Handle) {
        self.ready.push_back(handle);
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Up to `limit` handles from the front of the queue, cancelled ones skipped
    pub(crate) fn pop_ready_batch(&mut self, limit: usize) -> Vec<Handle> {
        let n = limit.min(self.ready.len());
        self.ready
            .drain(..n)
            .filter(|h| !h.is_cancelled())
            .collect()
    }

    // Timers

    pub(crate) fn insert_timer(&mut self, when: Instant, handle: Handle) -> TimerId {
        let id = TimerId(self.next_id());
        self.timers.insert((when, id), handle);
        self.deadlines.insert(id, when);
        id
    }

    pub(crate) fn remove_timer(&mut self, id: TimerId) -> Option<Handle> {
        let when = self.deadlines.remove(&id)?;
        self.timers.remove(&(when, id))
    }

    pub(crate) fn timer_deadline(&self, id: TimerId) -> Option<Instant> {
        self.deadlines.get(&id).copied()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(when, _)| *when)
    }

    pub(crate) fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(TimerId, Handle)> {
        let mut due = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), handle) = entry.remove_entry();
            self.deadlines.remove(&id);
            due.push((id, handle));
        }
        due
    }

    pub(crate) fn timer_entries(&self) -> Vec<(TimerId, Instant)> {
        self.timers.keys().map(|(when, id)| (*id, *when)).collect()
    }

    // Fd interests

    /// Install a reader or writer; returns the handle it replaced
    pub(crate) fn set_io(&mut self, fd: RawFd, condition: IoCondition, handle: Handle) -> Option<Handle> {
        let registration = self.io.entry(fd).or_default();
        if condition.contains(IoCondition::IN) {
            registration.reader.replace(handle)
        } else {
            registration.writer.replace(handle)
        }
    }

    /// Remove a reader or writer; returns the removed handle
    pub(crate) fn clear_io(&mut self, fd: RawFd, condition: IoCondition) -> Option<Handle> {
        let registration = self.io.get_mut(&fd)?;
        let removed = if condition.contains(IoCondition::IN) {
            registration.reader.take()
        } else {
            registration.writer.take()
        };
        if registration.reader.is_none() && registration.writer.is_none() {
            self.io.shift_remove(&fd);
        }
        removed
    }

    pub(crate) fn io_condition(&self, fd: RawFd) -> IoCondition {
        self.io
            .get(&fd)
            .map(IoRegistration::condition)
            .unwrap_or_else(IoCondition::empty)
    }

    pub(crate) fn io_ready_handles(&self, fd: RawFd, reported: IoCondition) -> Vec<Handle> {
        self.io
            .get(&fd)
            .map(|r| r.ready_handles(reported))
            .unwrap_or_default()
    }

    pub(crate) fn io_interests(&self) -> Vec<(RawFd, IoCondition)> {
        self.io.iter().map(|(fd, r)| (*fd, r.condition())).collect()
    }

    pub(crate) fn has_io(&self) -> bool {
        !self.io.is_empty()
    }

    // Tasks

    pub(crate) fn next_task_id(&mut self) -> TaskId {
        TaskId(self.next_id())
    }

    pub(crate) fn insert_task(&mut self, id: TaskId, task: Rc<dyn TaskStep>) {
        self.tasks.insert(id, task);
    }

    pub(crate) fn task(&self, id: TaskId) -> Option<Rc<dyn TaskStep>> {
        self.tasks.get(&id).cloned()
    }

    pub(crate) fn remove_task(&mut self, id: TaskId) -> Option<Rc<dyn TaskStep>> {
        self.tasks.remove(&id)
    }

    pub(crate) fn task_count(&self) -> usize {
        self.tasks.len()
    }

    // Whole-scheduler views

    pub(crate) fn bookkeeping(&self) -> Bookkeeping {
        let mut readers: Vec<RawFd> = self
            .io
            .iter()
            .filter(|(_, r)| r.reader.is_some())
            .map(|(fd, _)| *fd)
            .collect();
        let mut writers: Vec<RawFd> = self
            .io
            .iter()
            .filter(|(_, r)| r.writer.is_some())
            .map(|(fd, _)| *fd)
            .collect();
        readers.sort_unstable();
        writers.sort_unstable();
        let mut tasks: Vec<TaskId> = self.tasks.keys().copied().collect();
        tasks.sort_unstable();

        Bookkeeping {
            ready: self.ready.len(),
            timers: self.timer_entries(),
            readers,
            writers,
            tasks,
        }
    }

    /// Take every registration out, leaving the scheduler empty
    pub(crate) fn drain(&mut self) -> Drained {
        let mut handles: Vec<Handle> = self.ready.drain(..).collect();
        handles.extend(std::mem::take(&mut self.timers).into_values());
        self.deadlines.clear();
        for (_, registration) in self.io.drain(..) {
            handles.extend(registration.reader);
            handles.extend(registration.writer);
        }
        let tasks = self.tasks.drain().map(|(_, t)| t).collect();
        Drained { handles, tasks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn noop(label: &str) -> Handle {
        Handle::once(label, || {})
    }

    #[test]
    fn test_timers_come_out_in_deadline_order() {
        let mut sched = Scheduler::default();
        let now = Instant::now();
        let late = sched.insert_timer(now + Duration::from_millis(20), noop("late"));
        let early = sched.insert_timer(now + Duration::from_millis(10), noop("early"));
        let future = sched.insert_timer(now + Duration::from_secs(60), noop("future"));

        assert_eq!(sched.next_deadline(), Some(now + Duration::from_millis(10)));

        let due = sched.take_due(now + Duration::from_millis(30));
        let ids: Vec<TimerId> = due.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![early, late]);
        assert_eq!(sched.timer_deadline(future), Some(now + Duration::from_secs(60)));
        assert_eq!(sched.timer_deadline(early), None);
    }

    #[test]
    fn test_remove_timer() {
        let mut sched = Scheduler::default();
        let id = sched.insert_timer(Instant::now(), noop("t"));
        assert!(sched.remove_timer(id).is_some());
        assert!(sched.remove_timer(id).is_none());
        assert!(!sched.has_timers());
    }

    #[test]
    fn test_ready_batch_skips_cancelled() {
        let mut sched = Scheduler::default();
        let cancelled = noop("cancelled");
        cancelled.cancel();
        sched.push_ready(noop("a"));
        sched.push_ready(cancelled);
        sched.push_ready(noop("b"));
        sched.push_ready(noop("c"));

        let batch = sched.pop_ready_batch(3);
        let labels: Vec<&str> = batch.iter().map(|h| h.label()).collect();
        assert_eq!(labels, vec!["a", "b"]);
        assert_eq!(sched.ready_len(), 1);
    }

    #[test]
    fn test_io_interest_tracking() {
        let mut sched = Scheduler::default();
        assert!(sched.set_io(5, IoCondition::IN, noop("r")).is_none());
        assert!(sched.set_io(5, IoCondition::OUT, noop("w")).is_none());
        assert_eq!(sched.io_condition(5), IoCondition::IN | IoCondition::OUT);

        let replaced = sched.set_io(5, IoCondition::IN, noop("r2"));
        assert_eq!(replaced.map(|h| h.label().to_string()), Some("r".to_string()));

        let handles = sched.io_ready_handles(5, IoCondition::HUP);
        assert_eq!(handles.len(), 2);
        let handles = sched.io_ready_handles(5, IoCondition::IN);
        assert_eq!(handles[0].label(), "r2");

        sched.clear_io(5, IoCondition::IN);
        assert_eq!(sched.io_condition(5), IoCondition::OUT);
        sched.clear_io(5, IoCondition::OUT);
        assert!(!sched.has_io());
    }

    #[test]
    fn test_drain_empties_everything() {
        let mut sched = Scheduler::default();
        sched.push_ready(noop("a"));
        sched.insert_timer(Instant::now(), noop("t"));
        sched.set_io(3, IoCondition::IN, noop("r"));

        let drained = sched.drain();
        assert_eq!(drained.handles.len(), 3);
        assert!(sched.bookkeeping().is_empty());
    }
}
