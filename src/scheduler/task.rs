// Tasks - Rust futures driven step by step by the event loop
//
// A task is an explicit state machine (Pending -> Running -> Pending ... ->
// Done | Cancelled). Each step is a one-shot Handle on the ready queue; the
// task's waker schedules the next step. The outcome lands in a LoopFuture so
// panics inside the future surface where the task is awaited.

use super::future::LoopFuture;
use super::handle::Handle;
use crate::error::{TaskError, panic_message};
use crate::event_loop::LoopInner;
use crate::policy;
use crate::sys::WakePipe;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, ThreadId};

/// Identifier of a task, unique per loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Cancelled,
}

/// Wakeups coming from threads other than the loop's own
///
/// Queued ids are picked up at the loop's next dispatch; the self-pipe
/// interrupts a blocking wait so that dispatch happens promptly.
pub(crate) struct ForeignWakeups {
    ids: Mutex<Vec<TaskId>>,
    pipe: Option<WakePipe>,
}

impl ForeignWakeups {
    pub(crate) fn new() -> Self {
        let pipe = match WakePipe::new() {
            Ok(pipe) => Some(pipe),
            Err(e) => {
                tracing::warn!("Cross-thread wakeups will not interrupt waits: {}", e);
                None
            }
        };
        Self {
            ids: Mutex::new(Vec::new()),
            pipe,
        }
    }

    fn push(&self, id: TaskId) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.push(id);
        }
        if let Some(pipe) = &self.pipe {
            pipe.notify();
        }
    }

    /// Read end of the self-pipe, readable while wakeups are queued
    pub(crate) fn wake_fd(&self) -> Option<RawFd> {
        self.pipe.as_ref().map(WakePipe::read_fd)
    }

    pub(crate) fn drain(&self) -> Vec<TaskId> {
        if let Some(pipe) = &self.pipe {
            pipe.drain();
        }
        match self.ids.lock() {
            Ok(mut ids) => std::mem::take(&mut *ids),
            Err(_) => Vec::new(),
        }
    }
}

struct TaskWaker {
    loop_id: u64,
    task: TaskId,
    owner_thread: ThreadId,
    foreign: Arc<ForeignWakeups>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if thread::current().id() == self.owner_thread {
            if let Some(owner) = policy::registered_loop(self.loop_id) {
                owner.schedule_task(self.task);
                return;
            }
        }
        self.foreign.push(self.task);
    }
}

/// Type-erased view the scheduler keeps of every live task
pub(crate) trait TaskStep {
    fn step(&self);
    /// Mark the next step as queued; false if one already is
    fn mark_scheduled(&self) -> bool;
    fn request_cancel(&self) -> bool;
    /// Drop the future right away and reject the task as cancelled
    fn abort(&self);
}

type BoxedFuture<T> = Pin<Box<dyn Future<Output = T>>>;

pub(crate) struct TaskCore<T> {
    id: TaskId,
    name: String,
    state: Cell<TaskState>,
    future: RefCell<Option<BoxedFuture<T>>>,
    result: LoopFuture<T>,
    scheduled: Cell<bool>,
    cancel_requested: Cell<bool>,
    /// A wakeup arrived while the task was polling itself
    woken_while_running: Cell<bool>,
    waker: Waker,
    owner: Weak<LoopInner>,
}

impl<T: 'static> TaskCore<T> {
    pub(crate) fn new<F>(
        id: TaskId,
        name: String,
        future: F,
        loop_id: u64,
        foreign: Arc<ForeignWakeups>,
        owner: Weak<LoopInner>,
    ) -> Rc<Self>
    where
        F: Future<Output = T> + 'static,
    {
        let waker = Waker::from(Arc::new(TaskWaker {
            loop_id,
            task: id,
            owner_thread: thread::current().id(),
            foreign,
        }));
        Rc::new(Self {
            id,
            name,
            state: Cell::new(TaskState::Pending),
            future: RefCell::new(Some(Box::pin(future))),
            result: LoopFuture::new(owner.clone()),
            scheduled: Cell::new(false),
            cancel_requested: Cell::new(false),
            woken_while_running: Cell::new(false),
            waker,
            owner,
        })
    }

    fn finish(&self, state: TaskState, outcome: Result<T, TaskError>) {
        self.state.set(state);
        let completed = match outcome {
            Ok(v) => self.result.resolve(v),
            Err(e) => self.result.reject(e),
        };
        if completed.is_err() {
            tracing::warn!("Task {} finished twice", self.name);
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.forget_task(self.id);
        }
    }

    fn reschedule(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.schedule_task(self.id);
        }
    }
}

impl<T: 'static> TaskStep for TaskCore<T> {
    fn step(&self) {
        self.scheduled.set(false);
        if matches!(self.state.get(), TaskState::Done | TaskState::Cancelled) {
            return;
        }

        let Ok(mut slot) = self.future.try_borrow_mut() else {
            self.woken_while_running.set(true);
            return;
        };

        if self.cancel_requested.get() {
            let future = slot.take();
            drop(slot);
            drop(future);
            self.finish(TaskState::Cancelled, Err(TaskError::Cancelled));
            return;
        }

        let Some(future) = slot.as_mut() else {
            return;
        };

        self.state.set(TaskState::Running);
        self.woken_while_running.set(false);
        let mut cx = Context::from_waker(&self.waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        match polled {
            Ok(Poll::Pending) => {
                drop(slot);
                self.state.set(TaskState::Pending);
                if self.cancel_requested.get() || self.woken_while_running.get() {
                    self.reschedule();
                }
            }
            Ok(Poll::Ready(value)) => {
                let future = slot.take();
                drop(slot);
                drop(future);
                self.finish(TaskState::Done, Ok(value));
            }
            Err(payload) => {
                let future = slot.take();
                drop(slot);
                drop(future);
                let message = panic_message(payload.as_ref());
                tracing::debug!("Task {} panicked: {}", self.name, message);
                self.finish(TaskState::Done, Err(TaskError::Panicked(message)));
            }
        }
    }

    fn mark_scheduled(&self) -> bool {
        !self.scheduled.replace(true)
    }

    fn request_cancel(&self) -> bool {
        if matches!(self.state.get(), TaskState::Done | TaskState::Cancelled) {
            return false;
        }
        self.cancel_requested.set(true);
        self.reschedule();
        true
    }

    fn abort(&self) {
        if matches!(self.state.get(), TaskState::Done | TaskState::Cancelled) {
            return;
        }
        let future = match self.future.try_borrow_mut() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                // Polling right now: cancel at the next step instead
                self.cancel_requested.set(true);
                return;
            }
        };
        drop(future);
        self.finish(TaskState::Cancelled, Err(TaskError::Cancelled));
    }
}

/// Handle to a spawned task
///
/// Awaiting a `Task<T>` from another task yields its outcome; panics inside
/// the task's future come back as [`TaskError::Panicked`].
pub struct Task<T> {
    core: Rc<TaskCore<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: 'static> Task<T> {
    pub(crate) fn from_core(core: Rc<TaskCore<T>>) -> Self {
        Self { core }
    }

    pub(crate) fn as_step(&self) -> Rc<dyn TaskStep> {
        self.core.clone()
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> TaskState {
        self.core.state.get()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state(), TaskState::Done | TaskState::Cancelled)
    }

    /// Request cancellation; the future is dropped at the next step
    pub fn cancel(&self) -> bool {
        self.core.request_cancel()
    }

    /// The future receiving the task's outcome
    pub fn future(&self) -> &LoopFuture<T> {
        &self.core.result
    }

    pub fn take_result(&self) -> Option<Result<T, TaskError>> {
        self.core.result.take_result()
    }

    pub(crate) fn abort(&self) {
        self.core.abort();
    }
}

impl<T: Clone + 'static> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut result = self.core.result.clone();
        Pin::new(&mut result).poll(cx)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.core.state.get())
            .finish()
    }
}

/// Ready-queue handle running one step of `task`
pub(crate) fn step_handle(task: Rc<dyn TaskStep>, label: &str) -> Handle {
    Handle::once(label, move || task.step())
}
