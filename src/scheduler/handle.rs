use crate::event_loop::LoopInner;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Instant;

/// Identifier of a scheduled timer, unique per loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

enum Callback {
    Once(Option<Box<dyn FnOnce()>>),
    Repeating(Box<dyn FnMut()>),
}

struct HandleInner {
    label: String,
    callback: RefCell<Callback>,
    cancelled: Cell<bool>,
}

/// A scheduled callback that can be cancelled before it runs
///
/// One-shot handles come from `call_soon`/`call_later`; repeating handles back
/// fd readers and writers and run every time the fd is ready.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
}

impl Handle {
    pub(crate) fn once<F>(label: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Self::with_callback(label.into(), Callback::Once(Some(Box::new(callback))))
    }

    pub(crate) fn repeating<F>(label: impl Into<String>, callback: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self::with_callback(label.into(), Callback::Repeating(Box::new(callback)))
    }

    fn with_callback(label: String, callback: Callback) -> Self {
        Self {
            inner: Rc::new(HandleInner {
                label,
                callback: RefCell::new(callback),
                cancelled: Cell::new(false),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Cancel the callback; a handle that is currently running finishes its run
    pub fn cancel(&self) {
        self.inner.cancelled.set(true);
        if let Ok(mut callback) = self.inner.callback.try_borrow_mut() {
            *callback = Callback::Once(None);
        }
    }

    /// Run the callback, catching a panic instead of unwinding into the dispatcher
    pub(crate) fn run(&self) -> Result<(), Box<dyn Any + Send>> {
        if self.is_cancelled() {
            return Ok(());
        }
        let Ok(mut callback) = self.inner.callback.try_borrow_mut() else {
            // Re-entered from its own callback
            return Ok(());
        };
        match &mut *callback {
            Callback::Once(slot) => match slot.take() {
                Some(f) => {
                    drop(callback);
                    panic::catch_unwind(AssertUnwindSafe(f))
                }
                None => Ok(()),
            },
            Callback::Repeating(f) => panic::catch_unwind(AssertUnwindSafe(|| f())),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("label", &self.inner.label)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle of a callback scheduled at a point in time
#[derive(Clone)]
pub struct TimerHandle {
    id: TimerId,
    when: Instant,
    handle: Handle,
    owner: Weak<LoopInner>,
}

impl TimerHandle {
    pub(crate) fn new(id: TimerId, when: Instant, handle: Handle, owner: Weak<LoopInner>) -> Self {
        Self {
            id,
            when,
            handle,
            owner,
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    /// The deadline the timer was scheduled for
    pub fn when(&self) -> Instant {
        self.when
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Cancel the timer and drop its native mirror, if any
    pub fn cancel(&self) {
        self.handle.cancel();
        if let Some(owner) = self.owner.upgrade() {
            owner.timer_cancelled(self.id);
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("when", &self.when)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
