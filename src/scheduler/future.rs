use super::handle::Handle;
use crate::error::{LoopError, TaskError};
use crate::event_loop::LoopInner;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// Observable state of a [`LoopFuture`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    Pending,
    Resolved,
    Rejected,
}

enum Slot<T> {
    Pending,
    Resolved(T),
    Rejected(TaskError),
    /// Result moved out by `take_result`
    Taken(FutureStatus),
}

type DoneCallback<T> = Box<dyn FnOnce(&LoopFuture<T>)>;

struct FutureCore<T> {
    slot: RefCell<Slot<T>>,
    wakers: RefCell<Vec<Waker>>,
    callbacks: RefCell<Vec<DoneCallback<T>>>,
    owner: Weak<LoopInner>,
}

/// A single-assignment promise owned by an event loop
///
/// Transitions once from `Pending` to `Resolved` or `Rejected`. Awaiting it
/// from a task yields a clone of the outcome; done callbacks are scheduled on
/// the owning loop with `call_soon` semantics.
pub struct LoopFuture<T> {
    core: Rc<FutureCore<T>>,
}

impl<T> Clone for LoopFuture<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: 'static> LoopFuture<T> {
    pub(crate) fn new(owner: Weak<LoopInner>) -> Self {
        Self {
            core: Rc::new(FutureCore {
                slot: RefCell::new(Slot::Pending),
                wakers: RefCell::new(Vec::new()),
                callbacks: RefCell::new(Vec::new()),
                owner,
            }),
        }
    }

    /// A future not bound to any loop; done callbacks run inline
    pub fn detached() -> Self {
        Self::new(Weak::new())
    }

    pub fn status(&self) -> FutureStatus {
        match &*self.core.slot.borrow() {
            Slot::Pending => FutureStatus::Pending,
            Slot::Resolved(_) => FutureStatus::Resolved,
            Slot::Rejected(_) => FutureStatus::Rejected,
            Slot::Taken(status) => *status,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status() != FutureStatus::Pending
    }

    pub fn resolve(&self, value: T) -> Result<(), LoopError> {
        self.complete(Slot::Resolved(value))
    }

    pub fn reject(&self, error: TaskError) -> Result<(), LoopError> {
        self.complete(Slot::Rejected(error))
    }

    /// Reject with [`TaskError::Cancelled`]; false if already done
    pub fn cancel(&self) -> bool {
        self.complete(Slot::Rejected(TaskError::Cancelled)).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.core.slot.borrow(), Slot::Rejected(TaskError::Cancelled))
    }

    /// Move the outcome out; None while pending or once taken
    pub fn take_result(&self) -> Option<Result<T, TaskError>> {
        let mut slot = self.core.slot.borrow_mut();
        let status = match &*slot {
            Slot::Pending | Slot::Taken(_) => return None,
            Slot::Resolved(_) => FutureStatus::Resolved,
            Slot::Rejected(_) => FutureStatus::Rejected,
        };
        match std::mem::replace(&mut *slot, Slot::Taken(status)) {
            Slot::Resolved(v) => Some(Ok(v)),
            Slot::Rejected(e) => Some(Err(e)),
            _ => None,
        }
    }

    /// Run `callback` once the future is done
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&LoopFuture<T>) + 'static,
    {
        if self.is_done() {
            self.schedule_callback(Box::new(callback));
        } else {
            self.core.callbacks.borrow_mut().push(Box::new(callback));
        }
    }

    fn complete(&self, outcome: Slot<T>) -> Result<(), LoopError> {
        {
            let mut slot = self.core.slot.borrow_mut();
            if !matches!(&*slot, Slot::Pending) {
                return Err(LoopError::InvalidState("future is already done"));
            }
            *slot = outcome;
        }

        let wakers = std::mem::take(&mut *self.core.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
        let callbacks = std::mem::take(&mut *self.core.callbacks.borrow_mut());
        for callback in callbacks {
            self.schedule_callback(callback);
        }
        Ok(())
    }

    fn schedule_callback(&self, callback: DoneCallback<T>) {
        match self.core.owner.upgrade() {
            Some(owner) => {
                let future = self.clone();
                let handle = Handle::once("future done callback", move || callback(&future));
                if let Err(e) = owner.schedule(handle) {
                    tracing::debug!("Dropping future done callback: {}", e);
                }
            }
            None => callback(self),
        }
    }
}

impl<T: Clone + 'static> LoopFuture<T> {
    /// Clone of the outcome, None while pending
    pub fn result(&self) -> Option<Result<T, TaskError>> {
        match &*self.core.slot.borrow() {
            Slot::Pending => None,
            Slot::Resolved(v) => Some(Ok(v.clone())),
            Slot::Rejected(e) => Some(Err(e.clone())),
            Slot::Taken(_) => Some(Err(TaskError::Failed("result was already taken".to_string()))),
        }
    }
}

impl<T: Clone + 'static> Future for LoopFuture<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.result() {
            return Poll::Ready(outcome);
        }
        let mut wakers = self.core.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for LoopFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &*self.core.slot.borrow() {
            Slot::Pending => "pending",
            Slot::Resolved(_) => "resolved",
            Slot::Rejected(_) => "rejected",
            Slot::Taken(_) => "taken",
        };
        f.debug_struct("LoopFuture").field("status", &status).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_resolve_once() {
        let fut = LoopFuture::<u32>::detached();
        assert_eq!(fut.status(), FutureStatus::Pending);

        fut.resolve(7).unwrap();
        assert_eq!(fut.status(), FutureStatus::Resolved);
        assert!(matches!(fut.resolve(8), Err(LoopError::InvalidState(_))));
        assert_eq!(fut.result(), Some(Ok(7)));
    }

    #[test]
    fn test_cancel_rejects() {
        let fut = LoopFuture::<()>::detached();
        assert!(fut.cancel());
        assert!(fut.is_cancelled());
        assert!(!fut.cancel());
        assert_eq!(fut.result(), Some(Err(TaskError::Cancelled)));
    }

    #[test]
    fn test_take_result_keeps_status() {
        let fut = LoopFuture::<String>::detached();
        fut.resolve("done".to_string()).unwrap();

        assert_eq!(fut.take_result(), Some(Ok("done".to_string())));
        assert_eq!(fut.take_result(), None);
        assert_eq!(fut.status(), FutureStatus::Resolved);
    }

    #[test]
    fn test_detached_done_callback_runs_inline() {
        let fut = LoopFuture::<u8>::detached();
        let seen = Rc::new(Cell::new(0));

        let s = seen.clone();
        fut.add_done_callback(move |f| s.set(f.result().unwrap().unwrap()));
        assert_eq!(seen.get(), 0);

        fut.resolve(5).unwrap();
        assert_eq!(seen.get(), 5);

        // Added after completion: runs right away
        let s = seen.clone();
        fut.add_done_callback(move |_| s.set(9));
        assert_eq!(seen.get(), 9);
    }

    #[test]
    fn test_poll_wakes_registered_waker() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::task::Wake;

        struct Counter(AtomicUsize);
        impl Wake for Counter {
            fn wake(self: Arc<Self>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut cx = Context::from_waker(&waker);

        let mut fut = LoopFuture::<u8>::detached();
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());

        fut.resolve(1).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(Ok(1)));
    }
}
