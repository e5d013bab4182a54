//! Event loop policy and the per-thread loop registry.
//!
//! A policy is installed explicitly on the current thread with [`install`]
//! and stays current until its [`PolicyGuard`] is dropped or it is passed to
//! [`uninstall`]. Installations nest: uninstalling restores whatever policy
//! was current before.
//!
//! The registry below is thread-local. It records:
//! - the stack of installed policies
//! - every live loop created on the thread, by id, as a weak reference
//! - the thread's running loop (inside a run method, or a slave)
//! - the thread's slave loop, of which there is at most one

use crate::config::LoopConfig;
use crate::error::LoopError;
use crate::event_loop::{EventLoop, LoopInner};
use crate::native::NativeLoop;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

thread_local! {
    static POLICIES: RefCell<Vec<Rc<EventLoopPolicy>>> = const { RefCell::new(Vec::new()) };
    static LOOPS: RefCell<HashMap<u64, Weak<LoopInner>>> = RefCell::new(HashMap::new());
    static RUNNING: Cell<Option<u64>> = const { Cell::new(None) };
    static ACTIVE_SLAVE: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Creates event loops bound to one native main loop
///
/// # Example
/// ```
/// use gasyncio::native::LocalMainContext;
/// use gasyncio::{EventLoopPolicy, LoopConfig};
/// use std::rc::Rc;
///
/// let policy = Rc::new(EventLoopPolicy::new(Rc::new(LocalMainContext::new()), LoopConfig::default()));
/// let first = policy.get_event_loop();
/// assert_eq!(first, policy.get_event_loop());
/// ```
pub struct EventLoopPolicy {
    native: Rc<dyn NativeLoop>,
    config: LoopConfig,
    current: RefCell<Option<EventLoop>>,
}

impl EventLoopPolicy {
    pub fn new(native: Rc<dyn NativeLoop>, config: LoopConfig) -> Self {
        Self {
            native,
            config,
            current: RefCell::new(None),
        }
    }

    pub fn native(&self) -> Rc<dyn NativeLoop> {
        Rc::clone(&self.native)
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// The policy's loop, created on first use and again once closed
    pub fn get_event_loop(&self) -> EventLoop {
        let existing = self.current.borrow().clone();
        match existing {
            Some(event_loop) if !event_loop.is_closed() => event_loop,
            _ => {
                let event_loop = self.new_event_loop();
                *self.current.borrow_mut() = Some(event_loop.clone());
                event_loop
            }
        }
    }

    pub fn set_event_loop(&self, event_loop: Option<EventLoop>) {
        let previous = self.current.replace(event_loop);
        drop(previous);
    }

    /// A fresh loop on the policy's native main loop; not made current
    pub fn new_event_loop(&self) -> EventLoop {
        EventLoop::new(Rc::clone(&self.native), self.config.clone())
    }

    /// The policy's loop without creating one
    pub fn current_loop(&self) -> Option<EventLoop> {
        self.current.borrow().clone()
    }
}

impl fmt::Debug for EventLoopPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopPolicy")
            .field("current", &self.current.borrow())
            .finish()
    }
}

/// Keeps a policy installed; dropping it uninstalls the policy
#[must_use = "dropping the guard uninstalls the policy right away"]
pub struct PolicyGuard {
    policy: Option<Rc<EventLoopPolicy>>,
}

impl PolicyGuard {
    /// Leave the policy installed after the guard is gone
    pub fn persist(mut self) {
        self.policy = None;
    }

    /// False when installing was a no-op because the policy was current
    pub fn is_armed(&self) -> bool {
        self.policy.is_some()
    }
}

impl Drop for PolicyGuard {
    fn drop(&mut self) {
        if let Some(policy) = self.policy.take() {
            uninstall(&policy);
        }
    }
}

/// Make `policy` the current one on this thread.
///
/// Installing the policy that is already current changes nothing, and the
/// returned guard is then inert.
pub fn install(policy: Rc<EventLoopPolicy>) -> PolicyGuard {
    let pushed = POLICIES.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.last().is_some_and(|top| Rc::ptr_eq(top, &policy)) {
            false
        } else {
            stack.push(Rc::clone(&policy));
            true
        }
    });
    if pushed {
        tracing::debug!("Installed event loop policy");
    }
    PolicyGuard {
        policy: pushed.then_some(policy),
    }
}

/// Remove the latest installation of `policy`; false if it is not installed
pub fn uninstall(policy: &Rc<EventLoopPolicy>) -> bool {
    let removed = POLICIES
        .try_with(|stack| {
            let mut stack = stack.borrow_mut();
            let position = stack.iter().rposition(|p| Rc::ptr_eq(p, policy));
            position.map(|i| stack.remove(i))
        })
        .ok()
        .flatten();
    match removed {
        Some(policy) => {
            drop(policy);
            tracing::debug!("Uninstalled event loop policy");
            true
        }
        None => false,
    }
}

pub fn current_policy() -> Option<Rc<EventLoopPolicy>> {
    POLICIES.with(|stack| stack.borrow().last().cloned())
}

/// The running loop if there is one, otherwise the current policy's loop
pub fn get_event_loop() -> Result<EventLoop, LoopError> {
    if let Some(running) = get_running_loop() {
        return Ok(running);
    }
    current_policy()
        .map(|policy| policy.get_event_loop())
        .ok_or(LoopError::NoPolicy)
}

/// The loop running on this thread, as a slave or inside a run method
pub fn get_running_loop() -> Option<EventLoop> {
    running_loop_id()
        .and_then(registered_loop)
        .map(EventLoop::from_inner)
}

// Loop registry

pub(crate) fn register_loop(id: u64, inner: Weak<LoopInner>) {
    LOOPS.with(|loops| {
        let mut loops = loops.borrow_mut();
        loops.retain(|_, l| l.strong_count() > 0);
        loops.insert(id, inner);
    });
}

/// Drop every trace of loop `id`; called while the loop is being dropped
pub(crate) fn forget_loop(id: u64) {
    let _ = LOOPS.try_with(|loops| loops.borrow_mut().remove(&id));
    let _ = RUNNING.try_with(|running| {
        if running.get() == Some(id) {
            running.set(None);
        }
    });
    let _ = ACTIVE_SLAVE.try_with(|slave| {
        if slave.get() == Some(id) {
            slave.set(None);
        }
    });
}

pub(crate) fn registered_loop(id: u64) -> Option<Rc<LoopInner>> {
    LOOPS
        .try_with(|loops| loops.borrow().get(&id).and_then(Weak::upgrade))
        .ok()
        .flatten()
}

pub(crate) fn running_loop_id() -> Option<u64> {
    RUNNING.try_with(Cell::get).ok().flatten()
}

pub(crate) fn set_running_loop(id: u64) {
    RUNNING.with(|running| running.set(Some(id)));
}

/// Clear the running marker if it belongs to loop `id`
pub(crate) fn clear_running_loop(id: u64) {
    let _ = RUNNING.try_with(|running| {
        if running.get() == Some(id) {
            running.set(None);
        }
    });
}

pub(crate) fn active_slave() -> Option<u64> {
    ACTIVE_SLAVE.try_with(Cell::get).ok().flatten()
}

pub(crate) fn set_active_slave(id: u64) {
    ACTIVE_SLAVE.with(|slave| slave.set(Some(id)));
}

pub(crate) fn clear_active_slave(id: u64) {
    let _ = ACTIVE_SLAVE.try_with(|slave| {
        if slave.get() == Some(id) {
            slave.set(None);
        }
    });
}
