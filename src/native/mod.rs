//! Native main loop interface.
//!
//! The event loop is a *client* of a GLib-style main loop: it adds timeouts,
//! idle callbacks and file-descriptor watches, removes them again, and asks the
//! native context to run single iterations. [`NativeLoop`] is that client
//! interface; [`Application`] is the blocking entry point of a native
//! application object (the `g_application_run` role).
//!
//! [`local`] provides a small single-threaded implementation of the same
//! contract, used by the demo binary and the tests.

pub mod local;

use bitflags::bitflags;
use std::os::fd::RawFd;
use std::time::Duration;

pub use local::{LocalApplication, LocalMainContext, LocalMainLoop};

bitflags! {
    /// Readiness conditions of a file-descriptor watch (GLib `GIOCondition` values)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoCondition: u32 {
        const IN = 1;
        const PRI = 2;
        const OUT = 4;
        const ERR = 8;
        const HUP = 16;
        const NVAL = 32;
    }
}

impl IoCondition {
    /// Conditions that report a reader as ready
    pub const READABLE: IoCondition = IoCondition::IN
        .union(IoCondition::PRI)
        .union(IoCondition::HUP)
        .union(IoCondition::ERR)
        .union(IoCondition::NVAL);

    /// Conditions that report a writer as ready
    pub const WRITABLE: IoCondition = IoCondition::OUT
        .union(IoCondition::HUP)
        .union(IoCondition::ERR)
        .union(IoCondition::NVAL);
}

/// Whether a native source stays registered after its callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Break,
}

/// Identifier of a source registered with a native main context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Callback of a timeout or idle source
pub type SourceFn = Box<dyn FnMut() -> ControlFlow>;

/// Callback of a file-descriptor watch
pub type FdSourceFn = Box<dyn FnMut(RawFd, IoCondition) -> ControlFlow>;

/// Watch-registration interface of a native main loop
///
/// Implementations are single-threaded and use interior mutability, like a
/// `GMainContext`. Callbacks are never invoked from inside `*_add` or
/// `source_remove`; they only run from [`iteration`](Self::iteration).
/// Removing a source while its callback is being dispatched must be allowed.
pub trait NativeLoop {
    /// Add a default-priority timeout firing after `interval`, repeating while
    /// the callback returns [`ControlFlow::Continue`]
    fn timeout_add(&self, interval: Duration, callback: SourceFn) -> SourceId;

    /// Add an idle source, dispatched when nothing of higher priority is ready
    fn idle_add(&self, callback: SourceFn) -> SourceId;

    /// Watch `fd` for `condition`
    fn fd_add(&self, fd: RawFd, condition: IoCondition, callback: FdSourceFn) -> SourceId;

    /// Remove a source; returns false if it was not registered
    fn source_remove(&self, id: SourceId) -> bool;

    /// Run a single iteration; returns true if any source was dispatched.
    ///
    /// With `may_block` the call waits until a source is ready. It may return
    /// false without dispatching only when the context holds no source that
    /// could ever become ready; the event loop treats that as "no progress".
    fn iteration(&self, may_block: bool) -> bool;

    /// True if a source is ready to be dispatched
    fn pending(&self) -> bool;
}

/// A native application object whose `run` blockingly owns the main loop
pub trait Application {
    fn run(&self, argv: &[String]) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readable_and_writable_sets() {
        assert!(IoCondition::READABLE.contains(IoCondition::IN));
        assert!(IoCondition::READABLE.contains(IoCondition::HUP));
        assert!(!IoCondition::READABLE.contains(IoCondition::OUT));
        assert!(IoCondition::WRITABLE.contains(IoCondition::OUT));
        assert!(IoCondition::WRITABLE.contains(IoCondition::ERR));
        assert!(!IoCondition::WRITABLE.contains(IoCondition::IN));
    }

    #[test]
    fn test_source_id_ordering() {
        assert!(SourceId::new(1) < SourceId::new(2));
        assert_eq!(SourceId::new(7).as_raw(), 7);
    }
}
