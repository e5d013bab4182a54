// LocalMainContext - a single-threaded GLib-style main context
//
// Implements the NativeLoop contract with the same dispatch rules the event
// loop relies on from GLib:
// - timeouts and fd watches have default priority, idle sources are dispatched
//   only when no default-priority source is ready
// - a callback is detached from its source while it runs, so a nested
//   iteration never re-enters the same source
// - sources may be removed from inside any callback, including their own

use super::{Application, ControlFlow, FdSourceFn, IoCondition, NativeLoop, SourceFn, SourceId};
use crate::sys;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

enum SourceKind {
    Timeout { interval: Duration, deadline: Instant },
    Idle,
    Fd { fd: RawFd, condition: IoCondition },
}

enum Callback {
    Plain(SourceFn),
    Fd(FdSourceFn),
}

struct SourceEntry {
    kind: SourceKind,
    /// None while the callback is being dispatched
    callback: Option<Callback>,
}

#[derive(Default)]
struct ContextState {
    next_id: u64,
    sources: BTreeMap<SourceId, SourceEntry>,
}

/// Single-threaded native main context
///
/// # Example
/// ```
/// use gasyncio::native::{ControlFlow, LocalMainContext, NativeLoop};
/// use std::time::Duration;
///
/// let context = LocalMainContext::new();
/// context.timeout_add(Duration::ZERO, Box::new(|| ControlFlow::Break));
/// assert!(context.iteration(false));
/// assert_eq!(context.source_count(), 0);
/// ```
#[derive(Default)]
pub struct LocalMainContext {
    state: RefCell<ContextState>,
    iterations: Cell<u64>,
    dispatch_depth: Cell<u32>,
}

impl LocalMainContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `iteration()` calls so far, nested ones included
    pub fn iteration_count(&self) -> u64 {
        self.iterations.get()
    }

    /// Number of registered sources, including ones currently dispatching
    pub fn source_count(&self) -> usize {
        self.state.borrow().sources.len()
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.state.borrow().sources.contains_key(&id)
    }

    /// True while a source callback of this context is running
    pub fn is_dispatching(&self) -> bool {
        self.dispatch_depth.get() > 0
    }

    fn insert(&self, kind: SourceKind, callback: Callback) -> SourceId {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = SourceId::new(state.next_id);
        state.sources.insert(
            id,
            SourceEntry {
                kind,
                callback: Some(callback),
            },
        );
        id
    }

    /// Sources that are ready right now, as (id, fd condition) pairs, plus the
    /// timeout the caller may wait for before something else becomes due
    fn collect(&self, now: Instant, may_block: bool) -> Collected {
        let state = self.state.borrow();
        let mut collected = Collected::default();

        let mut next_deadline: Option<Instant> = None;
        for (id, entry) in state.sources.iter() {
            if entry.callback.is_none() {
                continue;
            }
            match &entry.kind {
                SourceKind::Timeout { deadline, .. } => {
                    if *deadline <= now {
                        collected.due.push(*id);
                    } else {
                        next_deadline = Some(next_deadline.map_or(*deadline, |d| d.min(*deadline)));
                    }
                }
                SourceKind::Idle => collected.idle.push(*id),
                SourceKind::Fd { fd, condition } => collected.watches.push((*id, *fd, *condition)),
            }
        }

        collected.timeout = if !may_block || !collected.due.is_empty() || !collected.idle.is_empty() {
            Some(Duration::ZERO)
        } else {
            next_deadline.map(|d| d.saturating_duration_since(now))
        };
        collected
    }

    fn dispatch(&self, id: SourceId, condition: IoCondition) -> bool {
        let (callback, fd) = {
            let mut state = self.state.borrow_mut();
            let Some(entry) = state.sources.get_mut(&id) else {
                return false;
            };
            let fd = match entry.kind {
                SourceKind::Fd { fd, .. } => fd,
                _ => -1,
            };
            match entry.callback.take() {
                Some(cb) => (cb, fd),
                None => return false,
            }
        };

        self.dispatch_depth.set(self.dispatch_depth.get() + 1);
        let mut callback = callback;
        let flow = match &mut callback {
            Callback::Plain(f) => f(),
            Callback::Fd(f) => f(fd, condition),
        };
        self.dispatch_depth.set(self.dispatch_depth.get() - 1);

        let leftover = {
            let mut state = self.state.borrow_mut();
            if flow == ControlFlow::Break {
                state.sources.remove(&id);
                Some(callback)
            } else if let Some(entry) = state.sources.get_mut(&id) {
                if let SourceKind::Timeout { interval, deadline } = &mut entry.kind {
                    *deadline = Instant::now() + *interval;
                }
                entry.callback = Some(callback);
                None
            } else {
                // Removed while dispatching
                Some(callback)
            }
        };
        drop(leftover);
        true
    }
}

#[derive(Default)]
struct Collected {
    due: Vec<SourceId>,
    idle: Vec<SourceId>,
    watches: Vec<(SourceId, RawFd, IoCondition)>,
    timeout: Option<Duration>,
}

impl NativeLoop for LocalMainContext {
    fn timeout_add(&self, interval: Duration, callback: SourceFn) -> SourceId {
        let kind = SourceKind::Timeout {
            interval,
            deadline: Instant::now() + interval,
        };
        self.insert(kind, Callback::Plain(callback))
    }

    fn idle_add(&self, callback: SourceFn) -> SourceId {
        self.insert(SourceKind::Idle, Callback::Plain(callback))
    }

    fn fd_add(&self, fd: RawFd, condition: IoCondition, callback: FdSourceFn) -> SourceId {
        self.insert(SourceKind::Fd { fd, condition }, Callback::Fd(callback))
    }

    fn source_remove(&self, id: SourceId) -> bool {
        let removed = self.state.borrow_mut().sources.remove(&id);
        // Drop the callback outside the borrow
        removed.is_some()
    }

    fn iteration(&self, may_block: bool) -> bool {
        self.iterations.set(self.iterations.get() + 1);

        let collected = self.collect(Instant::now(), may_block);
        if collected.timeout.is_none() && collected.watches.is_empty() {
            // GLib would block forever here; nothing could ever wake us up
            tracing::trace!("LocalMainContext: nothing to wait for");
            return false;
        }

        let fd_watches: Vec<(RawFd, IoCondition)> =
            collected.watches.iter().map(|(_, fd, c)| (*fd, *c)).collect();
        let reported = match sys::wait_fds(&fd_watches, collected.timeout) {
            Ok(reported) => reported,
            Err(e) => {
                tracing::warn!("LocalMainContext: poll failed: {}", e);
                vec![IoCondition::empty(); fd_watches.len()]
            }
        };

        let mut ready: Vec<(SourceId, IoCondition)> = Vec::new();
        for ((id, _, requested), got) in collected.watches.iter().zip(reported) {
            let relevant = got & (*requested | IoCondition::ERR | IoCondition::HUP | IoCondition::NVAL);
            if !relevant.is_empty() {
                ready.push((*id, relevant));
            }
        }

        // Timeouts that became due while waiting
        let now = Instant::now();
        {
            let state = self.state.borrow();
            for (id, entry) in state.sources.iter() {
                if let (SourceKind::Timeout { deadline, .. }, Some(_)) = (&entry.kind, &entry.callback) {
                    if *deadline <= now {
                        ready.push((*id, IoCondition::empty()));
                    }
                }
            }
        }

        if ready.is_empty() {
            ready = collected
                .idle
                .iter()
                .map(|id| (*id, IoCondition::empty()))
                .collect();
        }
        ready.sort_by_key(|(id, _)| *id);
        ready.dedup_by_key(|(id, _)| *id);

        let mut dispatched = false;
        for (id, condition) in ready {
            dispatched |= self.dispatch(id, condition);
        }
        dispatched
    }

    fn pending(&self) -> bool {
        let collected = self.collect(Instant::now(), false);
        if !collected.due.is_empty() || !collected.idle.is_empty() {
            return true;
        }
        if collected.watches.is_empty() {
            return false;
        }
        let fd_watches: Vec<(RawFd, IoCondition)> =
            collected.watches.iter().map(|(_, fd, c)| (*fd, *c)).collect();
        sys::wait_fds(&fd_watches, Some(Duration::ZERO))
            .map(|reported| reported.iter().any(|c| !c.is_empty()))
            .unwrap_or(false)
    }
}

/// Runs a [`LocalMainContext`] until [`quit`](Self::quit) is called
#[derive(Clone)]
pub struct LocalMainLoop {
    context: Rc<LocalMainContext>,
    running: Rc<Cell<bool>>,
}

impl LocalMainLoop {
    pub fn new(context: Rc<LocalMainContext>) -> Self {
        Self {
            context,
            running: Rc::new(Cell::new(false)),
        }
    }

    pub fn context(&self) -> &Rc<LocalMainContext> {
        &self.context
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Iterate the context until `quit()`, or until it has no sources left
    pub fn run(&self) {
        self.running.set(true);
        while self.running.get() {
            if !self.context.iteration(true) && self.context.source_count() == 0 {
                tracing::warn!("LocalMainLoop: no sources left, leaving run()");
                break;
            }
        }
        self.running.set(false);
    }

    pub fn quit(&self) {
        self.running.set(false);
    }
}

type Activate = Box<dyn FnOnce(&LocalMainLoop, &[String])>;

/// Minimal native application: activates once, then owns the main loop
pub struct LocalApplication {
    main_loop: LocalMainLoop,
    activate: RefCell<Option<Activate>>,
    exit_status: Rc<Cell<i32>>,
}

impl LocalApplication {
    pub fn new<F>(context: Rc<LocalMainContext>, activate: F) -> Self
    where
        F: FnOnce(&LocalMainLoop, &[String]) + 'static,
    {
        Self {
            main_loop: LocalMainLoop::new(context),
            activate: RefCell::new(Some(Box::new(activate))),
            exit_status: Rc::new(Cell::new(0)),
        }
    }

    pub fn main_loop(&self) -> &LocalMainLoop {
        &self.main_loop
    }

    /// Shared cell holding the status `run()` returns
    pub fn exit_status(&self) -> Rc<Cell<i32>> {
        Rc::clone(&self.exit_status)
    }
}

impl Application for LocalApplication {
    fn run(&self, argv: &[String]) -> i32 {
        let activate = self.activate.borrow_mut().take();
        if let Some(activate) = activate {
            activate(&self.main_loop, argv);
        }
        self.main_loop.run();
        self.exit_status.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_fires_once_on_break() {
        let context = LocalMainContext::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        context.timeout_add(
            Duration::from_millis(5),
            Box::new(move || {
                h.set(h.get() + 1);
                ControlFlow::Break
            }),
        );

        assert!(context.iteration(true));
        assert_eq!(hits.get(), 1);
        assert_eq!(context.source_count(), 0);
        assert!(!context.iteration(true));
    }

    #[test]
    fn test_repeating_timeout_continues() {
        let context = LocalMainContext::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let id = context.timeout_add(
            Duration::ZERO,
            Box::new(move || {
                h.set(h.get() + 1);
                ControlFlow::Continue
            }),
        );

        context.iteration(false);
        context.iteration(false);
        assert_eq!(hits.get(), 2);
        assert!(context.source_remove(id));
        assert!(!context.source_remove(id));
    }

    #[test]
    fn test_idle_waits_for_default_priority() {
        let context = LocalMainContext::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        context.idle_add(Box::new(move || {
            o.borrow_mut().push("idle");
            ControlFlow::Break
        }));
        let o = order.clone();
        context.timeout_add(
            Duration::ZERO,
            Box::new(move || {
                o.borrow_mut().push("timeout");
                ControlFlow::Break
            }),
        );

        context.iteration(false);
        assert_eq!(*order.borrow(), vec!["timeout"]);
        context.iteration(false);
        assert_eq!(*order.borrow(), vec!["timeout", "idle"]);
    }

    #[test]
    fn test_source_can_remove_itself() {
        let context = Rc::new(LocalMainContext::new());
        let own_id = Rc::new(Cell::new(None));

        let ctx = context.clone();
        let id_cell = own_id.clone();
        let id = context.timeout_add(
            Duration::ZERO,
            Box::new(move || {
                if let Some(id) = id_cell.get() {
                    assert!(ctx.source_remove(id));
                }
                ControlFlow::Continue
            }),
        );
        own_id.set(Some(id));

        assert!(context.iteration(false));
        assert!(!context.contains(id));
    }

    #[test]
    fn test_nested_iteration_skips_dispatching_source() {
        let context = Rc::new(LocalMainContext::new());
        let outer_runs = Rc::new(Cell::new(0));
        let inner_runs = Rc::new(Cell::new(0));

        let ctx = context.clone();
        let o = outer_runs.clone();
        context.timeout_add(
            Duration::ZERO,
            Box::new(move || {
                o.set(o.get() + 1);
                assert!(ctx.is_dispatching());
                ctx.iteration(false);
                ControlFlow::Break
            }),
        );
        let i = inner_runs.clone();
        context.idle_add(Box::new(move || {
            i.set(i.get() + 1);
            ControlFlow::Break
        }));

        context.iteration(false);
        assert_eq!(outer_runs.get(), 1);
        assert_eq!(inner_runs.get(), 1);
        assert_eq!(context.iteration_count(), 2);
    }

    #[test]
    fn test_main_loop_quits_from_callback() {
        let context = Rc::new(LocalMainContext::new());
        let app = LocalApplication::new(context.clone(), |main_loop, argv| {
            assert_eq!(argv, ["demo".to_string()]);
            let ml = main_loop.clone();
            main_loop.context().timeout_add(
                Duration::from_millis(1),
                Box::new(move || {
                    ml.quit();
                    ControlFlow::Break
                }),
            );
        });
        app.exit_status().set(3);

        assert_eq!(app.run(&["demo".to_string()]), 3);
        assert!(!app.main_loop().is_running());
    }

    #[test]
    fn test_pending_reports_due_sources() {
        let context = LocalMainContext::new();
        assert!(!context.pending());
        context.idle_add(Box::new(|| ControlFlow::Break));
        assert!(context.pending());
    }
}
