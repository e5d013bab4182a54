//! Integration tests for run_until_complete and run_without_glib_until_complete
//!
//! These tests verify that:
//! - A nested run from inside a native dispatch resolves and leaves the
//!   mirror table as it was
//! - Runs without the native loop never touch it and report missing progress
//! - Panicking tasks and stopped runs surface as errors
//! - A timer run without the native loop is not run again by its old mirror

use gasyncio::native::{FdSourceFn, LocalMainContext, SourceFn};
use gasyncio::{
    ControlFlow, EventLoop, IoCondition, LoopConfig, LoopError, LoopState, MirrorKey, NativeLoop, SourceId,
    StateChange, TaskError,
};
use std::cell::{Cell, RefCell};
use std::future::poll_fn;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::task::Poll;
use std::time::Duration;

fn new_loop(config: LoopConfig) -> (Rc<LocalMainContext>, EventLoop) {
    let context = Rc::new(LocalMainContext::new());
    let event_loop = EventLoop::new(context.clone(), config);
    (context, event_loop)
}

/// Native loop that never dispatches on its own and keeps the callbacks of
/// removed timeouts, so an outdated mirror can still be fired by hand
#[derive(Default)]
struct RetainingNative {
    next_id: Cell<u64>,
    timeouts: RefCell<Vec<(SourceId, SourceFn)>>,
    removed: RefCell<Vec<SourceId>>,
}

impl RetainingNative {
    fn allocate(&self) -> SourceId {
        self.next_id.set(self.next_id.get() + 1);
        SourceId::new(self.next_id.get())
    }

    fn fire(&self, id: SourceId) -> Option<ControlFlow> {
        let index = self.timeouts.borrow().iter().position(|(s, _)| *s == id)?;
        let (_, mut callback) = self.timeouts.borrow_mut().remove(index);
        Some(callback())
    }
}

impl NativeLoop for RetainingNative {
    fn timeout_add(&self, _interval: Duration, callback: SourceFn) -> SourceId {
        let id = self.allocate();
        self.timeouts.borrow_mut().push((id, callback));
        id
    }

    fn idle_add(&self, _callback: SourceFn) -> SourceId {
        self.allocate()
    }

    fn fd_add(&self, _fd: RawFd, _condition: IoCondition, _callback: FdSourceFn) -> SourceId {
        self.allocate()
    }

    fn source_remove(&self, id: SourceId) -> bool {
        self.removed.borrow_mut().push(id);
        true
    }

    fn iteration(&self, _may_block: bool) -> bool {
        false
    }

    fn pending(&self) -> bool {
        false
    }
}

fn sorted<T: Ord>(mut items: Vec<T>) -> Vec<T> {
    items.sort();
    items
}

#[test]
fn test_nested_run_inside_native_dispatch() {
    let (context, event_loop) = new_loop(LoopConfig::default());
    event_loop.start_slave_loop().unwrap();

    let result = Rc::new(RefCell::new(None));
    let tables = Rc::new(RefCell::new(None));

    let nested = event_loop.clone();
    let r = result.clone();
    let t = tables.clone();
    event_loop
        .call_soon(move || {
            assert!(nested.is_slave());
            let before = sorted(nested.mirrored_sources());
            let sleeper = nested.clone();
            let value = nested.run_until_complete(async move {
                let _ = sleeper.sleep(Duration::from_millis(10)).await;
                42
            });
            let after = sorted(nested.mirrored_sources());
            *r.borrow_mut() = Some(value);
            *t.borrow_mut() = Some((before, after));
        })
        .unwrap();

    for _ in 0..50 {
        if result.borrow().is_some() {
            break;
        }
        context.iteration(true);
    }

    let value = result.borrow_mut().take().expect("nested run never ran");
    assert_eq!(value.unwrap(), 42);
    let (before, after) = tables.borrow_mut().take().unwrap();
    assert_eq!(before, after);
    assert_eq!(event_loop.state(), LoopState::SlaveActive);
    assert!(event_loop.bookkeeping().timers.is_empty());

    event_loop.stop_slave_loop().unwrap();
}

#[test]
fn test_nested_run_events_report_depth() {
    let (_context, event_loop) = new_loop(LoopConfig::default());
    let mut rx = event_loop.subscribe();

    event_loop.run_until_complete(async {}).unwrap();

    assert_eq!(rx.try_recv().unwrap(), StateChange::NestedRunEntered { depth: 1 });
    assert_eq!(rx.try_recv().unwrap(), StateChange::NestedRunExited { depth: 1 });
}

#[test]
fn test_standalone_run_cannot_nest() {
    let (_context, event_loop) = new_loop(LoopConfig::default());
    let inner_result = Rc::new(RefCell::new(None));

    let nested = event_loop.clone();
    let r = inner_result.clone();
    event_loop
        .call_soon(move || {
            *r.borrow_mut() = Some(nested.run_until_complete(async {}));
        })
        .unwrap();
    event_loop.run_until_complete(async {}).unwrap();

    let inner = inner_result.borrow_mut().take().unwrap();
    assert!(matches!(inner, Err(LoopError::AlreadyRunning)));
}

#[test]
fn test_without_native_resolved_future_skips_native_loop() {
    let (context, event_loop) = new_loop(LoopConfig::default());
    event_loop.start_slave_loop().unwrap();
    let iterations = context.iteration_count();
    let mirrors = sorted(event_loop.mirrored_sources());

    let value = event_loop.run_without_glib_until_complete(async { "done" }).unwrap();

    assert_eq!(value, "done");
    assert_eq!(context.iteration_count(), iterations);
    assert_eq!(sorted(event_loop.mirrored_sources()), mirrors);
    event_loop.stop_slave_loop().unwrap();
}

#[test]
fn test_without_native_reports_no_progress() {
    let (context, event_loop) = new_loop(LoopConfig::default());
    event_loop.start_slave_loop().unwrap();
    let never = event_loop.create_future::<()>();

    let err = event_loop.run_without_glib_until_complete(never).unwrap_err();

    assert!(matches!(err, LoopError::NoProgress { .. }), "got {:?}", err);
    assert_eq!(context.iteration_count(), 0);
    assert_eq!(event_loop.state(), LoopState::SlaveActive);
    event_loop.stop_slave_loop().unwrap();
}

#[test]
fn test_without_native_waits_for_timers_within_stall_timeout() {
    let config = LoopConfig {
        stall_timeout_ms: Some(500),
        ..LoopConfig::default()
    };
    let (context, event_loop) = new_loop(config);
    event_loop.start_slave_loop().unwrap();

    let sleep = event_loop.sleep(Duration::from_millis(10));
    event_loop.run_without_glib_until_complete(sleep).unwrap().unwrap();

    assert_eq!(context.iteration_count(), 0);
    // The timer mirror registered while slave is reconciled away
    assert!(
        !event_loop
            .mirrored_sources()
            .iter()
            .any(|k| matches!(k, gasyncio::MirrorKey::Timer(_)))
    );
    event_loop.stop_slave_loop().unwrap();
}

#[test]
fn test_without_native_busy_future_stalls() {
    let config = LoopConfig {
        stall_timeout_ms: Some(20),
        ..LoopConfig::default()
    };
    let (_context, event_loop) = new_loop(config);
    event_loop.start_slave_loop().unwrap();

    let busy = poll_fn(|cx| {
        cx.waker().wake_by_ref();
        Poll::<()>::Pending
    });
    let err = event_loop.run_without_glib_until_complete(busy).unwrap_err();

    assert!(matches!(err, LoopError::Stalled(d) if d == Duration::from_millis(20)));
    assert!(event_loop.bookkeeping().tasks.is_empty());
    event_loop.stop_slave_loop().unwrap();
}

#[test]
fn test_timer_run_without_native_does_not_fire_again() {
    let native = Rc::new(RetainingNative::default());
    let config = LoopConfig {
        stall_timeout_ms: Some(500),
        ..LoopConfig::default()
    };
    let event_loop = EventLoop::new(native.clone(), config);
    event_loop.start_slave_loop().unwrap();

    let fired = Rc::new(Cell::new(0));
    let f = fired.clone();
    let timer = event_loop
        .call_later(Duration::from_millis(5), move || f.set(f.get() + 1))
        .unwrap();
    let source = event_loop.native_source(MirrorKey::Timer(timer.id())).unwrap();

    let sleep = event_loop.sleep(Duration::from_millis(20));
    event_loop.run_without_glib_until_complete(sleep).unwrap().unwrap();
    assert_eq!(fired.get(), 1);

    // The run took the timer; reconciling removed its mirror
    assert_eq!(event_loop.native_source(MirrorKey::Timer(timer.id())), None);
    assert!(native.removed.borrow().contains(&source));

    let stale_before = event_loop.metrics().snapshot().stale_mirror_fires;
    assert_eq!(native.fire(source), Some(ControlFlow::Break));
    assert_eq!(fired.get(), 1);
    assert_eq!(event_loop.metrics().snapshot().stale_mirror_fires, stale_before + 1);

    event_loop.stop_slave_loop().unwrap();
}

async fn explode() -> u32 {
    panic!("task blew up")
}

#[test]
fn test_panicking_task_is_reported() {
    let (_context, event_loop) = new_loop(LoopConfig::default());

    let err = event_loop.run_until_complete(explode()).unwrap_err();

    match err {
        LoopError::Task(TaskError::Panicked(message)) => assert_eq!(message, "task blew up"),
        other => panic!("unexpected error: {:?}", other),
    }
    // The loop is usable afterwards
    assert_eq!(event_loop.run_until_complete(async { 1 + 1 }).unwrap(), 2);
}

#[test]
fn test_stop_interrupts_run_until_complete() {
    let (_context, event_loop) = new_loop(LoopConfig::default());
    let stopper = event_loop.clone();
    event_loop.call_soon(move || stopper.stop()).unwrap();

    let never = event_loop.create_future::<()>();
    let err = event_loop.run_until_complete(never).unwrap_err();
    assert!(matches!(err, LoopError::InvalidState(_)));
}

#[test]
fn test_run_forever_until_stop() {
    let (_context, event_loop) = new_loop(LoopConfig::default());
    let ticks = Rc::new(Cell::new(0));

    let t = ticks.clone();
    let stopper = event_loop.clone();
    event_loop
        .call_later(Duration::from_millis(5), move || {
            t.set(t.get() + 1);
            stopper.stop();
        })
        .unwrap();
    event_loop.run_forever().unwrap();

    assert_eq!(ticks.get(), 1);
    assert!(!event_loop.is_running());
}

#[test]
fn test_run_forever_as_slave_returns_on_stop() {
    let (_context, event_loop) = new_loop(LoopConfig::default());
    event_loop.start_slave_loop().unwrap();

    let stopper = event_loop.clone();
    event_loop.call_soon(move || stopper.stop()).unwrap();
    event_loop.run_forever().unwrap();

    assert!(event_loop.is_slave());
    event_loop.stop_slave_loop().unwrap();
}
