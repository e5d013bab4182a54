//! Tests against mocked native collaborators
//!
//! A mock `NativeLoop` with no expectations panics on any call, which makes it
//! a precise check that a code path never touches the native main loop.

use gasyncio::native::{FdSourceFn, SourceFn};
use gasyncio::{Application, EventLoop, IoCondition, LoopConfig, LoopState, NativeLoop, SourceId};
use mockall::mock;
use mockall::predicate::*;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

mock! {
    pub Native {}

    impl NativeLoop for Native {
        fn timeout_add(&self, interval: Duration, callback: SourceFn) -> SourceId;
        fn idle_add(&self, callback: SourceFn) -> SourceId;
        fn fd_add(&self, fd: RawFd, condition: IoCondition, callback: FdSourceFn) -> SourceId;
        fn source_remove(&self, id: SourceId) -> bool;
        fn iteration(&self, may_block: bool) -> bool;
        fn pending(&self) -> bool;
    }
}

mock! {
    pub App {}

    impl Application for App {
        fn run(&self, argv: &[String]) -> i32;
    }
}

#[test]
fn test_standalone_run_never_calls_native() {
    let native = MockNative::new();
    let event_loop = EventLoop::new(Rc::new(native), LoopConfig::default());

    let value = event_loop.run_without_glib_until_complete(async { 5 }).unwrap();
    assert_eq!(value, 5);

    let sleep = event_loop.sleep(Duration::from_millis(2));
    event_loop.run_until_complete(sleep).unwrap().unwrap();
}

#[test]
fn test_slave_run_without_native_only_registers_wakeup() {
    let mut native = MockNative::new();
    native
        .expect_fd_add()
        .with(always(), eq(IoCondition::IN), always())
        .times(1)
        .returning(|_, _, _| SourceId::new(1));
    native
        .expect_source_remove()
        .with(eq(SourceId::new(1)))
        .times(1)
        .return_const(true);
    native.expect_timeout_add().never();
    native.expect_iteration().never();

    let event_loop = EventLoop::new(Rc::new(native), LoopConfig::default());
    event_loop.start_slave_loop().unwrap();

    let value = event_loop.run_without_glib_until_complete(async { "resolved" }).unwrap();
    assert_eq!(value, "resolved");

    event_loop.stop_slave_loop().unwrap();
}

#[test]
fn test_call_soon_while_slave_adds_one_pump() {
    let mut native = MockNative::new();
    native.expect_fd_add().times(1).returning(|_, _, _| SourceId::new(1));
    native
        .expect_timeout_add()
        .with(eq(Duration::ZERO), always())
        .times(1)
        .returning(|_, _| SourceId::new(2));
    native.expect_source_remove().times(2).return_const(true);

    let event_loop = EventLoop::new(Rc::new(native), LoopConfig::default());
    event_loop.start_slave_loop().unwrap();

    // One pump serves the whole queue
    for _ in 0..3 {
        event_loop.call_soon(|| {}).unwrap();
    }
    assert_eq!(event_loop.bookkeeping().ready, 3);
    assert_eq!(event_loop.mirrored_sources().len(), 2);

    event_loop.stop_slave_loop().unwrap();
    assert_eq!(event_loop.bookkeeping().ready, 3);
}

#[test]
fn test_run_application_returns_exit_status() {
    let context = Rc::new(gasyncio::native::LocalMainContext::new());
    let event_loop = EventLoop::new(context, LoopConfig::default());

    let observed = event_loop.clone();
    let mut app = MockApp::new();
    app.expect_run().times(1).returning_st(move |argv| {
        assert_eq!(argv.len(), 1);
        assert_eq!(observed.state(), LoopState::SlaveActive);
        3
    });

    let status = event_loop.run_application(&app, &["demo".to_string()]).unwrap();
    assert_eq!(status, 3);
    assert_eq!(event_loop.state(), LoopState::SlaveStopped);
}
