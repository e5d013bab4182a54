//! Integration tests for configuration loading and its effect on the loop

use camino::Utf8PathBuf;
use gasyncio::native::LocalMainContext;
use gasyncio::{ConfigManager, EventLoop, LoopConfig, LoopError};
use std::fs;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

fn write_config(contents: &str) -> (ConfigManager, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let path = Utf8PathBuf::try_from(temp_dir.path().join("gasyncio.yaml")).unwrap();
    fs::write(&path, contents).unwrap();
    let manager = ConfigManager::new(&path).with_env_source(config::Map::new());
    (manager, temp_dir)
}

#[test]
fn test_yaml_file_configures_loop() {
    let (manager, _temp_dir) = write_config(
        "debug: true\nslow_callback_ms: 2\nstall_timeout_ms: 15\nready_batch: 8\nlogging:\n  level: debug\n",
    );
    let config = assert_ok!(manager.load());
    assert_eq!(config.ready_batch, 8);

    let event_loop = EventLoop::new(Rc::new(LocalMainContext::new()), config);
    assert!(event_loop.get_debug());
    assert_eq!(event_loop.config().stall_timeout(), Some(Duration::from_millis(15)));

    event_loop
        .call_soon(|| std::thread::sleep(Duration::from_millis(4)))
        .unwrap();
    event_loop.run_until_complete(async {}).unwrap();
    assert_eq!(event_loop.metrics().snapshot().slow_callbacks, 1);
}

#[test]
fn test_stall_timeout_from_file_applies_to_standalone_runs() {
    let (manager, _temp_dir) = write_config("stall_timeout_ms: 10\n");
    let config = assert_ok!(manager.load());
    let event_loop = EventLoop::new(Rc::new(LocalMainContext::new()), config);

    let never = event_loop.create_future::<()>();
    let err = assert_err!(event_loop.run_without_glib_until_complete(never));
    assert!(matches!(err, LoopError::Stalled(_)), "got {:?}", err);
}

#[test]
fn test_invalid_yaml_is_reported() {
    let (manager, _temp_dir) = write_config("ready_batch: [not, a, number]\n");
    let err = assert_err!(manager.load());
    assert!(format!("{:#}", err).contains("Failed to parse loop config"));
}

#[test]
fn test_env_prefix_can_be_changed() {
    let (manager, _temp_dir) = write_config("debug: false\n");
    let mut vars = config::Map::new();
    vars.insert("MYAPP_DEBUG".to_string(), "true".to_string());

    let config = assert_ok!(manager.with_env_prefix("MYAPP").with_env_source(vars).load());
    assert!(config.debug);
    assert_eq!(LoopConfig::default().ready_batch, 256);
}

#[test]
fn test_zero_ready_batch_is_rejected_on_load() {
    let (manager, _temp_dir) = write_config("ready_batch: 0\n");
    let err = assert_err!(manager.load());
    let message = format!("{:#}", err);
    assert!(message.contains("Invalid loop config"), "got {}", message);
    assert!(message.contains("ready_batch must be at least 1"), "got {}", message);
}
