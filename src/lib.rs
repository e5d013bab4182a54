// gasyncio - cooperative task scheduler that runs as a slave of a native main loop
//
// This is the library crate. The demo binary (main.rs) wires configuration,
// logging and the reference native loop together.

pub mod bridge;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod metrics;
pub mod native;
pub mod policy;
pub mod scheduler;
pub mod state;
mod sys;

// Re-export commonly used types for convenience
pub use bridge::MirrorKey;
pub use config::{ConfigManager, LoggingConfig, LoopConfig};
pub use error::{LoopError, TaskError};
pub use event_loop::{EventLoop, ExceptionContext};
pub use metrics::{LoopMetrics, MetricsSnapshot};
pub use native::{Application, ControlFlow, IoCondition, NativeLoop, SourceId};
pub use policy::{EventLoopPolicy, PolicyGuard};
pub use scheduler::{Bookkeeping, FutureStatus, Handle, LoopFuture, Task, TaskId, TaskState, TimerHandle, TimerId};
pub use state::{LoopState, LoopStatus, StateChange, StateManager};

use std::rc::Rc;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Install `policy` on this thread and make its loop the slave of the native
/// main loop.
///
/// The policy stays installed until [`stop_slave_loop`] is called. If the
/// loop cannot enter slave mode, a policy installed by this call is
/// uninstalled again.
pub fn start_slave_loop(policy: Rc<EventLoopPolicy>) -> Result<EventLoop, LoopError> {
    let guard = policy::install(Rc::clone(&policy));
    let event_loop = policy.get_event_loop();
    event_loop.start_slave_loop()?;
    guard.persist();
    Ok(event_loop)
}

/// Leave slave mode, close the loop and uninstall the current policy
pub fn stop_slave_loop() -> Result<(), LoopError> {
    let policy = policy::current_policy().ok_or(LoopError::NoPolicy)?;
    let event_loop = policy.current_loop().ok_or(LoopError::NotSlave)?;
    event_loop.stop_slave_loop()?;
    event_loop.close()?;
    policy::uninstall(&policy);
    Ok(())
}
