//! gasyncio demo - the event loop as a slave of a native application
//!
//! Wires the pieces a host application needs:
//! - configuration ([`ConfigManager`]: optional YAML file + `GASYNCIO_*` env)
//! - logging ([`gasyncio::logging::init_logging`])
//! - an [`EventLoopPolicy`] on the reference native main context
//! - a [`LocalApplication`] whose `run` owns the native main loop
//!
//! # Execution Flow
//!
//! 1. Load `gasyncio.yaml` (or the path given as the first argument)
//! 2. Initialize logging
//! 3. Run a short standalone warm-up on the loop
//! 4. Run the application with the loop enslaved; from inside a native
//!    dispatch a nested `run_until_complete` resolves a sleep
//! 5. Log metrics and close the loop

use anyhow::{Context, Result};
use gasyncio::native::{LocalApplication, LocalMainContext, LocalMainLoop};
use gasyncio::{APP_NAME, ConfigManager, EventLoop, EventLoopPolicy, VERSION, policy};
use std::rc::Rc;
use std::time::{Duration, Instant};

const DEFAULT_CONFIG: &str = "gasyncio.yaml";

fn activate(event_loop: EventLoop, main_loop: &LocalMainLoop) {
    let main_loop = main_loop.clone();
    let nested = event_loop.clone();

    let scheduled = event_loop.call_later(Duration::from_millis(10), move || {
        // Runs from a native dispatch; the nested run keeps the loop moving
        let started = Instant::now();
        match nested.run_until_complete(nested.sleep(Duration::from_millis(20))) {
            Ok(_) => tracing::info!("Nested run finished after {:?}", started.elapsed()),
            Err(e) => tracing::error!("Nested run failed: {}", e),
        }
    });
    if let Err(e) = scheduled {
        tracing::error!("Failed to schedule the nested run: {}", e);
        main_loop.quit();
        return;
    }

    let sleeper = event_loop.clone();
    let spawned = event_loop.spawn_named("demo", async move {
        for tick in 1..=3 {
            let _ = sleeper.sleep(Duration::from_millis(25)).await;
            tracing::info!("Tick {} from a task inside the native main loop", tick);
        }
        main_loop.quit();
    });
    if let Err(e) = spawned {
        tracing::error!("Failed to spawn the demo task: {}", e);
    }
}

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = ConfigManager::new(&config_path)
        .load()
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = gasyncio::logging::init_logging(&config.logging)?;
    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let context = Rc::new(LocalMainContext::new());
    let event_loop_policy = Rc::new(EventLoopPolicy::new(context.clone(), config));
    let _policy_guard = policy::install(Rc::clone(&event_loop_policy));
    let event_loop = policy::get_event_loop()?;

    // Standalone warm-up: the loop drives its own iteration
    let warmup = event_loop.sleep(Duration::from_millis(5));
    event_loop
        .run_until_complete(warmup)
        .context("Standalone warm-up failed")?
        .context("Warm-up sleep was cancelled")?;
    tracing::info!("Standalone warm-up done");

    let app_loop = event_loop.clone();
    let app = LocalApplication::new(context, move |main_loop, _argv| activate(app_loop, main_loop));
    let status = event_loop
        .run_application(&app, &[APP_NAME.to_string()])
        .context("Application run failed")?;
    tracing::info!("Application exited with status {}, loop is {}", status, event_loop.state());

    event_loop.metrics().log_summary();
    event_loop.close().context("Failed to close the event loop")?;

    tracing::info!("Shutdown complete");
    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}
