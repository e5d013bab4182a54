// State management module
//
// This module provides the LoopState machine of the slave lifecycle and the
// StateManager that records the current status of one event loop and emits
// change events for observers (demo UI, tests, diagnostics).

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Lifecycle of an event loop with respect to the native main loop
///
/// ```text
/// Standalone --start--> SlaveActive --stop--> SlaveStopped --start--> SlaveActive
///      \                                          /
///       `---------------- close --> Closed <-----'
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoopState {
    /// Initial mode: the loop drives its own iteration
    #[default]
    Standalone,

    /// The native main loop owns iteration; scheduler sources are mirrored
    SlaveActive,

    /// Slave mode ended; behaves exactly like Standalone
    SlaveStopped,

    /// Terminal
    Closed,
}

impl LoopState {
    pub fn is_slave(self) -> bool {
        self == LoopState::SlaveActive
    }

    pub fn is_closed(self) -> bool {
        self == LoopState::Closed
    }

    /// Whether the loop iterates on its own in this state
    pub fn is_standalone(self) -> bool {
        matches!(self, LoopState::Standalone | LoopState::SlaveStopped)
    }

    /// Validate a transition of the lifecycle state machine
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, next),
            (Standalone, SlaveActive)
                | (SlaveStopped, SlaveActive)
                | (SlaveActive, SlaveStopped)
                | (Standalone, Closed)
                | (SlaveStopped, Closed)
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Standalone => "standalone",
            LoopState::SlaveActive => "slave-active",
            LoopState::SlaveStopped => "slave-stopped",
            LoopState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Recorded status of one event loop
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoopStatus {
    pub state: LoopState,

    /// Depth of run_until_complete-style runs currently on the stack
    pub run_depth: u32,

    /// Native mirrors touched by the last slave transition
    pub transition_mirrors: usize,
}

/// Change events emitted when the loop status is modified
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// Slave mode started with this many sources mirrored
    SlaveStarted { mirrors: usize },

    /// Slave mode ended after removing this many native sources
    SlaveStopped { detached: usize },

    /// The loop was closed
    Closed,

    /// A run entered; depth 1 is the outermost one
    NestedRunEntered { depth: u32 },

    NestedRunExited { depth: u32 },
}

/// Status holder with event emission
///
/// The loop itself is single-threaded, but the status lives behind
/// `Arc<RwLock<T>>` so clones of the manager can be read from anywhere and a
/// [`subscribe()`](Self::subscribe) receiver can be moved to another thread.
/// Only the owning loop changes the status; clones are read-only.
pub struct StateManager {
    status: Arc<RwLock<LoopStatus>>,
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with a broadcast buffer of 100 events
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            status: Arc::new(RwLock::new(LoopStatus::default())),
            state_tx,
        }
    }

    pub fn snapshot(&self) -> LoopStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn state(&self) -> LoopState {
        self.read(|status| status.state)
    }

    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&LoopStatus) -> R,
    {
        let status = self.status.read().unwrap_or_else(PoisonError::into_inner);
        f(&status)
    }

    /// Update the status and emit change events
    ///
    /// Returns the events that were emitted.
    pub(crate) fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut LoopStatus),
    {
        let changes = {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            let old = status.clone();
            update_fn(&mut status);
            detect_changes(&old, &status)
        };

        for change in &changes {
            // No receivers is fine
            let _ = self.state_tx.send(change.clone());
        }
        changes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    pub(crate) fn enter_slave(&self, mirrors: usize) -> Vec<StateChange> {
        self.update(|status| {
            status.state = LoopState::SlaveActive;
            status.transition_mirrors = mirrors;
        })
    }

    pub(crate) fn leave_slave(&self, detached: usize) -> Vec<StateChange> {
        self.update(|status| {
            status.state = LoopState::SlaveStopped;
            status.transition_mirrors = detached;
        })
    }

    pub(crate) fn mark_closed(&self) -> Vec<StateChange> {
        self.update(|status| status.state = LoopState::Closed)
    }

    pub(crate) fn enter_run(&self) -> u32 {
        let mut depth = 0;
        self.update(|status| {
            status.run_depth += 1;
            depth = status.run_depth;
        });
        depth
    }

    pub(crate) fn exit_run(&self) -> u32 {
        let mut depth = 0;
        self.update(|status| {
            status.run_depth = status.run_depth.saturating_sub(1);
            depth = status.run_depth;
        });
        depth
    }
}

fn detect_changes(old: &LoopStatus, new: &LoopStatus) -> Vec<StateChange> {
    let mut changes = Vec::new();

    if old.state != new.state {
        match new.state {
            LoopState::SlaveActive => changes.push(StateChange::SlaveStarted {
                mirrors: new.transition_mirrors,
            }),
            LoopState::SlaveStopped => changes.push(StateChange::SlaveStopped {
                detached: new.transition_mirrors,
            }),
            LoopState::Closed => changes.push(StateChange::Closed),
            LoopState::Standalone => {}
        }
    }

    if new.run_depth > old.run_depth {
        changes.push(StateChange::NestedRunEntered { depth: new.run_depth });
    } else if new.run_depth < old.run_depth {
        changes.push(StateChange::NestedRunExited { depth: old.run_depth });
    }

    changes
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            status: Arc::clone(&self.status),
            state_tx: self.state_tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_manager() {
        let manager = StateManager::new();
        let status = manager.snapshot();
        assert_eq!(status.state, LoopState::Standalone);
        assert_eq!(status.run_depth, 0);
    }

    #[test]
    fn test_valid_transitions() {
        use LoopState::*;
        assert!(Standalone.can_transition_to(SlaveActive));
        assert!(SlaveActive.can_transition_to(SlaveStopped));
        assert!(SlaveStopped.can_transition_to(SlaveActive));
        assert!(SlaveStopped.can_transition_to(Closed));

        assert!(!SlaveActive.can_transition_to(SlaveActive));
        assert!(!SlaveActive.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(SlaveActive));
        assert!(!Standalone.can_transition_to(SlaveStopped));
    }

    #[test]
    fn test_slave_events() {
        let manager = StateManager::new();

        let changes = manager.enter_slave(3);
        assert_eq!(changes, vec![StateChange::SlaveStarted { mirrors: 3 }]);
        assert!(manager.state().is_slave());

        let changes = manager.leave_slave(2);
        assert_eq!(changes, vec![StateChange::SlaveStopped { detached: 2 }]);
        assert!(manager.state().is_standalone());
    }

    #[test]
    fn test_run_depth_events() {
        let manager = StateManager::new();
        assert_eq!(manager.enter_run(), 1);
        assert_eq!(manager.enter_run(), 2);

        let changes = manager.update(|status| status.run_depth -= 1);
        assert_eq!(changes, vec![StateChange::NestedRunExited { depth: 2 }]);
        assert_eq!(manager.exit_run(), 0);
        assert_eq!(manager.exit_run(), 0);
    }

    #[test]
    fn test_no_event_without_change() {
        let manager = StateManager::new();
        assert!(manager.update(|_| {}).is_empty());
    }

    #[test]
    fn test_subscribe_to_changes() {
        let manager = StateManager::new();
        let mut rx = manager.subscribe();

        manager.mark_closed();

        let event = rx.try_recv();
        assert!(matches!(event, Ok(StateChange::Closed)));
    }

    #[test]
    fn test_multiple_subscribers() {
        let manager = StateManager::new();
        let mut rx1 = manager.subscribe();
        let mut rx2 = manager.subscribe();

        manager.enter_slave(0);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_clone_shares_status() {
        let manager1 = StateManager::new();
        let manager2 = manager1.clone();

        manager1.enter_run();
        assert_eq!(manager2.snapshot().run_depth, 1);
    }

    #[tokio::test]
    async fn test_receiver_on_async_runtime() {
        let manager = StateManager::new();
        let mut rx = manager.subscribe();

        let writer = manager.clone();
        let handle = tokio::task::spawn_blocking(move || {
            writer.enter_slave(1);
            writer.leave_slave(1);
        });
        handle.await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), StateChange::SlaveStarted { mirrors: 1 });
        assert_eq!(rx.recv().await.unwrap(), StateChange::SlaveStopped { detached: 1 });
    }
}
