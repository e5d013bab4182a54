// Bridge - registration table between scheduler sources and native watches
//
// While the loop is a slave of the native main loop, every scheduler-level
// readiness source (fd interest, timer, the soon-queue) is mirrored by one
// native source. The bridge owns that mapping:
// - MirrorKey -> Mirror (native SourceId + token) and SourceId -> MirrorKey
// - attach()/detach() delimit the slave session; detach removes the native
//   sources but never touches scheduler registrations
// - suspend()/resume() turn mirroring off while the loop iterates without the
//   native loop; the event loop reconciles the table afterwards
//
// Every mirror gets a fresh token. A native callback carries the token it was
// registered with and is ignored once that token is no longer current, so a
// source that was detached or replaced can never fire scheduler callbacks.

use crate::metrics::LoopMetrics;
use crate::native::{FdSourceFn, IoCondition, NativeLoop, SourceFn, SourceId};
use crate::scheduler::TimerId;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// A scheduler-level readiness source that can be mirrored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MirrorKey {
    /// The soon-queue, pumped by a zero-delay native timeout
    Ready,
    Timer(TimerId),
    Io(RawFd),
    /// Read end of the cross-thread wakeup pipe
    Wakeup,
}

/// Token identifying one registration of a mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MirrorToken(u64);

/// What the native side of a mirror looks like
pub(crate) enum MirrorKind {
    Timeout(Duration),
    Fd(RawFd, IoCondition),
}

pub(crate) enum NativeCallback {
    Plain(SourceFn),
    Fd(FdSourceFn),
}

#[derive(Debug, Clone, Copy)]
struct Mirror {
    source: SourceId,
    token: MirrorToken,
    condition: Option<IoCondition>,
}

pub(crate) struct Bridge {
    native: Rc<dyn NativeLoop>,
    metrics: Arc<LoopMetrics>,
    table: IndexMap<MirrorKey, Mirror>,
    reverse: HashMap<SourceId, MirrorKey>,
    attached: bool,
    suspended: u32,
    next_token: u64,
}

impl Bridge {
    pub(crate) fn new(native: Rc<dyn NativeLoop>, metrics: Arc<LoopMetrics>) -> Self {
        Self {
            native,
            metrics,
            table: IndexMap::new(),
            reverse: HashMap::new(),
            attached: false,
            suspended: 0,
            next_token: 0,
        }
    }

    pub(crate) fn native(&self) -> &Rc<dyn NativeLoop> {
        &self.native
    }

    /// Start a slave session; the caller mirrors the existing sources next
    pub(crate) fn attach(&mut self) {
        self.attached = true;
    }

    /// End the slave session, removing every native mirror
    pub(crate) fn detach(&mut self) -> usize {
        self.attached = false;
        let removed = self.table.len();
        for (key, mirror) in std::mem::take(&mut self.table) {
            self.native.source_remove(mirror.source);
            self.metrics.record_mirror_removed();
            tracing::trace!("Bridge: detached {:?} (source {})", key, mirror.source.as_raw());
        }
        self.reverse.clear();
        removed
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.attached
    }

    pub(crate) fn suspend(&mut self) {
        self.suspended += 1;
    }

    /// Returns true when mirroring is live again
    pub(crate) fn resume(&mut self) -> bool {
        self.suspended = self.suspended.saturating_sub(1);
        self.is_mirroring()
    }

    /// True when new registrations must be mirrored right away
    pub(crate) fn is_mirroring(&self) -> bool {
        self.attached && self.suspended == 0
    }

    pub(crate) fn contains(&self, key: MirrorKey) -> bool {
        self.table.contains_key(&key)
    }

    pub(crate) fn is_current(&self, key: MirrorKey, token: MirrorToken) -> bool {
        self.table.get(&key).is_some_and(|m| m.token == token)
    }

    pub(crate) fn condition(&self, key: MirrorKey) -> Option<IoCondition> {
        self.table.get(&key).and_then(|m| m.condition)
    }

    pub(crate) fn source_of(&self, key: MirrorKey) -> Option<SourceId> {
        self.table.get(&key).map(|m| m.source)
    }

    pub(crate) fn key_of(&self, source: SourceId) -> Option<MirrorKey> {
        self.reverse.get(&source).copied()
    }

    pub(crate) fn keys(&self) -> Vec<MirrorKey> {
        self.table.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    /// Register a native source for `key`, replacing an existing mirror.
    ///
    /// `make` receives the new token and builds the native callback.
    pub(crate) fn mirror<F>(&mut self, key: MirrorKey, kind: MirrorKind, make: F) -> SourceId
    where
        F: FnOnce(MirrorToken) -> NativeCallback,
    {
        self.next_token += 1;
        let token = MirrorToken(self.next_token);
        let callback = make(token);

        let (source, condition) = match (kind, callback) {
            (MirrorKind::Timeout(delay), NativeCallback::Plain(cb)) => (self.native.timeout_add(delay, cb), None),
            (MirrorKind::Fd(fd, condition), NativeCallback::Fd(cb)) => {
                (self.native.fd_add(fd, condition, cb), Some(condition))
            }
            (MirrorKind::Timeout(delay), NativeCallback::Fd(mut cb)) => {
                let fd = match key {
                    MirrorKey::Io(fd) => fd,
                    _ => -1,
                };
                let plain: SourceFn = Box::new(move || cb(fd, IoCondition::empty()));
                (self.native.timeout_add(delay, plain), None)
            }
            (MirrorKind::Fd(fd, condition), NativeCallback::Plain(mut cb)) => {
                let wrapped: FdSourceFn = Box::new(move |_, _| cb());
                (self.native.fd_add(fd, condition, wrapped), Some(condition))
            }
        };

        let mirror = Mirror {
            source,
            token,
            condition,
        };
        if let Some(old) = self.table.insert(key, mirror) {
            self.reverse.remove(&old.source);
            self.native.source_remove(old.source);
            self.metrics.record_mirror_removed();
        }
        self.reverse.insert(source, key);
        self.metrics.record_mirror_added();
        tracing::trace!("Bridge: mirrored {:?} as source {}", key, source.as_raw());
        source
    }

    /// Remove the mirror of `key` together with its native source
    pub(crate) fn unmirror(&mut self, key: MirrorKey) -> bool {
        match self.table.shift_remove(&key) {
            Some(mirror) => {
                self.reverse.remove(&mirror.source);
                self.native.source_remove(mirror.source);
                self.metrics.record_mirror_removed();
                tracing::trace!("Bridge: unmirrored {:?}", key);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for a native source that removed itself (its callback
    /// returned Break); only if `token` is still the current one
    pub(crate) fn forget(&mut self, key: MirrorKey, token: MirrorToken) -> bool {
        if !self.is_current(key, token) {
            return false;
        }
        if let Some(mirror) = self.table.shift_remove(&key) {
            self.reverse.remove(&mirror.source);
            self.metrics.record_mirror_removed();
        }
        true
    }
}
