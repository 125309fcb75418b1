use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

// SYNC FENCE
// ================================================================================================

/// Terminal state of a [`SyncFence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signalled,
    Error,
}

/// A shareable completion gate returned by fenced dispatch.
///
/// A back-end signals the fence once the outputs of a dispatch are fully
/// materialised; the plan interpreter waits on the previous step's fence
/// before reading any boolean condition, and fenced execution chains each
/// step's fence into the next dispatch as a wait precondition.
#[derive(Debug, Clone)]
pub struct SyncFence {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<Option<FenceStatus>>,
    cond: Condvar,
}

impl SyncFence {
    /// Creates an unsignalled fence.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Creates a fence that is already signalled with the given status.
    pub fn signalled(status: FenceStatus) -> Self {
        let fence = Self::new();
        fence.signal(status);
        fence
    }

    /// Signals the fence. Signalling an already-signalled fence is a no-op.
    pub fn signal(&self, status: FenceStatus) {
        let mut state = self.inner.state.lock().expect("fence mutex poisoned");
        if state.is_none() {
            *state = Some(status);
            self.inner.cond.notify_all();
        }
    }

    /// Blocks until the fence is signalled and returns its status.
    pub fn wait(&self) -> FenceStatus {
        let mut state = self.inner.state.lock().expect("fence mutex poisoned");
        while state.is_none() {
            state = self.inner.cond.wait(state).expect("fence mutex poisoned");
        }
        state.expect("checked above")
    }

    /// Blocks until the fence is signalled or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FenceStatus> {
        let mut state = self.inner.state.lock().expect("fence mutex poisoned");
        while state.is_none() {
            let (guard, result) = self
                .inner
                .cond
                .wait_timeout(state, timeout)
                .expect("fence mutex poisoned");
            state = guard;
            if result.timed_out() {
                return *state;
            }
        }
        *state
    }

    /// Returns the status without blocking, if the fence has been signalled.
    pub fn status(&self) -> Option<FenceStatus> {
        *self.inner.state.lock().expect("fence mutex poisoned")
    }
}

impl Default for SyncFence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn wait_returns_after_signal_from_another_thread() {
        let fence = SyncFence::new();
        let signaller = fence.clone();
        let handle = thread::spawn(move || signaller.signal(FenceStatus::Signalled));
        assert_eq!(fence.wait(), FenceStatus::Signalled);
        handle.join().unwrap();
    }

    #[test]
    fn signalled_fence_is_immediately_ready() {
        let fence = SyncFence::signalled(FenceStatus::Error);
        assert_eq!(fence.status(), Some(FenceStatus::Error));
        assert_eq!(fence.wait(), FenceStatus::Error);
    }

    #[test]
    fn second_signal_does_not_override_first() {
        let fence = SyncFence::new();
        fence.signal(FenceStatus::Signalled);
        fence.signal(FenceStatus::Error);
        assert_eq!(fence.wait(), FenceStatus::Signalled);
    }

    #[test]
    fn wait_timeout_on_unsignalled_fence_returns_none() {
        let fence = SyncFence::new();
        assert_eq!(fence.wait_timeout(Duration::from_millis(5)), None);
    }
}
