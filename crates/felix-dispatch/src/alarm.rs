// Timer service backing idle, expiry and block alarms.
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::{DispatchError, Result};

/// Schedules one-shot callbacks on a Tokio runtime.
///
/// Callbacks must re-check whatever state they act on: a `cancel` racing a
/// firing alarm may lose.
#[derive(Debug, Clone)]
pub struct AlarmService {
    handle: Handle,
}

impl AlarmService {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime of the calling context.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| DispatchError::NoRuntime)
    }

    pub fn schedule<F>(&self, delay: Duration, callback: F) -> AlarmHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        AlarmHandle {
            abort: task.abort_handle(),
        }
    }

    /// Runs `callback` on the runtime as soon as possible, off the caller's stack.
    pub fn spawn<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { callback() });
    }
}

#[derive(Debug)]
pub struct AlarmHandle {
    abort: AbortHandle,
}

impl AlarmHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}
