use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Shared flag a caller flips to abandon an in-flight generation.
///
/// Clones observe the same flag. Waiting threads are woken as soon as the
/// token is cancelled.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if let Ok(mut guard) = self.inner.cancelled.lock() {
            *guard = true;
        }
        self.inner.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner
            .cancelled
            .lock()
            .map(|guard| *guard)
            .unwrap_or(true)
    }

    /// Blocks for up to `duration`. Returns `true` if the token was cancelled
    /// before or during the wait.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let Ok(mut guard) = self.inner.cancelled.lock() else {
            return true;
        };

        while !*guard {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.inner.signal.wait_timeout(guard, deadline - now) {
                Ok((next, _)) => guard = next,
                Err(_) => return true,
            }
        }

        true
    }
}
