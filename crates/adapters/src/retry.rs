use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;

use writer_core::{CancellationToken, RetryPolicy};

use crate::error::AdapterError;
use crate::transport::{ChatCompletionRequest, Transport};

/// Waits out a backoff delay. Returns `false` when the wait was cut short by
/// cancellation.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        !cancel.wait_timeout(duration)
    }
}

/// Runs `f` until it succeeds, fails with a non-retryable error, or the
/// policy's retry budget is spent. Attempt `n` (0-based) that fails
/// transiently is followed by a delay of `base_delay * (n + 1)`.
pub fn call_with_retry<F, T>(
    mut f: F,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let mut attempt = 0usize;

    loop {
        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        let err = match f() {
            Ok(value) => return Ok(value),
            Err(AdapterError::Cancelled) => return Err(AdapterError::Cancelled),
            Err(err) => err,
        };

        if !err.is_retryable() {
            debug!("[call_with_retry] giving up on non-retryable error: {}", err);
            return Err(AdapterError::non_retryable(attempt + 1, err));
        }
        if attempt >= policy.max_retries {
            return Err(AdapterError::retry_exhausted(attempt + 1, err));
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            "[call_with_retry] attempt {}/{} failed: {}; retrying in {:?}",
            attempt + 1,
            policy.max_attempts(),
            err,
            delay
        );
        if !sleeper.sleep(delay, cancel) {
            return Err(AdapterError::Cancelled);
        }
        attempt += 1;
    }
}

/// Wraps a [`Transport`] with the retry loop.
pub struct RetryingInvoker<T, S = ThreadSleeper> {
    transport: T,
    policy: RetryPolicy,
    sleeper: S,
}

impl<T: Transport> RetryingInvoker<T, ThreadSleeper> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            sleeper: ThreadSleeper,
        }
    }
}

impl<T: Transport, S: Sleeper> RetryingInvoker<T, S> {
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> RetryingInvoker<T, S2> {
        RetryingInvoker {
            transport: self.transport,
            policy: self.policy,
            sleeper,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn invoke(
        &self,
        body: &ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, AdapterError> {
        self.invoke_with(body, cancel, Ok)
    }

    /// Like [`invoke`](Self::invoke), but `parse` runs inside each attempt so a
    /// response it rejects is classified by the retry loop like any other
    /// failure.
    pub fn invoke_with<R, P>(
        &self,
        body: &ChatCompletionRequest,
        cancel: &CancellationToken,
        parse: P,
    ) -> Result<R, AdapterError>
    where
        P: Fn(Value) -> Result<R, AdapterError>,
    {
        call_with_retry(
            || self.transport.send(body, cancel).and_then(&parse),
            &self.policy,
            &self.sleeper,
            cancel,
        )
    }
}
