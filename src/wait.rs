//! Bounded, cancellable polling. Every suspension point in the crate goes
//! through here; deadlines are wall-clock, never tick counts.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
    Cancelled,
}

/// Poll `check` every `interval` until it returns true, `timeout`
/// elapses, or `cancel` fires. `check` runs once immediately. A check
/// that is still running at the deadline is abandoned.
pub async fn wait_until<F, Fut>(
    mut check: F,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let satisfied = tokio::select! {
            _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            r = tokio::time::timeout(remaining, check()) => match r {
                Ok(ok) => ok,
                Err(_) => return WaitOutcome::TimedOut,
            },
        };
        if satisfied {
            return WaitOutcome::Satisfied;
        }

        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        let pause = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancel.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
