//! Fixed-interval polling with an optional deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Result of [`poll_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Settled(T),
    TimedOut,
}

impl<T> PollOutcome<T> {
    pub fn settled(self) -> Option<T> {
        match self {
            Self::Settled(value) => Some(value),
            Self::TimedOut => None,
        }
    }
}

/// Calls `probe` every `interval` until it yields a value or `max_wait`
/// elapses. `None` waits forever.
pub async fn poll_until<T, F, Fut>(interval: Duration, max_wait: Option<Duration>, mut probe: F) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = max_wait.map(|wait| Instant::now() + wait);
    loop {
        if let Some(value) = probe().await {
            return PollOutcome::Settled(value);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return PollOutcome::TimedOut;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn settles_once_probe_yields() {
        let calls = AtomicU32::new(0);
        let outcome = poll_until(Duration::from_secs(1), Some(Duration::from_secs(10)), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            (n == 3).then_some(n)
        })
        .await;
        assert_eq!(outcome, PollOutcome::Settled(3));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_deadline() {
        let start = Instant::now();
        let outcome: PollOutcome<()> =
            poll_until(Duration::from_secs(1), Some(Duration::from_secs(5)), || async { None }).await;
        assert_eq!(outcome, PollOutcome::TimedOut);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(7));
    }
}
