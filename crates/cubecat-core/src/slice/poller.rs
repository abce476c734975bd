//! Time-bounded retry loop shared by slice acquisition and lock waits.

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::processor::CancelToken;

/// Outcome of a [`poll`] run.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
}

/// Call `f` until it yields a value or `timeout` elapses, sleeping
/// `interval` between attempts. `f` returning an error aborts the loop
/// immediately; cancellation is checked at every suspension point.
pub fn poll<T>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancelToken,
    mut f: impl FnMut() -> Result<Option<T>>,
) -> Result<PollOutcome<T>> {
    let start = Instant::now();
    loop {
        cancel.check()?;
        if let Some(value) = f()? {
            return Ok(PollOutcome::Ready(value));
        }
        if start.elapsed() >= timeout {
            return Ok(PollOutcome::TimedOut);
        }
        std::thread::sleep(interval.min(timeout.saturating_sub(start.elapsed())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_poll_returns_ready_value() {
        let mut calls = 0;
        let outcome = poll(
            Duration::from_millis(1),
            Duration::from_millis(200),
            &CancelToken::default(),
            || {
                calls += 1;
                Ok(if calls >= 3 { Some(42) } else { None })
            },
        )
        .unwrap();
        assert_eq!(outcome, PollOutcome::Ready(42));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_poll_times_out() {
        let outcome = poll(
            Duration::from_millis(5),
            Duration::from_millis(20),
            &CancelToken::default(),
            || Ok(None::<()>),
        )
        .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[test]
    fn test_poll_propagates_errors() {
        let result: Result<PollOutcome<()>> = poll(
            Duration::from_millis(1),
            Duration::from_millis(50),
            &CancelToken::default(),
            || Err(Error::config("broken")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_poll_respects_cancellation() {
        let cancel = CancelToken::default();
        cancel.cancel();
        let result: Result<PollOutcome<()>> = poll(
            Duration::from_millis(1),
            Duration::from_millis(50),
            &cancel,
            || Ok(None),
        );
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
