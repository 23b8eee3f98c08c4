//! Bounded retries and per-call timeouts for remote operations.
//!
//! # Invariants
//! - Only retryable failures (`Transient`, `Timeout`) are retried, and a
//!   timed-out call that is not idempotent is never re-issued.
//! - Attempts never exceed `max_attempts`; backoff never exceeds the cap.
//! - At most one call per source is in flight. A call abandoned on timeout
//!   keeps its source busy until it returns; the next call waits for it at
//!   most one timeout and fails with `Timeout` instead of overlapping it.

use crate::config::RetryConfig;
use crate::sync::source::{SourceError, SourceErrorKind, SourceResult};
use log::warn;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Pause between attempts. Tests swap in a recording no-op.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

pub fn thread_sleeper() -> Sleeper {
    Arc::new(thread::sleep)
}

/// Whether a call may be re-issued after it timed out.
///
/// A timeout leaves the outcome unknown: the call may still land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    /// Landing twice has a visible effect, such as a duplicate item.
    NotIdempotent,
}

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.backoff_multiplier.max(1),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): `initial * multiplier^(retry-1)`,
    /// capped at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.multiplier.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Runs `op` with retries. `label` names the operation in logs.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    sleeper: &Sleeper,
    label: &str,
    idempotency: Idempotency,
    mut op: impl FnMut() -> SourceResult<T>,
) -> SourceResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if should_retry(&err, idempotency) && attempt < policy.max_attempts => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    "event=remote_retry module=sync status=warn op={label} attempt={attempt} max_attempts={} delay_ms={} error_kind={}",
                    policy.max_attempts,
                    delay.as_millis(),
                    err.kind.as_str()
                );
                sleeper(delay);
                attempt += 1;
            }
            Err(err) => {
                if err.kind == SourceErrorKind::Timeout && idempotency == Idempotency::NotIdempotent
                {
                    warn!(
                        "event=remote_retry module=sync status=skip op={label} attempt={attempt} reason=not_idempotent error_kind={}",
                        err.kind.as_str()
                    );
                }
                return Err(err);
            }
        }
    }
}

fn should_retry(err: &SourceError, idempotency: Idempotency) -> bool {
    match err.kind {
        SourceErrorKind::Timeout => idempotency == Idempotency::Idempotent,
        _ => err.is_retryable(),
    }
}

/// Serialises remote calls to one source, abandoned ones included.
#[derive(Debug, Default)]
pub struct CallGate {
    /// Completion signal of a call that outlived its timeout. The sender
    /// side is dropped when that worker finishes.
    straggler: Mutex<Option<mpsc::Receiver<()>>>,
}

impl CallGate {
    /// Runs `op` on a worker thread and waits at most `timeout` for it.
    ///
    /// A call still running from an earlier timeout is given up to `timeout`
    /// to finish first; if it does not, `op` is not started.
    pub fn call<T, F>(&self, source_id: &str, timeout: Duration, op: F) -> SourceResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> SourceResult<T> + Send + 'static,
    {
        let mut straggler = self.straggler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(done) = straggler.as_ref() {
            if let Err(mpsc::RecvTimeoutError::Timeout) = done.recv_timeout(timeout) {
                warn!(
                    "event=remote_call module=sync status=skip source_id={source_id} reason=previous_call_running"
                );
                return Err(SourceError::new(
                    source_id,
                    SourceErrorKind::Timeout,
                    "previous remote call is still running",
                ));
            }
            *straggler = None;
        }

        let (sender, receiver) = mpsc::channel();
        let (done_sender, done_receiver) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name(format!("listsync-call-{source_id}"))
            .spawn(move || {
                let _done = done_sender;
                // Receiver may be gone after a timeout.
                let _ = sender.send(op());
            });
        if let Err(err) = spawned {
            return Err(SourceError::new(
                source_id,
                SourceErrorKind::Transient,
                format!("failed to spawn remote call worker: {err}"),
            ));
        }

        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                *straggler = Some(done_receiver);
                Err(SourceError::new(
                    source_id,
                    SourceErrorKind::Timeout,
                    format!("remote call exceeded {} ms", timeout.as_millis()),
                ))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SourceError::new(
                source_id,
                SourceErrorKind::Transient,
                "remote call worker ended without a result",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{with_retry, CallGate, Idempotency, RetryPolicy, Sleeper};
    use crate::sync::source::{SourceError, SourceErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2,
            max_backoff: Duration::from_millis(250),
            call_timeout: Duration::from_millis(50),
        }
    }

    fn recording_sleeper() -> (Sleeper, Arc<Mutex<Vec<Duration>>>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&slept);
        let sleeper: Sleeper = Arc::new(move |delay| sink.lock().expect("lock").push(delay));
        (sleeper, slept)
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(250));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(250));
    }

    #[test]
    fn retries_transient_failures_until_success() {
        let (sleeper, slept) = recording_sleeper();
        let mut calls = 0;
        let result = with_retry(&policy(), &sleeper, "list_items", Idempotency::Idempotent, || {
            calls += 1;
            if calls < 3 {
                Err(SourceError::transient("fake", "connection reset"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.expect("third attempt should succeed"), 3);
        assert_eq!(
            *slept.lock().expect("lock"),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let (sleeper, _) = recording_sleeper();
        let mut calls = 0;
        let err = with_retry(&policy(), &sleeper, "update_item", Idempotency::Idempotent, || -> Result<(), _> {
            calls += 1;
            Err(SourceError::transient("fake", "still down"))
        })
        .expect_err("should give up");
        assert_eq!(calls, 3);
        assert_eq!(err.kind, SourceErrorKind::Transient);
    }

    #[test]
    fn does_not_retry_authentication_errors() {
        let (sleeper, slept) = recording_sleeper();
        let mut calls = 0;
        let err = with_retry(&policy(), &sleeper, "list_items", Idempotency::Idempotent, || -> Result<(), _> {
            calls += 1;
            Err(SourceError::new(
                "fake",
                SourceErrorKind::Authentication,
                "token expired",
            ))
        })
        .expect_err("auth errors are final");
        assert_eq!(calls, 1);
        assert_eq!(err.kind, SourceErrorKind::Authentication);
        assert!(slept.lock().expect("lock").is_empty());
    }

    #[test]
    fn timed_out_create_is_not_reissued() {
        let (sleeper, slept) = recording_sleeper();
        let mut calls = 0;
        let err = with_retry(
            &policy(),
            &sleeper,
            "create_item",
            Idempotency::NotIdempotent,
            || -> Result<(), _> {
                calls += 1;
                Err(SourceError::new("fake", SourceErrorKind::Timeout, "too slow"))
            },
        )
        .expect_err("timeout is final for creates");
        assert_eq!(calls, 1);
        assert_eq!(err.kind, SourceErrorKind::Timeout);
        assert!(slept.lock().expect("lock").is_empty());

        let mut calls = 0;
        let result = with_retry(
            &policy(),
            &sleeper,
            "create_item",
            Idempotency::NotIdempotent,
            || {
                calls += 1;
                if calls == 1 {
                    Err(SourceError::transient("fake", "connection refused"))
                } else {
                    Ok(calls)
                }
            },
        );
        assert_eq!(result.expect("transient failures are still retried"), 2);
    }

    #[test]
    fn slow_call_times_out_as_retryable() {
        let err = CallGate::default().call("fake", Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .expect_err("call should time out");
        assert_eq!(err.kind, SourceErrorKind::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn fast_call_returns_its_result() {
        let value = CallGate::default()
            .call("fake", Duration::from_secs(5), || Ok(7))
            .expect("call should finish in time");
        assert_eq!(value, 7);
    }

    #[test]
    fn abandoned_call_blocks_the_next_one_until_it_returns() {
        let gate = CallGate::default();
        let started = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&started);
        let err = gate
            .call("fake", Duration::from_millis(30), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .expect_err("first call should time out");
        assert_eq!(err.kind, SourceErrorKind::Timeout);

        let counter = Arc::clone(&started);
        let err = gate
            .call("fake", Duration::from_millis(30), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect_err("second call must not overlap the first");
        assert_eq!(err.kind, SourceErrorKind::Timeout);
        assert_eq!(started.load(Ordering::SeqCst), 1);

        let waited = Instant::now();
        let counter = Arc::clone(&started);
        gate.call("fake", Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("call after the straggler returns should run");
        assert!(waited.elapsed() < Duration::from_secs(5));
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }
}
