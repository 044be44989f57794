//! Timing and outcome tests for the status waiter.
//!
//! All tests run on tokio's paused clock so elapsed durations are exact.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use rstest::rstest;
use thiserror::Error;

use super::*;

#[derive(Debug, Error)]
#[error("lookup failed")]
struct LookupFailed;

/// Returns scripted statuses in order, repeating the last one forever.
struct ScriptedStatus {
    statuses: Mutex<VecDeque<&'static str>>,
    last: Mutex<&'static str>,
    calls: AtomicU32,
    fail: bool,
}

impl ScriptedStatus {
    fn new(statuses: &[&'static str]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            last: Mutex::new(""),
            calls: AtomicU32::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(&[])
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> String {
        let mut queue = self.statuses.lock().expect("status lock");
        let mut last = self.last.lock().expect("last lock");
        if let Some(next) = queue.pop_front() {
            *last = next;
        }
        (*last).to_owned()
    }
}

impl StatusSource for ScriptedStatus {
    type Error = LookupFailed;

    fn status<'a>(&'a self, _handle: &'a ResourceHandle) -> StatusFuture<'a, Self::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail {
            Err(LookupFailed)
        } else {
            Ok(self.next())
        };
        Box::pin(async move { result })
    }
}

fn handle() -> ResourceHandle {
    ResourceHandle::from("server-1")
}

#[tokio::test(start_paused = true)]
async fn returns_after_target_observed_on_fourth_poll() {
    let source = ScriptedStatus::new(&["BUILD", "BUILD", "BUILD", "ACTIVE"]);
    let waiter = StatusWaiter::new(Duration::from_secs(1), Duration::from_secs(10));

    let outcome = waiter
        .wait(&source, &handle(), "ACTIVE")
        .await
        .expect("wait should succeed");

    assert_eq!(outcome.status, "ACTIVE");
    assert_eq!(outcome.elapsed, Duration::from_secs(3));
    assert_eq!(outcome.polls, 4);
}

#[tokio::test(start_paused = true)]
async fn times_out_exactly_at_deadline_when_status_never_changes() {
    let source = ScriptedStatus::new(&["BUILD"]);
    let waiter = StatusWaiter::new(Duration::from_secs(1), Duration::from_secs(5));

    let err = waiter
        .wait(&source, &handle(), "ACTIVE")
        .await
        .expect_err("BUILD never becomes ACTIVE");

    let WaitError::Timeout {
        target,
        last_observed,
        elapsed,
        ..
    } = err
    else {
        panic!("expected timeout, got {err:?}");
    };
    assert_eq!(target, "ACTIVE");
    assert_eq!(last_observed, "BUILD");
    assert_eq!(elapsed, Duration::from_secs(5));
    assert_eq!(source.calls(), 6, "polls at t=0..=5");
}

#[tokio::test(start_paused = true)]
async fn already_matching_status_needs_a_single_poll() {
    let source = ScriptedStatus::new(&["ACTIVE"]);
    let waiter = StatusWaiter::default();

    let first = waiter.wait(&source, &handle(), "ACTIVE").await;
    let second = waiter.wait(&source, &handle(), "ACTIVE").await;

    assert!(matches!(first, Ok(WaitOutcome { polls: 1, .. })));
    assert!(matches!(second, Ok(WaitOutcome { polls: 1, .. })));
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn error_status_keeps_polling_until_deadline_by_default() {
    let source = ScriptedStatus::new(&["BUILD", "ERROR"]);
    let waiter = StatusWaiter::new(Duration::from_secs(1), Duration::from_secs(4));

    let err = waiter
        .wait(&source, &handle(), "ACTIVE")
        .await
        .expect_err("ERROR never becomes ACTIVE");

    assert!(err.is_timeout(), "unexpected error: {err:?}");
    assert!(err.to_string().contains("last observed: ERROR"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn opt_in_abort_statuses_fail_fast() {
    let source = ScriptedStatus::new(&["BUILD", "ERROR"]);
    let waiter = StatusWaiter::new(Duration::from_secs(1), Duration::from_secs(60))
        .with_abort_on(["ERROR"]);

    let err = waiter
        .wait(&source, &handle(), "ACTIVE")
        .await
        .expect_err("ERROR should abort");

    assert!(
        matches!(err, WaitError::Aborted { ref observed, .. } if observed == "ERROR"),
        "unexpected error: {err:?}"
    );
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn accessor_failures_propagate_with_handle() {
    let source = ScriptedStatus::failing();
    let waiter = StatusWaiter::default();

    let err = waiter
        .wait(&source, &handle(), "ACTIVE")
        .await
        .expect_err("lookup failure should surface");

    assert!(matches!(err, WaitError::Source { ref handle, .. } if handle.as_str() == "server-1"));
    assert_eq!(source.calls(), 1, "no retries after an accessor failure");
}

#[rstest]
#[case::shorter_than_interval(Duration::from_secs(3), Duration::from_millis(2500))]
#[case::aligned(Duration::from_secs(1), Duration::from_secs(3))]
#[tokio::test(start_paused = true)]
async fn final_sleep_is_clamped_to_deadline(#[case] interval: Duration, #[case] deadline: Duration) {
    let source = ScriptedStatus::new(&["BUILD"]);
    let waiter = StatusWaiter::new(interval, deadline);

    let err = waiter
        .wait(&source, &handle(), "ACTIVE")
        .await
        .expect_err("never matches");

    let WaitError::Timeout { elapsed, .. } = err else {
        panic!("expected timeout");
    };
    assert_eq!(elapsed, deadline);
}
