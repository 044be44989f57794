//! Fixed-interval polling until a remote resource reports a target status.
//!
//! The waiter never interprets status values: it compares them to the target
//! with exact string equality and keeps polling until the deadline. Remote
//! states that can never lead to the target (for example `ERROR`) are only
//! short-circuited when the caller opts in with
//! [`StatusWaiter::with_abort_on`].

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::handle::ResourceHandle;

/// Default interval between two status reads.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound on a single wait; long enough for a VM to boot.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(600);

/// Future returned by [`StatusSource::status`].
pub type StatusFuture<'a, E> = Pin<Box<dyn Future<Output = Result<String, E>> + Send + 'a>>;

/// Read-only accessor returning the current status of a resource.
pub trait StatusSource {
    /// Failure raised when the status cannot be fetched.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetches the current status string for `handle` from the remote system.
    fn status<'a>(&'a self, handle: &'a ResourceHandle) -> StatusFuture<'a, Self::Error>;
}

/// Successful wait result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WaitOutcome {
    /// Status observed on the final poll (equal to the target).
    pub status: String,
    /// Time between the first poll and the matching poll.
    pub elapsed: Duration,
    /// Number of accessor calls made.
    pub polls: u32,
}

/// Errors raised by [`StatusWaiter::wait`].
#[derive(Debug, Error)]
pub enum WaitError<E>
where
    E: std::error::Error + 'static,
{
    /// The target status was not observed before the deadline.
    #[error(
        "{handle} did not reach status {target} within {}s (last observed: {last_observed})",
        elapsed.as_secs()
    )]
    Timeout {
        /// Resource being waited on.
        handle: ResourceHandle,
        /// Status the caller expected.
        target: String,
        /// Status returned by the last poll.
        last_observed: String,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The resource entered a status listed in the abort set.
    #[error("{handle} entered status {observed} while waiting for {target}")]
    Aborted {
        /// Resource being waited on.
        handle: ResourceHandle,
        /// Status the caller expected.
        target: String,
        /// Status that triggered the abort.
        observed: String,
    },
    /// The status accessor itself failed.
    #[error("failed to read status of {handle}: {source}")]
    Source {
        /// Resource being waited on.
        handle: ResourceHandle,
        /// Underlying accessor failure.
        #[source]
        source: E,
    },
}

impl<E> WaitError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns `true` when the deadline passed without a match.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Polls a [`StatusSource`] at a fixed interval until a target status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusWaiter {
    poll_interval: Duration,
    max_wait: Duration,
    abort_on: BTreeSet<String>,
}

impl Default for StatusWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_WAIT)
    }
}

impl StatusWaiter {
    /// Creates a waiter with the given poll interval and deadline.
    #[must_use]
    pub const fn new(poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            poll_interval,
            max_wait,
            abort_on: BTreeSet::new(),
        }
    }

    /// Fails fast when any of `statuses` is observed instead of polling on to
    /// the deadline. Empty by default.
    #[must_use]
    pub fn with_abort_on<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.abort_on = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Polls `source` until `handle` reports `target`.
    ///
    /// The first poll happens immediately, so an already-matching resource
    /// returns after a single accessor call.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] when the deadline passes without a
    /// match, [`WaitError::Aborted`] when an opted-in abort status is seen,
    /// and [`WaitError::Source`] when the accessor fails.
    pub async fn wait<S>(
        &self,
        source: &S,
        handle: &ResourceHandle,
        target: &str,
    ) -> Result<WaitOutcome, WaitError<S::Error>>
    where
        S: StatusSource + ?Sized,
    {
        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            let observed = source
                .status(handle)
                .await
                .map_err(|source_err| WaitError::Source {
                    handle: handle.clone(),
                    source: source_err,
                })?;
            polls = polls.saturating_add(1);
            let elapsed = started.elapsed();

            if observed == target {
                info!(
                    handle = %handle,
                    status = %observed,
                    elapsed_ms = elapsed.as_millis(),
                    polls,
                    "resource reached target status"
                );
                return Ok(WaitOutcome {
                    status: observed,
                    elapsed,
                    polls,
                });
            }

            if self.abort_on.contains(&observed) {
                return Err(WaitError::Aborted {
                    handle: handle.clone(),
                    target: target.to_owned(),
                    observed,
                });
            }

            if elapsed >= self.max_wait {
                return Err(WaitError::Timeout {
                    handle: handle.clone(),
                    target: target.to_owned(),
                    last_observed: observed,
                    elapsed,
                });
            }

            debug!(handle = %handle, status = %observed, target, "still waiting");
            let remaining = self.max_wait.saturating_sub(elapsed);
            sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests;
