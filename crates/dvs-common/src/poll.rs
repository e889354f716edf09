//! Bounded-retry polling.
//!
//! Every wait in the harness (service readiness, store convergence, "N keys
//! now exist", topology verification retries) goes through [`poll`].

use std::fmt::Debug;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DvsError, Result};

/// Interval, deadline and strictness of a single [`poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// When set, a timeout is an error. Otherwise the last value is returned.
    pub strict: bool,
    /// Optional cap on predicate invocations, checked alongside `timeout`.
    pub max_attempts: Option<u32>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            strict: true,
            max_attempts: None,
        }
    }
}

impl PollingConfig {
    pub fn new(interval: Duration, timeout: Duration, strict: bool) -> Self {
        PollingConfig {
            interval,
            timeout,
            strict,
            max_attempts: None,
        }
    }

    /// A config bounded only by invocation count, however long each
    /// invocation takes.
    pub fn attempts(count: u32, interval: Duration) -> Self {
        PollingConfig {
            interval,
            timeout: Duration::MAX,
            strict: false,
            max_attempts: Some(count.max(1)),
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }
}

/// Invoke `predicate` every `config.interval` until it reports success or
/// the deadline passes.
///
/// The predicate always runs at least once. On timeout a strict config
/// yields [`DvsError::PollTimeout`] carrying the last observed value; a
/// non-strict one returns `Ok((false, last))`.
pub fn poll<T, F>(what: &str, config: &PollingConfig, mut predicate: F) -> Result<(bool, T)>
where
    T: Debug,
    F: FnMut() -> (bool, T),
{
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        let (ok, value) = predicate();
        attempts += 1;
        if ok {
            tracing::trace!(what, attempts, elapsed = ?start.elapsed(), "poll satisfied");
            return Ok((true, value));
        }

        let out_of_attempts = config.max_attempts.is_some_and(|max| attempts >= max);
        let elapsed = start.elapsed();
        if out_of_attempts || elapsed >= config.timeout {
            if config.strict {
                tracing::warn!(what, attempts, ?elapsed, last = ?value, "strict poll timed out");
                return Err(DvsError::PollTimeout {
                    what: what.to_string(),
                    elapsed,
                    last: format!("{value:?}"),
                });
            }
            tracing::debug!(what, attempts, ?elapsed, "poll gave up");
            return Ok((false, value));
        }

        // Never sleep past the deadline by more than one interval.
        let remaining = config.timeout.saturating_sub(elapsed);
        thread::sleep(config.interval.min(remaining.max(Duration::from_millis(1))));
    }
}

/// Same as [`poll`]; reads better where the value is the point.
pub fn wait_for_result<T, F>(what: &str, config: &PollingConfig, predicate: F) -> Result<(bool, T)>
where
    T: Debug,
    F: FnMut() -> (bool, T),
{
    poll(what, config, predicate)
}

/// [`poll`] for predicates that carry no value.
pub fn wait_for_condition<F>(what: &str, config: &PollingConfig, mut condition: F) -> Result<bool>
where
    F: FnMut() -> bool,
{
    poll(what, config, || (condition(), ())).map(|(ok, ())| ok)
}
