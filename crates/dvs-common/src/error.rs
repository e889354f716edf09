use std::time::Duration;

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DvsError {
    /// A strict poll ran out of time. `last` is the debug rendering of the
    /// final value the predicate observed.
    #[error("timed out after {elapsed:?} waiting for {what} (last observed: {last})")]
    PollTimeout {
        what: String,
        elapsed: Duration,
        last: String,
    },

    #[error("command `{command}` exited with {code}: {output}")]
    Command {
        command: String,
        code: i32,
        output: String,
    },

    /// Out-of-bounds or malformed value handed to the harness.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("provisioning {name} failed: {reason}")]
    Provision { name: String, reason: String },

    #[error("baseline capture failed: {0}")]
    Baseline(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("operation not valid in state {state}: {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    /// Teardown finished but one or more steps failed.
    #[error("cleanup incomplete: {}", .0.join("; "))]
    Cleanup(Vec<String>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DvsError>;

impl DvsError {
    pub fn is_poll_timeout(&self) -> bool {
        matches!(self, DvsError::PollTimeout { .. })
    }

    /// Text of the underlying failure, used for race-signature matching.
    pub fn output_text(&self) -> Option<&str> {
        match self {
            DvsError::Command { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_error_joins_steps() {
        let err = DvsError::Cleanup(vec!["rm vs".into(), "netns del vs-srv0".into()]);
        assert_eq!(
            err.to_string(),
            "cleanup incomplete: rm vs; netns del vs-srv0"
        );
    }

    #[test]
    fn command_error_exposes_output() {
        let err = DvsError::Command {
            command: "ip link del eth3".into(),
            code: 1,
            output: "Cannot find device \"eth3\"".into(),
        };
        assert_eq!(err.output_text(), Some("Cannot find device \"eth3\""));
        assert!(!err.is_poll_timeout());
    }
}
