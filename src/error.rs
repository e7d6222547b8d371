// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SweepError>;

/// Failure kinds the driver and the stream supervisor match on. Everything
/// else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum SweepError {
    /// Malformed or incomplete configuration. Fatal at stream construction.
    #[error("{0}")]
    Spec(String),

    /// The SSH password was rejected by the remote host.
    #[error("Invalid credentials for {0}")]
    InvalidCredentials(String),

    /// The absolute stream timeout expired.
    #[error("Timeout after {} seconds", crate::util::fmt_secs(*.0))]
    Timeout(f64),

    /// No output was observed within the idle window.
    #[error("Timeout after {} seconds of inactivity", crate::util::fmt_secs(*.0))]
    Idle(f64),

    /// A parser rejected a line it was configured to understand.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A parser produced a metric the spec does not declare. Warned, never
    /// fatal.
    #[error("Trying to update an undefined metric: '{0}'")]
    UnknownMetric(String),

    /// The user interrupted the run.
    #[error("Interrupted by the user")]
    Interrupted,
}

impl SweepError {
    pub fn spec(msg: impl Into<String>) -> SweepError {
        SweepError::Spec(msg.into())
    }
}
