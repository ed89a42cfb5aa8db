use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// A messenger request/response action exceeded its deadline
    /// (action timeout plus latency buffer). Distinct from slice-level
    /// failures, which are application errors.
    #[error("messenger action timed out after {0}ms")]
    ActionTimeout(u128),

    #[error("worker {0} already has a slice in flight")]
    WorkerBusy(String),

    /// An individual pipeline stage rejected the slice.
    #[error("{0}")]
    Stage(String),

    /// A slice failed processing. The message carries the full wrapped
    /// error string that is also reported to the execution controller.
    #[error("{0}")]
    SliceFailed(String),

    #[error("Failed to shutdown correctly: Worker shutdown timeout after {0} seconds, forcing shutdown")]
    ShutdownTimeout(f64),

    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    /// Wrap a stage failure with the deterministic prefix the execution
    /// controller expects in slice-completion messages.
    pub fn slice_failed(cause: &dyn std::fmt::Display) -> Self {
        WorkerError::SliceFailed(format!(
            "Error: Slice failed processing, caused by {cause}"
        ))
    }

    /// Shutdown timeout error for a watchdog bound given as a duration.
    pub fn shutdown_timeout(bound: std::time::Duration) -> Self {
        WorkerError::ShutdownTimeout(bound.as_millis() as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn slice_failed_carries_the_wrapping_prefix() {
        let err = WorkerError::slice_failed(&"Bad news bears");
        assert_eq!(
            err.to_string(),
            "Error: Slice failed processing, caused by Bad news bears"
        );
    }

    #[test]
    fn shutdown_timeout_formats_fractional_seconds() {
        let err = WorkerError::shutdown_timeout(Duration::from_millis(500));
        assert_eq!(
            err.to_string(),
            "Failed to shutdown correctly: Worker shutdown timeout after 0.5 seconds, forcing shutdown"
        );
    }

    #[test]
    fn shutdown_timeout_formats_whole_seconds_without_trailing_zeroes() {
        let err = WorkerError::shutdown_timeout(Duration::from_secs(1));
        assert_eq!(
            err.to_string(),
            "Failed to shutdown correctly: Worker shutdown timeout after 1 seconds, forcing shutdown"
        );
    }
}
