//! Error types for rtbh.

use thiserror::Error;

/// Process exit code for a fully successful run.
pub const EXIT_OK: i32 = 0;
/// Anything that failed before the router was touched.
pub const EXIT_PIPELINE_FAILURE: i32 = 1;
/// Deployment reached `Failed` or `RolledBack`.
pub const EXIT_DEPLOY_FAILED: i32 = 2;
/// The rendered artifact matches the last confirmed deployment.
pub const EXIT_NO_CHANGES: i32 = 3;

#[derive(Error, Debug)]
pub enum RtbhError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to fetch source '{source_id}': {reason}")]
    Fetch { source_id: String, reason: String },

    #[error("{source_id}:{line}: cannot parse '{text}'")]
    Parse {
        source_id: String,
        line: usize,
        text: String,
    },

    #[error("Invalid operand: {0}")]
    InvalidOperand(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Timed out after {secs}s during {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("Verification mismatch: {0}")]
    VerificationMismatch(String),

    #[error("Another deployment to {device} is already in progress (lock: {lock_path})")]
    LockContention { device: String, lock_path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RtbhError {
    /// True for errors raised while talking to the device.
    pub fn is_deployment_error(&self) -> bool {
        matches!(
            self,
            Self::Transfer(_) | Self::Auth(_) | Self::Timeout { .. } | Self::VerificationMismatch(_)
        )
    }

    /// Exit code the CLI reports when this error ends the run.
    pub fn exit_code(&self) -> i32 {
        if self.is_deployment_error() {
            EXIT_DEPLOY_FAILED
        } else {
            EXIT_PIPELINE_FAILURE
        }
    }
}

/// Exit code for an error that ended the run, from the first [`RtbhError`]
/// in its chain.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RtbhError>())
        .map_or(EXIT_PIPELINE_FAILURE, RtbhError::exit_code)
}
