//! Harness error types.
//!
//! Each variant maps to what happens to the owning test case:
//! - `MissingEnvironment`: the case is skipped (harness setup issue)
//! - `Enumeration`: the whole run aborts before any case starts
//! - `CleanupFailure`: logged by the lifecycle coordinator, never escalated
//! - everything else: the case fails; sibling cases keep running

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Harness error type.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A required environment value is not set.
    #[error("{0} is not set")]
    MissingEnvironment(String),

    /// The manifest could not be read from disk.
    #[error("Error reading file {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The apply tool could not be started at all.
    #[error("Failed to run {program}: {source}")]
    DeployerUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The apply tool exited non-zero. `output` is the combined stdout/stderr.
    #[error("{status} Output: {output}")]
    DeploymentFailed { status: String, output: String },

    /// The apply tool did not exit within the configured bound.
    #[error("Deployment did not finish within {timeout:?} Output: {output}")]
    DeploymentTimedOut { timeout: Duration, output: String },

    /// Apply output held a creation line that cannot be trusted.
    #[error("Failed to get created Tekton resource: {0}")]
    ExtractionAmbiguous(String),

    /// Status lookup against the cluster failed.
    #[error("Failed to look up {resource}: {message}")]
    Lookup { resource: String, message: String },

    /// The resource reached a failed terminal state.
    #[error("{resource} failed: {last_status}")]
    WaitFailed {
        resource: String,
        last_status: String,
    },

    /// The resource did not reach a terminal state in time.
    #[error("{resource} not done within {timeout:?}, last status: {last_status}")]
    WaitTimedOut {
        resource: String,
        timeout: Duration,
        last_status: String,
    },

    /// Namespace provisioning or fixture creation failed at the cluster level.
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// A registered cleanup failed.
    #[error("Cleanup {label} failed: {message}")]
    CleanupFailure { label: String, message: String },

    /// Walking the examples directory failed.
    #[error("couldn't walk path {path}: {message}")]
    Enumeration { path: PathBuf, message: String },
}

impl HarnessError {
    /// Whether the owning case should be reported as skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, HarnessError::MissingEnvironment(_))
    }
}

impl From<kube::Error> for HarnessError {
    fn from(err: kube::Error) -> Self {
        HarnessError::Cluster(err.to_string())
    }
}

/// Result type alias using `HarnessError`
pub type Result<T> = std::result::Result<T, HarnessError>;
