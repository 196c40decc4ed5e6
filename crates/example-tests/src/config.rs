//! Harness configuration.
//!
//! Configuration is loaded from environment variables. `KO_DOCKER_REPO` is
//! deliberately not validated here: a missing registry skips each case at
//! substitution time instead of aborting the run.

use regex::Regex;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Registry substituted into manifests.
pub const DOCKER_REPO_VAR: &str = "KO_DOCKER_REPO";

/// Regex of manifest paths to leave out of the run.
pub const IGNORES_VAR: &str = "TEST_EXAMPLES_IGNORES";

/// Default apply program.
pub const DEFAULT_APPLY_TOOL: &str = "ko";

/// Default wait deadline per case in seconds.
pub const DEFAULT_WAIT_TIMEOUT_SECONDS: u64 = 600;

/// Default status poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MILLIS: u64 = 1000;

/// Default prefix for per-case namespaces.
pub const DEFAULT_NAMESPACE_PREFIX: &str = "arendelle";

/// Default `tekton.dev` API version used for status lookups.
pub const DEFAULT_TEKTON_API_VERSION: &str = "v1beta1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Invalid {var} pattern: {source}")]
    InvalidPattern {
        var: String,
        #[source]
        source: regex::Error,
    },
}

/// Harness configuration.
#[derive(Clone)]
pub struct HarnessConfig {
    /// Root directory holding the example manifests.
    pub examples_dir: PathBuf,

    /// Registry reference from `KO_DOCKER_REPO`, if set.
    pub docker_repo: Option<String>,

    /// Compiled `TEST_EXAMPLES_IGNORES` pattern, if set.
    pub ignore_pattern: Option<Regex>,

    /// Program invoked as `<tool> create -n <ns> -f -`.
    pub apply_tool: String,

    /// Deadline for a single wait.
    pub wait_timeout: Duration,

    /// Interval between status observations.
    pub poll_interval: Duration,

    /// Bound on the apply tool. `None` leaves it unbounded.
    pub deploy_timeout: Option<Duration>,

    /// Cap on concurrently running cases. `None` runs all at once.
    pub max_parallel: Option<usize>,

    /// Prefix for generated namespace names.
    pub namespace_prefix: String,

    /// API version of `tekton.dev` resources.
    pub tekton_api_version: String,
}

/// Custom Debug implementation that keeps the registry out of logs.
impl fmt::Debug for HarnessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessConfig")
            .field("examples_dir", &self.examples_dir)
            .field(
                "docker_repo",
                &self.docker_repo.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "ignore_pattern",
                &self.ignore_pattern.as_ref().map(Regex::as_str),
            )
            .field("apply_tool", &self.apply_tool)
            .field("wait_timeout", &self.wait_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("deploy_timeout", &self.deploy_timeout)
            .field("max_parallel", &self.max_parallel)
            .field("namespace_prefix", &self.namespace_prefix)
            .field("tekton_api_version", &self.tekton_api_version)
            .finish()
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let examples_dir = vars
            .get("EXAMPLES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_examples_dir);

        let docker_repo = vars.get(DOCKER_REPO_VAR).cloned();

        let ignore_pattern = vars
            .get(IGNORES_VAR)
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    var: IGNORES_VAR.to_string(),
                    source,
                })
            })
            .transpose()?;

        let apply_tool = vars
            .get("EXAMPLES_APPLY_TOOL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_APPLY_TOOL.to_string());

        let wait_timeout = Duration::from_secs(
            parse_positive(vars, "EXAMPLES_WAIT_TIMEOUT_SECONDS")?
                .unwrap_or(DEFAULT_WAIT_TIMEOUT_SECONDS),
        );

        let poll_interval = Duration::from_millis(
            parse_positive(vars, "EXAMPLES_POLL_INTERVAL_MILLIS")?
                .unwrap_or(DEFAULT_POLL_INTERVAL_MILLIS),
        );

        let deploy_timeout =
            parse_positive(vars, "EXAMPLES_DEPLOY_TIMEOUT_SECONDS")?.map(Duration::from_secs);

        let max_parallel = parse_positive(vars, "EXAMPLES_MAX_PARALLEL")?
            .map(|value| usize::try_from(value).unwrap_or(usize::MAX));

        let namespace_prefix = vars
            .get("EXAMPLES_NAMESPACE_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_NAMESPACE_PREFIX.to_string());

        let tekton_api_version = vars
            .get("TEKTON_API_VERSION")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TEKTON_API_VERSION.to_string());

        Ok(Self {
            examples_dir,
            docker_repo,
            ignore_pattern,
            apply_tool,
            wait_timeout,
            poll_interval,
            deploy_timeout,
            max_parallel,
            namespace_prefix,
            tekton_api_version,
        })
    }
}

/// The `examples/` directory at the repository root.
fn default_examples_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("examples")
}

fn parse_positive(vars: &HashMap<String, String>, var: &str) -> Result<Option<u64>, ConfigError> {
    let Some(value_str) = vars.get(var) else {
        return Ok(None);
    };

    let value: u64 = value_str
        .trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue {
            var: var.to_string(),
            message: format!("must be a valid positive integer, got '{}': {}", value_str, e),
        })?;

    if value == 0 {
        return Err(ConfigError::InvalidValue {
            var: var.to_string(),
            message: "must be greater than 0".to_string(),
        });
    }

    Ok(Some(value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::from_vars(&HashMap::new()).unwrap();

        assert!(config.examples_dir.ends_with("examples"));
        assert!(config.docker_repo.is_none());
        assert!(config.ignore_pattern.is_none());
        assert_eq!(config.apply_tool, "ko");
        assert_eq!(config.wait_timeout, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.deploy_timeout.is_none());
        assert!(config.max_parallel.is_none());
        assert_eq!(config.namespace_prefix, "arendelle");
        assert_eq!(config.tekton_api_version, "v1beta1");
    }

    #[test]
    fn test_overrides() {
        let config = HarnessConfig::from_vars(&vars(&[
            ("EXAMPLES_DIR", "/tmp/examples"),
            ("KO_DOCKER_REPO", "registry.local:5000"),
            ("TEST_EXAMPLES_IGNORES", "no-ci|pipelineruns/slow"),
            ("EXAMPLES_APPLY_TOOL", "kubectl"),
            ("EXAMPLES_WAIT_TIMEOUT_SECONDS", "30"),
            ("EXAMPLES_POLL_INTERVAL_MILLIS", "250"),
            ("EXAMPLES_DEPLOY_TIMEOUT_SECONDS", "120"),
            ("EXAMPLES_MAX_PARALLEL", "4"),
            ("TEKTON_API_VERSION", "v1"),
        ]))
        .unwrap();

        assert_eq!(config.examples_dir, PathBuf::from("/tmp/examples"));
        assert_eq!(config.docker_repo.as_deref(), Some("registry.local:5000"));
        assert!(config
            .ignore_pattern
            .as_ref()
            .unwrap()
            .is_match("examples/pipelineruns/slow.yaml"));
        assert_eq!(config.apply_tool, "kubectl");
        assert_eq!(config.wait_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.deploy_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.max_parallel, Some(4));
        assert_eq!(config.tekton_api_version, "v1");
    }

    #[test]
    fn test_invalid_ignore_pattern() {
        let err = HarnessConfig::from_vars(&vars(&[("TEST_EXAMPLES_IGNORES", "(unclosed")]))
            .expect_err("unbalanced pattern should be rejected");
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = HarnessConfig::from_vars(&vars(&[("EXAMPLES_WAIT_TIMEOUT_SECONDS", "0")]))
            .expect_err("zero timeout should be rejected");
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn test_non_numeric_interval_rejected() {
        let err = HarnessConfig::from_vars(&vars(&[("EXAMPLES_POLL_INTERVAL_MILLIS", "fast")]))
            .expect_err("non-numeric interval should be rejected");
        assert!(err.to_string().contains("EXAMPLES_POLL_INTERVAL_MILLIS"));
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_reads_process_environment() {
        env::set_var("KO_DOCKER_REPO", "kind.local");
        env::set_var("EXAMPLES_MAX_PARALLEL", "2");

        let config = HarnessConfig::from_env();

        env::remove_var("KO_DOCKER_REPO");
        env::remove_var("EXAMPLES_MAX_PARALLEL");

        let config = config.unwrap();
        assert_eq!(config.docker_repo.as_deref(), Some("kind.local"));
        assert_eq!(config.max_parallel, Some(2));
    }

    #[test]
    fn test_debug_redacts_registry() {
        let config =
            HarnessConfig::from_vars(&vars(&[("KO_DOCKER_REPO", "gcr.io/private-project")]))
                .unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("private-project"));
        assert!(debug.contains("[REDACTED]"));
    }
}
