//! Manifest templating.
//!
//! Example manifests are written against the upstream registry and the
//! `default` namespace. Before applying them, the registry is swapped for
//! `KO_DOCKER_REPO` and namespace declarations are pointed at the case's own
//! namespace so that ServiceAccounts and RoleBindings resolve under test.

use crate::config::DOCKER_REPO_VAR;
use crate::error::{HarnessError, Result};
use regex::bytes::{Captures, NoExpand, Regex};
use std::sync::LazyLock;

/// Registry reference the example manifests are written against.
pub const DEFAULT_DOCKER_REPO: &str = "gcr.io/christiewilson-catfactory";

/// Namespace the example manifests are written against.
pub const DEFAULT_NAMESPACE: &str = "default";

#[allow(clippy::expect_used)] // ADR-0002: pattern is a compile-time constant
static DOCKER_REPO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&regex::escape(DEFAULT_DOCKER_REPO)).expect("registry pattern is valid")
});

/// A line that declares `namespace: default`, optionally as a list item and
/// optionally followed by a YAML comment, which is kept.
#[allow(clippy::expect_used)] // ADR-0002: pattern is a compile-time constant
static NAMESPACE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?P<lead>[ \t]*(?:-[ \t]+)?)namespace:[ \t]*default(?P<trail>(?:[ \t]+#[^\r\n]*)?[ \t]*\r?)$",
    )
    .expect("namespace pattern is valid")
});

/// Substitute environment-specific values into a manifest.
///
/// Fails with `MissingEnvironment` when `docker_repo` (the value of
/// `KO_DOCKER_REPO`) is absent.
pub fn substitute_env(input: &[u8], docker_repo: Option<&str>, namespace: &str) -> Result<Vec<u8>> {
    let docker_repo =
        docker_repo.ok_or_else(|| HarnessError::MissingEnvironment(DOCKER_REPO_VAR.to_string()))?;

    let output = DOCKER_REPO_PATTERN.replace_all(input, NoExpand(docker_repo.as_bytes()));

    let output = NAMESPACE_PATTERN.replace_all(&output, |caps: &Captures<'_>| {
        let lead = caps.name("lead").map(|m| m.as_bytes()).unwrap_or_default();
        let trail = caps.name("trail").map(|m| m.as_bytes()).unwrap_or_default();

        let mut line = Vec::with_capacity(lead.len() + namespace.len() + 16);
        line.extend_from_slice(lead);
        line.extend_from_slice(b"namespace: ");
        line.extend_from_slice(namespace.as_bytes());
        line.extend_from_slice(trail);
        line
    });

    Ok(output.into_owned())
}
