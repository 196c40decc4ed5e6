//! Created-resource extraction from apply output.
//!
//! `ko create` (like `kubectl create`) reports each object it creates on its
//! own line, `<kind>.<group>/<name> created`, interleaved with build logs.
//! The harness has no structured channel back from the tool, so creation
//! records are recovered from that text.

use crate::error::{HarnessError, Result};
use crate::resource::{ResourceKind, TEKTON_GROUP};
use regex::Regex;
use std::sync::LazyLock;

/// Longest name the API server accepts (DNS subdomain).
const MAX_NAME_LEN: usize = 253;

/// A creation line. The name is taken as printed and validated separately,
/// so a malformed name is still recognised as a creation of its kind.
#[allow(clippy::expect_used)] // ADR-0002: pattern is a compile-time constant
static CREATED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<kind>[a-z0-9]+)\.(?P<group>[a-z0-9][a-z0-9.-]*)/(?P<name>.*) created$")
        .expect("creation line pattern is valid")
});

/// Kubernetes object name (DNS subdomain).
#[allow(clippy::expect_used)] // ADR-0002: pattern is a compile-time constant
static OBJECT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").expect("object name pattern is valid")
});

#[allow(clippy::expect_used)] // ADR-0002: pattern is a compile-time constant
static KIND_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+$").expect("kind pattern is valid"));

/// One object reported as created by the apply tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedResource {
    /// Lowercase kind, e.g. `taskrun`.
    pub kind: String,
    /// API group, e.g. `tekton.dev`.
    pub group: String,
    /// Name as printed; may be malformed.
    pub name: String,
}

impl CreatedResource {
    /// Whether `name` is one the API server could have created.
    pub fn has_valid_name(&self) -> bool {
        self.name.len() <= MAX_NAME_LEN && OBJECT_NAME.is_match(&self.name)
    }

    fn is_tekton(&self, kind: &str) -> bool {
        self.kind == kind && self.group == TEKTON_GROUP
    }
}

/// Every creation record in `output`, in output order.
///
/// Lines without the `<kind>.<group>/<name> created` shape are ignored
/// (build logs, `configured`/`unchanged` lines, core objects without a
/// group). Names are not validated here.
pub fn parse_created(output: &[u8]) -> Vec<CreatedResource> {
    String::from_utf8_lossy(output)
        .lines()
        .filter_map(|line| {
            let caps = CREATED_LINE.captures(line.trim())?;
            Some(CreatedResource {
                kind: caps.name("kind")?.as_str().to_string(),
                group: caps.name("group")?.as_str().to_string(),
                name: caps.name("name")?.as_str().to_string(),
            })
        })
        .collect()
}

/// Names of every `tekton.dev` object of `kind` reported as created.
///
/// Returns `ExtractionAmbiguous` when a creation line for `kind` carries a
/// name that is not a valid object name.
pub fn created_names(output: &[u8], kind: &str) -> Result<Vec<String>> {
    if !KIND_TOKEN.is_match(kind) {
        return Err(HarnessError::ExtractionAmbiguous(format!(
            "invalid resource kind {:?}",
            kind
        )));
    }

    parse_created(output)
        .into_iter()
        .filter(|record| record.is_tekton(kind))
        .map(|record| {
            if record.has_valid_name() {
                Ok(record.name)
            } else {
                Err(HarnessError::ExtractionAmbiguous(format!(
                    "malformed {} creation line: invalid name {:?}",
                    kind, record.name
                )))
            }
        })
        .collect()
}

/// Name of the first `tekton.dev` object of `kind` reported as created.
///
/// `Ok(None)` means the output holds no creation line for `kind`; that is
/// not an error.
pub fn created_resource_name(output: &[u8], kind: &str) -> Result<Option<String>> {
    Ok(created_names(output, kind)?.into_iter().next())
}

/// Name of the single primary resource of `kind`.
///
/// More than one distinct name is `ExtractionAmbiguous`: the harness would
/// not know which run to wait for.
pub fn primary_resource(output: &[u8], kind: ResourceKind) -> Result<Option<String>> {
    let mut names = created_names(output, kind.as_str())?;
    names.dedup();
    match names.len() {
        0 => Ok(None),
        1 => Ok(names.pop()),
        n => Err(HarnessError::ExtractionAmbiguous(format!(
            "expected one {} to be created, found {}: {}",
            kind,
            n,
            names.join(", ")
        ))),
    }
}
