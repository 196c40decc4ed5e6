//! Tekton resource kinds, references and observed status.

use kube::core::{ApiResource, GroupVersionKind};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// API group of every resource the harness tracks.
pub const TEKTON_GROUP: &str = "tekton.dev";

/// Condition type Tekton uses to report completion.
pub const SUCCEEDED_CONDITION: &str = "Succeeded";

/// Tekton resource kinds the harness creates, tracks or cleans up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Single unit of work.
    TaskRun,
    /// Orchestrated multi-step unit of work.
    PipelineRun,
    /// Cluster-scoped Task; created incidentally by some examples.
    ClusterTask,
    Task,
    Pipeline,
    PipelineResource,
}

impl ResourceKind {
    /// Lowercase name as printed by `kubectl`/`ko` (`taskrun.tekton.dev/...`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::TaskRun => "taskrun",
            ResourceKind::PipelineRun => "pipelinerun",
            ResourceKind::ClusterTask => "clustertask",
            ResourceKind::Task => "task",
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::PipelineResource => "pipelineresource",
        }
    }

    /// CamelCase kind as used in the API.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::TaskRun => "TaskRun",
            ResourceKind::PipelineRun => "PipelineRun",
            ResourceKind::ClusterTask => "ClusterTask",
            ResourceKind::Task => "Task",
            ResourceKind::Pipeline => "Pipeline",
            ResourceKind::PipelineResource => "PipelineResource",
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ResourceKind::ClusterTask)
    }

    /// Dynamic API descriptor for this kind at the given `tekton.dev` version.
    pub fn api_resource(&self, version: &str) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(TEKTON_GROUP, version, self.kind()))
    }

    /// Kinds dumped for diagnostics when a case fails.
    pub fn namespaced_kinds() -> [ResourceKind; 5] {
        [
            ResourceKind::PipelineResource,
            ResourceKind::Task,
            ResourceKind::Pipeline,
            ResourceKind::TaskRun,
            ResourceKind::PipelineRun,
        ]
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named resource in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>, namespace: &str) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: kind.is_namespaced().then(|| namespace.to_string()),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.kind, TEKTON_GROUP, self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, " (namespace {})", namespace)?;
        }
        Ok(())
    }
}

/// One entry of `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Status of a child TaskRun embedded in a PipelineRun status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRunStatus {
    #[serde(default)]
    pub pipeline_task_name: Option<String>,
    #[serde(default)]
    pub status: Option<ResourceStatus>,
}

/// The observed `status` stanza of a TaskRun or PipelineRun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Embedded child TaskRun statuses (PipelineRuns, older API versions).
    #[serde(default)]
    pub task_runs: BTreeMap<String, ChildRunStatus>,

    /// Child references (PipelineRuns, newer API versions).
    #[serde(default)]
    pub child_references: Vec<serde_json::Value>,
}

/// Classification of one status observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No completion condition reported yet.
    Pending,
    /// Completion condition is `Unknown`.
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "Pending",
            RunState::Running => "Running",
            RunState::Succeeded => "Succeeded",
            RunState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

impl ResourceStatus {
    /// Parse the `status` field of an object's non-metadata data.
    ///
    /// A missing or null `status` is an empty status (not yet reconciled).
    pub fn from_object(data: &serde_json::Value) -> Result<Self, serde_json::Error> {
        match data.get("status") {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(status) => Self::deserialize(status),
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn succeeded_condition(&self) -> Option<&Condition> {
        self.condition(SUCCEEDED_CONDITION)
    }

    /// State derived from the `Succeeded` condition.
    pub fn run_state(&self) -> RunState {
        match self.succeeded_condition().map(|c| c.status.as_str()) {
            None => RunState::Pending,
            Some("True") => RunState::Succeeded,
            Some("False") => RunState::Failed,
            Some(_) => RunState::Running,
        }
    }

    /// `(finished, total)` child TaskRuns, when the status reports any.
    pub fn child_progress(&self) -> Option<(usize, usize)> {
        if !self.task_runs.is_empty() {
            let finished = self
                .task_runs
                .values()
                .filter(|child| {
                    child
                        .status
                        .as_ref()
                        .is_some_and(|status| status.run_state().is_terminal())
                })
                .count();
            return Some((finished, self.task_runs.len()));
        }
        None
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.succeeded_condition() {
            None => f.write_str("no Succeeded condition reported")?,
            Some(condition) => {
                write!(f, "Succeeded={}", condition.status)?;
                match (&condition.reason, &condition.message) {
                    (Some(reason), Some(message)) => write!(f, " ({}: {})", reason, message)?,
                    (Some(reason), None) => write!(f, " ({})", reason)?,
                    (None, Some(message)) => write!(f, " ({})", message)?,
                    (None, None) => {}
                }
            }
        }
        if let Some((finished, total)) = self.child_progress() {
            write!(f, " [{}/{} TaskRuns finished]", finished, total)?;
        } else if !self.child_references.is_empty() {
            write!(f, " [{} child runs]", self.child_references.len())?;
        }
        Ok(())
    }
}
