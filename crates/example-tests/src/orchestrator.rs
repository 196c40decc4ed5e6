//! Test orchestration.
//!
//! Turns discovered manifests into cases and runs each one in its own
//! namespace:
//!
//! read -> substitute -> deploy -> extract -> wait
//!
//! Every case is an independent tokio task. A case can pass, fail, skip or be
//! interrupted, but it can never abort another case.

use crate::cluster::{ClusterOps, KubeCluster};
use crate::config::HarnessConfig;
use crate::deploy::{CommandDeployer, Deployer};
use crate::enumerate::{manifest_paths, test_name};
use crate::error::{HarnessError, Result};
use crate::extract::{created_names, primary_resource};
use crate::lifecycle::{panic_message, CaseOutcome, CaseScope, Interrupt, NamespaceCoordinator};
use crate::resource::{ResourceKind, ResourceRef};
use crate::substitute::substitute_env;
use crate::wait::{predicate_for, wait_for_state, WaitPolicy};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

/// Path component marking TaskRun examples.
const TASK_RUNS_DIR: &str = "taskruns";

/// One manifest to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub manifest: PathBuf,
    /// Kind of the run the case waits for.
    pub kind: ResourceKind,
}

impl TestCase {
    /// Examples under a `taskruns` directory wait for a TaskRun; all others
    /// wait for a PipelineRun.
    pub fn from_path(root: &Path, manifest: PathBuf) -> Self {
        let kind = if manifest.components().any(|c| c.as_os_str() == TASK_RUNS_DIR) {
            ResourceKind::TaskRun
        } else {
            ResourceKind::PipelineRun
        };

        Self {
            name: test_name(root, &manifest),
            manifest,
            kind,
        }
    }
}

/// Result of one case.
#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    pub manifest: PathBuf,
    pub outcome: CaseOutcome,
    pub elapsed: Duration,
}

/// Results of a whole run, sorted by case name.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<CaseReport>,
}

impl RunSummary {
    fn count(&self, matches: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| matches(&r.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(CaseOutcome::is_failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Skipped(_)))
    }

    pub fn interrupted(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Interrupted))
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseReport> {
        self.reports.iter().filter(|r| r.outcome.is_failed())
    }

    /// No case failed and none was interrupted.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.interrupted() == 0
    }

    pub fn report(&self, name: &str) -> Option<&CaseReport> {
        self.reports.iter().find(|r| r.name == name)
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} skipped, {} interrupted",
            self.passed(),
            self.failed(),
            self.skipped(),
            self.interrupted()
        )?;
        for report in self.failures() {
            if let CaseOutcome::Failed(reason) = &report.outcome {
                write!(f, "\n  {}: {}", report.name, reason)?;
            }
        }
        Ok(())
    }
}

/// Runs example cases against a cluster.
pub struct Harness {
    config: Arc<HarnessConfig>,
    cluster: Arc<dyn ClusterOps>,
    deployer: Arc<dyn Deployer>,
    coordinator: NamespaceCoordinator,
}

impl Harness {
    pub fn new(
        config: HarnessConfig,
        cluster: Arc<dyn ClusterOps>,
        deployer: Arc<dyn Deployer>,
        interrupt: Interrupt,
    ) -> Self {
        let coordinator =
            NamespaceCoordinator::new(Arc::clone(&cluster), interrupt, config.namespace_prefix.clone());
        Self {
            config: Arc::new(config),
            cluster,
            deployer,
            coordinator,
        }
    }

    /// Connect to the current kubeconfig's cluster and apply with the
    /// configured tool.
    pub async fn connect(config: HarnessConfig, interrupt: Interrupt) -> Result<Self> {
        let cluster = KubeCluster::connect(config.tekton_api_version.clone()).await?;
        let deployer =
            CommandDeployer::create(config.apply_tool.clone()).with_timeout(config.deploy_timeout);
        Ok(Self::new(config, Arc::new(cluster), Arc::new(deployer), interrupt))
    }

    pub fn interrupt(&self) -> &Interrupt {
        self.coordinator.interrupt()
    }

    fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            interval: self.config.poll_interval,
            timeout: self.config.wait_timeout,
        }
    }

    /// Every runnable case under the configured examples directory.
    pub fn discover(&self) -> Result<Vec<TestCase>> {
        let root = &self.config.examples_dir;
        let paths = manifest_paths(root, self.config.ignore_pattern.as_ref())?;
        Ok(paths
            .into_iter()
            .map(|path| TestCase::from_path(root, path))
            .collect())
    }

    /// Run one case in a namespace of its own.
    #[instrument(skip_all, fields(case = %case.name))]
    pub async fn run_case(&self, case: &TestCase) -> CaseReport {
        let start = Instant::now();
        let outcome = self
            .coordinator
            .run_case(&case.name, |scope| self.execute(case, scope))
            .await;
        let elapsed = start.elapsed();

        let manifest = case.manifest.display();
        match &outcome {
            CaseOutcome::Passed => info!(manifest = %manifest, elapsed = ?elapsed, "Case passed"),
            CaseOutcome::Failed(reason) => {
                error!(manifest = %manifest, elapsed = ?elapsed, reason = %reason, "Case failed")
            }
            CaseOutcome::Skipped(reason) => info!(manifest = %manifest, reason = %reason, "Case skipped"),
            CaseOutcome::Interrupted => warn!(manifest = %manifest, "Case interrupted"),
        }

        CaseReport {
            name: case.name.clone(),
            manifest: case.manifest.clone(),
            outcome,
            elapsed,
        }
    }

    async fn execute(&self, case: &TestCase, scope: CaseScope) -> CaseOutcome {
        match self.try_execute(case, &scope).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_skip() => {
                CaseOutcome::Skipped(format!("Couldn't substitute environment: {}", e))
            }
            Err(e) => CaseOutcome::Failed(e.to_string()),
        }
    }

    async fn try_execute(&self, case: &TestCase, scope: &CaseScope) -> Result<CaseOutcome> {
        let namespace = scope.namespace();

        let manifest = tokio::fs::read(&case.manifest)
            .await
            .map_err(|source| HarnessError::ManifestRead {
                path: case.manifest.clone(),
                source,
            })?;

        let manifest = substitute_env(&manifest, self.config.docker_repo.as_deref(), namespace)?;

        let output = self.deployer.deploy(&manifest, namespace).await?;

        // ClusterTasks outlive the namespace, so each one gets its own cleanup.
        for name in created_names(&output.output, ResourceKind::ClusterTask.as_str())? {
            let cluster = Arc::clone(&self.cluster);
            let resource = ResourceRef::new(ResourceKind::ClusterTask, name, namespace);
            scope.register_cleanup(format!("delete {}", resource), move || async move {
                info!(resource = %resource, "Deleting clustertask");
                cluster.delete_resource(&resource).await
            });
        }

        let Some(name) = primary_resource(&output.output, case.kind)? else {
            // Some examples only define Tasks or Pipelines.
            return Ok(CaseOutcome::Skipped(format!(
                "{} not created for {}",
                case.kind,
                case.manifest.display()
            )));
        };

        let resource = ResourceRef::new(case.kind, name, namespace);
        let policy = self.wait_policy();
        info!(resource = %resource, "Waiting for run to finish");

        wait_for_state(&*self.cluster, &resource, predicate_for(case.kind), policy)
            .await?
            .into_result(&resource, policy.timeout)?;

        Ok(CaseOutcome::Passed)
    }

    /// Run every case concurrently, at most `max_parallel` at a time.
    pub async fn run_all(self: &Arc<Self>, cases: Vec<TestCase>) -> RunSummary {
        let limit = self
            .config
            .max_parallel
            .map(|n| Arc::new(Semaphore::new(n.min(Semaphore::MAX_PERMITS))));
        let mut tasks = JoinSet::new();

        info!(cases = cases.len(), max_parallel = ?self.config.max_parallel, "Running examples");

        let mut expected: BTreeMap<String, PathBuf> = BTreeMap::new();
        for case in cases {
            expected.insert(case.name.clone(), case.manifest.clone());
            let harness = Arc::clone(self);
            let limit = limit.clone();
            tasks.spawn(async move {
                let _permit = match limit {
                    Some(limit) => limit.acquire_owned().await.ok(),
                    None => None,
                };
                let start = Instant::now();
                let result = AssertUnwindSafe(harness.run_case(&case)).catch_unwind().await;
                match result {
                    Ok(report) => report,
                    Err(panic) => {
                        let reason = format!("case task did not complete: {}", panic_message(&*panic));
                        error!(case = %case.name, reason = %reason, "Case failed");
                        CaseReport {
                            name: case.name,
                            manifest: case.manifest,
                            outcome: CaseOutcome::Failed(reason),
                            elapsed: start.elapsed(),
                        }
                    }
                }
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    expected.remove(&report.name);
                    reports.push(report);
                }
                Err(e) => error!(error = %e, "Case task did not complete"),
            }
        }

        // A task that never produced a report still counts as a failed case.
        for (name, manifest) in expected {
            reports.push(CaseReport {
                name,
                manifest,
                outcome: CaseOutcome::Failed("case task did not complete".to_string()),
                elapsed: Duration::ZERO,
            });
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));

        let summary = RunSummary { reports };
        info!(
            passed = summary.passed(),
            failed = summary.failed(),
            skipped = summary.skipped(),
            interrupted = summary.interrupted(),
            "Run finished"
        );
        summary
    }
}
