//! Harness Flow Tests
//!
//! Drive whole cases through `Harness` with the in-memory cluster and
//! deployer doubles. No cluster or apply tool is needed, so these run on every
//! `cargo test`.

use async_trait::async_trait;
use example_tests::cluster::mock::{status, MockCluster};
use example_tests::cluster::{ClusterOps, ResourceLookup};
use example_tests::deploy::mock::MockDeployer;
use example_tests::lifecycle::{CaseOutcome, Interrupt};
use example_tests::resource::{ResourceKind, ResourceRef, ResourceStatus};
use example_tests::{Harness, HarnessConfig, Result, TestCase};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const REGISTRY: &str = "registry.local:5000";

const MANIFEST: &str = "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: build-bot
  namespace: default
---
apiVersion: tekton.dev/v1beta1
kind: TaskRun
metadata:
  name: build-push
spec:
  params:
    - name: IMAGE
      value: gcr.io/christiewilson-catfactory/leeroy-web
";

/// Example tree with one manifest per relative path.
fn examples(files: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    for file in files {
        let path = dir.path().join(file);
        fs::create_dir_all(path.parent().expect("manifest has a parent")).expect("mkdir");
        fs::write(&path, MANIFEST).expect("write manifest");
    }
    dir
}

fn config(root: &Path, docker_repo: Option<&str>) -> HarnessConfig {
    let mut vars = HashMap::from([
        ("EXAMPLES_DIR".to_string(), root.display().to_string()),
        ("EXAMPLES_POLL_INTERVAL_MILLIS".to_string(), "10".to_string()),
        ("EXAMPLES_WAIT_TIMEOUT_SECONDS".to_string(), "30".to_string()),
    ]);
    if let Some(repo) = docker_repo {
        vars.insert("KO_DOCKER_REPO".to_string(), repo.to_string());
    }
    HarnessConfig::from_vars(&vars).expect("valid config")
}

fn harness(
    root: &Path,
    docker_repo: Option<&str>,
    cluster: &Arc<MockCluster>,
    deployer: &Arc<MockDeployer>,
) -> Harness {
    Harness::new(
        config(root, docker_repo),
        cluster.clone(),
        deployer.clone(),
        Interrupt::new(),
    )
}

fn case(root: &Path, relative: &str) -> TestCase {
    TestCase::from_path(root, root.join(relative))
}

#[tokio::test]
async fn test_successful_task_run_passes_and_cleans_up() {
    let dir = examples(&["v1beta1/taskruns/build-push.yaml"]);
    let cluster = Arc::new(MockCluster::new().with_statuses(
        "build-push",
        vec![status("Unknown", "Running"), status("True", "Succeeded")],
    ));
    let deployer = Arc::new(MockDeployer::printing(
        "serviceaccount/build-bot created\ntaskrun.tekton.dev/build-push created\n",
    ));
    let harness = harness(dir.path(), Some(REGISTRY), &cluster, &deployer);

    let report = harness
        .run_case(&case(dir.path(), "v1beta1/taskruns/build-push.yaml"))
        .await;

    assert_eq!(report.outcome, CaseOutcome::Passed);
    assert_eq!(report.name, "v1beta1/taskruns/build-push");

    let created = cluster.created_namespaces();
    assert_eq!(created.len(), 1);
    assert_eq!(cluster.deleted_namespaces(), created);
    assert!(cluster.dumped_namespaces().is_empty());

    let applied = String::from_utf8(deployer.last_manifest().expect("manifest applied")).unwrap();
    assert!(applied.contains("value: registry.local:5000/leeroy-web"));
    let namespace = created.first().expect("namespace created");
    assert!(applied.contains(&format!("namespace: {}", namespace)));
    assert!(!applied.contains("namespace: default"));
}

#[tokio::test]
async fn test_manifest_without_run_is_skipped_with_cleanup() {
    let dir = examples(&["v1beta1/taskruns/task-result.yaml"]);
    let cluster = Arc::new(MockCluster::new());
    let deployer = Arc::new(MockDeployer::printing("task.tekton.dev/print-date created\n"));
    let harness = harness(dir.path(), Some(REGISTRY), &cluster, &deployer);

    let report = harness
        .run_case(&case(dir.path(), "v1beta1/taskruns/task-result.yaml"))
        .await;

    match report.outcome {
        CaseOutcome::Skipped(reason) => {
            assert!(reason.starts_with("taskrun not created for"), "{}", reason);
            assert!(reason.contains("task-result.yaml"));
        }
        other => panic!("expected skip, got {:?}", other),
    }
    assert_eq!(cluster.lookup_count(), 0);
    assert_eq!(cluster.deleted_namespaces().len(), 1);
}

#[tokio::test]
async fn test_missing_docker_repo_skips_without_deploying() {
    let dir = examples(&["v1beta1/pipelineruns/demo.yaml"]);
    let cluster = Arc::new(MockCluster::new());
    let deployer = Arc::new(MockDeployer::printing("pipelinerun.tekton.dev/demo created\n"));
    let harness = harness(dir.path(), None, &cluster, &deployer);

    let report = harness
        .run_case(&case(dir.path(), "v1beta1/pipelineruns/demo.yaml"))
        .await;

    assert_eq!(
        report.outcome,
        CaseOutcome::Skipped("Couldn't substitute environment: KO_DOCKER_REPO is not set".to_string())
    );
    assert_eq!(deployer.call_count(), 0);
    assert_eq!(cluster.deleted_namespaces().len(), 1);
}

#[tokio::test]
async fn test_failed_apply_fails_with_tool_output() {
    let dir = examples(&["v1beta1/pipelineruns/broken.yaml"]);
    let cluster = Arc::new(MockCluster::new());
    let deployer = Arc::new(MockDeployer::failing(
        "Error from server (BadRequest): admission webhook denied the request",
    ));
    let harness = harness(dir.path(), Some(REGISTRY), &cluster, &deployer);

    let report = harness
        .run_case(&case(dir.path(), "v1beta1/pipelineruns/broken.yaml"))
        .await;

    match report.outcome {
        CaseOutcome::Failed(reason) => {
            assert!(reason.contains("Output: Error from server (BadRequest)"), "{}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(cluster.dumped_namespaces(), cluster.created_namespaces());
    assert_eq!(cluster.deleted_namespaces().len(), 1);
}

#[tokio::test]
async fn test_failed_pipeline_run_fails_without_waiting_out_deadline() {
    let dir = examples(&["v1beta1/pipelineruns/failing.yaml"]);
    let cluster = Arc::new(MockCluster::new().with_statuses(
        "failing-run",
        vec![status("Unknown", "Running"), status("False", "Failed")],
    ));
    let deployer = Arc::new(MockDeployer::printing("pipelinerun.tekton.dev/failing-run created\n"));
    let harness = harness(dir.path(), Some(REGISTRY), &cluster, &deployer);

    let report = harness
        .run_case(&case(dir.path(), "v1beta1/pipelineruns/failing.yaml"))
        .await;

    match report.outcome {
        CaseOutcome::Failed(reason) => {
            assert!(reason.contains("pipelinerun.tekton.dev/failing-run"), "{}", reason);
            assert!(reason.contains("Succeeded=False"), "{}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(report.elapsed < Duration::from_secs(10));
    assert_eq!(cluster.deleted_namespaces().len(), 1);
}

#[tokio::test]
async fn test_every_created_cluster_task_is_deleted() {
    let dir = examples(&["v1beta1/taskruns/clustertask.yaml"]);
    let cluster = Arc::new(
        MockCluster::new().with_statuses("uses-clustertask", vec![status("True", "Succeeded")]),
    );
    let deployer = Arc::new(MockDeployer::printing(
        "clustertask.tekton.dev/shared-a created\n\
         clustertask.tekton.dev/shared-b created\n\
         taskrun.tekton.dev/uses-clustertask created\n",
    ));
    let harness = harness(dir.path(), Some(REGISTRY), &cluster, &deployer);

    let report = harness
        .run_case(&case(dir.path(), "v1beta1/taskruns/clustertask.yaml"))
        .await;

    assert_eq!(report.outcome, CaseOutcome::Passed);
    let mut deleted = cluster.deleted_resources();
    deleted.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(
        deleted,
        vec![
            ResourceRef::new(ResourceKind::ClusterTask, "shared-a", "ignored"),
            ResourceRef::new(ResourceKind::ClusterTask, "shared-b", "ignored"),
        ]
    );
    assert!(deleted.iter().all(|r| r.namespace.is_none()));
}

#[tokio::test]
async fn test_two_primary_runs_is_a_failure() {
    let dir = examples(&["v1beta1/taskruns/double.yaml"]);
    let cluster = Arc::new(MockCluster::new());
    let deployer = Arc::new(MockDeployer::printing(
        "taskrun.tekton.dev/first created\ntaskrun.tekton.dev/second created\n",
    ));
    let harness = harness(dir.path(), Some(REGISTRY), &cluster, &deployer);

    let report = harness
        .run_case(&case(dir.path(), "v1beta1/taskruns/double.yaml"))
        .await;

    match report.outcome {
        CaseOutcome::Failed(reason) => assert!(reason.contains("found 2: first, second"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(cluster.lookup_count(), 0);
}

#[tokio::test]
async fn test_run_all_discovers_and_summarizes() {
    let dir = examples(&[
        "v1beta1/taskruns/run.yaml",
        "v1beta1/pipelineruns/only-pipeline.yaml",
        "v1beta1/taskruns/no-ci/hangs.yaml",
    ]);
    let cluster = Arc::new(MockCluster::new().with_statuses("run", vec![status("True", "Succeeded")]));
    let deployer = Arc::new(MockDeployer::printing("taskrun.tekton.dev/run created\n"));
    let harness = Arc::new(harness(dir.path(), Some(REGISTRY), &cluster, &deployer));

    let cases = harness.discover().expect("discovery should succeed");
    assert_eq!(cases.len(), 2);

    let summary = harness.run_all(cases).await;

    assert_eq!(summary.passed(), 1);
    assert_eq!(summary.skipped(), 1);
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(
        summary.report("v1beta1/taskruns/run").map(|r| &r.outcome),
        Some(&CaseOutcome::Passed)
    );

    // one namespace per case, every one deleted
    let mut created = cluster.created_namespaces();
    let mut deleted = cluster.deleted_namespaces();
    created.sort();
    deleted.sort();
    assert_eq!(created.len(), 2);
    created.dedup();
    assert_eq!(created.len(), 2, "namespaces must not be shared");
    assert_eq!(created, deleted);
}

#[tokio::test]
async fn test_interrupted_run_provisions_nothing() {
    let dir = examples(&["v1beta1/taskruns/run.yaml"]);
    let cluster = Arc::new(MockCluster::new());
    let deployer = Arc::new(MockDeployer::printing("taskrun.tekton.dev/run created\n"));
    let harness = Arc::new(harness(dir.path(), Some(REGISTRY), &cluster, &deployer));

    harness.interrupt().trigger();
    let cases = harness.discover().expect("discovery should succeed");
    let summary = harness.run_all(cases).await;

    assert_eq!(summary.interrupted(), 1);
    assert!(!summary.is_success());
    assert!(cluster.created_namespaces().is_empty());
    assert_eq!(deployer.call_count(), 0);
}

#[tokio::test]
async fn test_interrupt_during_run_all_deletes_every_namespace_once() {
    let dir = examples(&["v1beta1/taskruns/a.yaml", "v1beta1/taskruns/b.yaml"]);
    // never finishes on its own
    let cluster = Arc::new(MockCluster::new().with_statuses("run", vec![status("Unknown", "Running")]));
    let deployer = Arc::new(MockDeployer::printing("taskrun.tekton.dev/run created\n"));
    let harness = Arc::new(harness(dir.path(), Some(REGISTRY), &cluster, &deployer));

    let interrupt = harness.interrupt().clone();
    let watched = Arc::clone(&cluster);
    let deployed = Arc::clone(&deployer);
    tokio::spawn(async move {
        // both cases provisioned, deployed and polling
        for _ in 0..2000 {
            if watched.created_namespaces().len() == 2
                && deployed.call_count() == 2
                && watched.lookup_count() >= 2
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        interrupt.trigger();
    });

    let cases = harness.discover().expect("discovery should succeed");
    let summary = harness.run_all(cases).await;

    assert_eq!(summary.interrupted(), 2, "{}", summary);
    assert!(!summary.is_success());

    let mut created = cluster.created_namespaces();
    let mut deleted = cluster.deleted_namespaces();
    created.sort();
    deleted.sort();
    assert_eq!(created.len(), 2);
    created.dedup();
    deleted.dedup();
    assert_eq!(created.len(), 2, "namespaces must not be shared");
    assert_eq!(created, deleted);
    assert_eq!(cluster.deleted_namespaces().len(), 2, "each namespace deleted exactly once");
}

/// Cluster whose namespace creation panics outside any case body.
struct PanickingCluster;

#[async_trait]
impl ResourceLookup for PanickingCluster {
    async fn resource_status(&self, _resource: &ResourceRef) -> Result<ResourceStatus> {
        Ok(ResourceStatus::default())
    }
}

#[async_trait]
impl ClusterOps for PanickingCluster {
    async fn create_namespace(&self, _name: &str) -> Result<()> {
        panic!("namespace creation exploded")
    }

    async fn delete_namespace(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn service_account_exists(&self, _namespace: &str, _name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn delete_resource(&self, _resource: &ResourceRef) -> Result<()> {
        Ok(())
    }

    async fn dump_namespace(&self, _namespace: &str) -> Result<String> {
        Ok(String::new())
    }
}

#[tokio::test]
async fn test_case_task_panic_is_reported_as_failure() {
    let dir = examples(&["v1beta1/taskruns/run.yaml"]);
    let deployer = Arc::new(MockDeployer::printing("taskrun.tekton.dev/run created\n"));
    let harness = Arc::new(Harness::new(
        config(dir.path(), Some(REGISTRY)),
        Arc::new(PanickingCluster),
        deployer.clone(),
        Interrupt::new(),
    ));

    let cases = harness.discover().expect("discovery should succeed");
    let summary = harness.run_all(cases).await;

    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.failed(), 1);
    assert!(!summary.is_success());
    match summary.report("v1beta1/taskruns/run").map(|r| &r.outcome) {
        Some(CaseOutcome::Failed(reason)) => {
            assert!(reason.contains("namespace creation exploded"), "{}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(deployer.call_count(), 0);
}
