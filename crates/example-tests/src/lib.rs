//! Tekton Example Manifest Test Suite
//!
//! This crate runs every example manifest in the repository against a live
//! Tekton installation. Each manifest is applied into a namespace of its own,
//! the TaskRun or PipelineRun it creates is waited on, and the namespace is
//! torn down afterwards however the case ends.
//!
//! # Features
//!
//! - `examples`: Run every example manifest (up to 10min per case)
//! - `e2e`: Scenario tests that build their own fixtures (cluster resource)
//! - `all`: Enable all test categories
//!
//! # Prerequisites
//!
//! 1. A cluster with Tekton Pipelines installed, selected by the current kubeconfig context
//! 2. `ko` in PATH (or `EXAMPLES_APPLY_TOOL=kubectl` for manifests without `ko://` images)
//! 3. `KO_DOCKER_REPO` pointing at a registry the cluster can pull from
//!
//! Cases whose manifests cannot be substituted (no `KO_DOCKER_REPO`) are
//! skipped, not failed.
//!
//! # Usage
//!
//! ```bash
//! # From repo root - unit tests and mocked harness flows only
//! cargo test
//!
//! # All example manifests
//! KO_DOCKER_REPO=registry.local:5000 cargo test -p example-tests --features examples
//!
//! # Leave slow examples out
//! TEST_EXAMPLES_IGNORES='pipelineruns/(conditional|workspaces)' \
//!     cargo test -p example-tests --features examples
//!
//! # Everything
//! cargo test -p example-tests --features all
//! ```

pub mod cluster;
pub mod config;
pub mod deploy;
pub mod enumerate;
pub mod error;
pub mod extract;
pub mod lifecycle;
pub mod logging;
pub mod orchestrator;
pub mod resource;
pub mod substitute;
pub mod wait;

pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use orchestrator::{CaseReport, Harness, RunSummary, TestCase};
