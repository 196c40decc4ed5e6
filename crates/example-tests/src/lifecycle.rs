//! Namespace lifecycle coordination.
//!
//! Every case runs in a namespace of its own. The coordinator creates it,
//! registers its deletion as the case's first cleanup, and guarantees the
//! case's cleanups run exactly once whether the body passes, fails, panics,
//! or the process is interrupted.
//!
//! # Interrupts
//!
//! `Interrupt` is a process-wide cancellation broadcast. Each running case
//! races its body against it; on cancellation the body is dropped and the
//! case runs its own pending cleanups. Cases that have not started yet never
//! provision a namespace.

use crate::cluster::ClusterOps;
use crate::error::{HarnessError, Result};
use crate::wait::poll_until;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// ServiceAccount the apply tool's objects run as by default.
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// How long to wait for the namespace's default ServiceAccount.
const SERVICE_ACCOUNT_TIMEOUT: Duration = Duration::from_secs(60);

const SERVICE_ACCOUNT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Length of the random namespace suffix.
const NAMESPACE_SUFFIX_LEN: usize = 8;

/// Result of one case as reported to the test runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed(String),
    Skipped(String),
    /// The process was interrupted while (or before) the case ran.
    Interrupted,
}

impl CaseOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CaseOutcome::Failed(_))
    }
}

/// Process-wide interrupt broadcast.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    token: CancellationToken,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task that triggers the broadcast on SIGINT or SIGTERM.
    pub fn listen(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    warn!("Interrupted, running pending cleanups for all cases");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }

    /// Trigger the broadcast.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the broadcast has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct ScopeInner {
    namespace: String,
    cleanups: Mutex<Vec<(String, Cleanup)>>,
}

/// A provisioned namespace and the cleanups owed for it.
///
/// Cheap to clone; all clones share one cleanup list.
#[derive(Clone)]
pub struct CaseScope {
    inner: Arc<ScopeInner>,
}

impl std::fmt::Debug for CaseScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseScope")
            .field("namespace", &self.inner.namespace)
            .field("pending_cleanups", &self.pending_cleanups())
            .finish()
    }
}

impl CaseScope {
    /// A scope for an already existing namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                namespace: namespace.into(),
                cleanups: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    fn cleanups(&self) -> MutexGuard<'_, Vec<(String, Cleanup)>> {
        self.inner
            .cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `cleanup` to run when the case ends, however it ends.
    ///
    /// Cleanups run in reverse registration order.
    pub fn register_cleanup<F, Fut>(&self, label: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: Cleanup = Box::new(move || cleanup().boxed());
        self.cleanups().push((label.into(), boxed));
    }

    pub fn pending_cleanups(&self) -> usize {
        self.cleanups().len()
    }

    /// Run and discard every pending cleanup.
    ///
    /// Failures and panics are logged and do not stop later cleanups. Returns
    /// the number of cleanups that failed.
    pub async fn run_cleanups(&self) -> usize {
        let pending = std::mem::take(&mut *self.cleanups());
        let mut failures = 0;

        for (label, cleanup) in pending.into_iter().rev() {
            let result = AssertUnwindSafe(async move { cleanup().await })
                .catch_unwind()
                .await;
            let message = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panicked: {}", panic_message(&*panic)),
            };
            failures += 1;
            let failure = HarnessError::CleanupFailure { label, message };
            warn!(namespace = %self.namespace(), error = %failure, "Cleanup failed");
        }

        failures
    }
}

/// Provisions per-case namespaces and runs cases inside them.
#[derive(Clone)]
pub struct NamespaceCoordinator {
    cluster: Arc<dyn ClusterOps>,
    interrupt: Interrupt,
    prefix: String,
}

impl NamespaceCoordinator {
    pub fn new(cluster: Arc<dyn ClusterOps>, interrupt: Interrupt, prefix: impl Into<String>) -> Self {
        Self {
            cluster,
            interrupt,
            prefix: prefix.into(),
        }
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// A fresh `<prefix>-<random>` namespace name.
    pub fn namespace_name(&self) -> String {
        let suffix: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(NAMESPACE_SUFFIX_LEN)
            .collect();
        format!("{}-{}", self.prefix, suffix)
    }

    /// Create a namespace and return a scope owning its deletion.
    ///
    /// Creation failure is not retried.
    #[instrument(skip_all)]
    pub async fn provision(&self) -> Result<CaseScope> {
        let namespace = self.namespace_name();
        info!(namespace = %namespace, "Create namespace to run test in");
        self.cluster.create_namespace(&namespace).await?;

        let scope = CaseScope::new(namespace.clone());
        let cluster = Arc::clone(&self.cluster);
        let ns = namespace.clone();
        scope.register_cleanup(format!("delete namespace {}", namespace), move || async move {
            info!(namespace = %ns, "Deleting namespace");
            cluster.delete_namespace(&ns).await
        });

        // Objects created before the controller-manager populates the
        // namespace's default ServiceAccount are rejected.
        let cluster = Arc::clone(&self.cluster);
        let ready = poll_until(SERVICE_ACCOUNT_POLL_INTERVAL, SERVICE_ACCOUNT_TIMEOUT, || {
            let cluster = Arc::clone(&cluster);
            let ns = namespace.clone();
            async move { cluster.service_account_exists(&ns, DEFAULT_SERVICE_ACCOUNT).await }
        })
        .await;

        match ready {
            Ok(true) => Ok(scope),
            Ok(false) => {
                scope.run_cleanups().await;
                Err(HarnessError::Cluster(format!(
                    "Timed out waiting for the {} service account in namespace {}",
                    DEFAULT_SERVICE_ACCOUNT, namespace
                )))
            }
            Err(e) => {
                scope.run_cleanups().await;
                Err(e)
            }
        }
    }

    /// Run `body` in a freshly provisioned namespace.
    ///
    /// The body races the interrupt broadcast. Whatever happens, the scope's
    /// cleanups run exactly once before this returns. A failed case has its
    /// namespace's Tekton objects logged before the namespace is deleted.
    pub async fn run_case<F, Fut>(&self, case: &str, body: F) -> CaseOutcome
    where
        F: FnOnce(CaseScope) -> Fut,
        Fut: Future<Output = CaseOutcome> + Send,
    {
        if self.interrupt.is_triggered() {
            return CaseOutcome::Interrupted;
        }

        let scope = match self.provision().await {
            Ok(scope) => scope,
            Err(e) => {
                error!(case = %case, error = %e, "Failed to provision namespace");
                return CaseOutcome::Failed(e.to_string());
            }
        };

        let body = AssertUnwindSafe(body(scope.clone())).catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = self.interrupt.triggered() => {
                warn!(case = %case, namespace = %scope.namespace(), "Case interrupted");
                CaseOutcome::Interrupted
            }
            result = body => match result {
                Ok(outcome) => outcome,
                Err(panic) => CaseOutcome::Failed(format!("case panicked: {}", panic_message(&*panic))),
            },
        };

        if outcome.is_failed() {
            self.dump_diagnostics(case, scope.namespace()).await;
        }

        scope.run_cleanups().await;
        outcome
    }

    async fn dump_diagnostics(&self, case: &str, namespace: &str) {
        match self.cluster.dump_namespace(namespace).await {
            Ok(dump) if dump.is_empty() => {}
            Ok(dump) => info!(case = %case, namespace = %namespace, "Tekton objects at failure:\n{}", dump),
            Err(e) => warn!(case = %case, namespace = %namespace, error = %e, "Failed to dump namespace"),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
