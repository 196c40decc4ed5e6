//! State-wait engine.
//!
//! Polls a Tekton run at a fixed interval until its status classifies as
//! terminal or the deadline passes:
//!
//! ```text
//! Pending -> Running -> {Succeeded, Failed}
//!        \__________\__> TimedOut (deadline)
//! ```
//!
//! The first observation is made immediately. A `Failed` observation ends the
//! wait at once rather than running out the clock.

use crate::cluster::ResourceLookup;
use crate::error::{HarnessError, Result};
use crate::resource::{ResourceKind, ResourceRef, ResourceStatus, RunState};
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info};

/// Default interval between observations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline for a run to finish.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// PipelineRun reasons reported while a cancellation or stop winds down.
///
/// The run can no longer succeed once one of these is reported.
const PIPELINE_RUN_STOPPING_REASONS: [&str; 4] = [
    "Cancelled",
    "PipelineRunCancelled",
    "CancelledRunFinally",
    "StoppedRunFinally",
];

/// Polling cadence and deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// Terminal result of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Succeeded(ResourceStatus),
    Failed(ResourceStatus),
    /// Deadline passed; carries the last observation, if any completed.
    TimedOut(Option<ResourceStatus>),
}

impl WaitOutcome {
    /// Map `Failed` to `WaitFailed` and `TimedOut` to `WaitTimedOut`.
    pub fn into_result(self, resource: &ResourceRef, timeout: Duration) -> Result<ResourceStatus> {
        match self {
            WaitOutcome::Succeeded(status) => Ok(status),
            WaitOutcome::Failed(status) => Err(HarnessError::WaitFailed {
                resource: resource.to_string(),
                last_status: status.to_string(),
            }),
            WaitOutcome::TimedOut(last) => Err(HarnessError::WaitTimedOut {
                resource: resource.to_string(),
                timeout,
                last_status: last
                    .map(|status| status.to_string())
                    .unwrap_or_else(|| "never observed".to_string()),
            }),
        }
    }
}

/// Classification of a TaskRun observation: its `Succeeded` condition.
pub fn task_run_state(status: &ResourceStatus) -> RunState {
    status.run_state()
}

/// Classification of a PipelineRun observation.
///
/// Like a TaskRun, plus a PipelineRun that is being cancelled or stopped is
/// already failed even though its condition is still `Unknown`.
pub fn pipeline_run_state(status: &ResourceStatus) -> RunState {
    match status.run_state() {
        RunState::Running
            if status
                .succeeded_condition()
                .and_then(|c| c.reason.as_deref())
                .is_some_and(|reason| PIPELINE_RUN_STOPPING_REASONS.contains(&reason)) =>
        {
            RunState::Failed
        }
        state => state,
    }
}

/// The success predicate bound to `kind`.
pub fn predicate_for(kind: ResourceKind) -> fn(&ResourceStatus) -> RunState {
    match kind {
        ResourceKind::PipelineRun => pipeline_run_state,
        _ => task_run_state,
    }
}

/// Poll `resource` until `predicate` reports a terminal state or the policy
/// deadline passes.
///
/// A lookup error ends the wait with that error. A lookup still in flight at
/// the deadline is abandoned and the wait reports `TimedOut`.
pub async fn wait_for_state<L, P>(
    lookup: &L,
    resource: &ResourceRef,
    predicate: P,
    policy: WaitPolicy,
) -> Result<WaitOutcome>
where
    L: ResourceLookup + ?Sized,
    P: Fn(&ResourceStatus) -> RunState,
{
    let deadline = Instant::now() + policy.timeout;
    let mut last: Option<ResourceStatus> = None;
    let mut state = RunState::Pending;

    loop {
        let status = match timeout_at(deadline, lookup.resource_status(resource)).await {
            Ok(status) => status?,
            Err(_) => break,
        };

        let observed = predicate(&status);
        if observed != state {
            debug!(resource = %resource, from = %state, to = %observed, status = %status, "State changed");
            state = observed;
        }

        match observed {
            RunState::Succeeded => {
                info!(resource = %resource, "Run succeeded");
                return Ok(WaitOutcome::Succeeded(status));
            }
            RunState::Failed => {
                info!(resource = %resource, status = %status, "Run failed");
                return Ok(WaitOutcome::Failed(status));
            }
            RunState::Pending | RunState::Running => last = Some(status),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep(policy.interval.min(deadline - now)).await;
    }

    info!(resource = %resource, timeout = ?policy.timeout, "Run not finished before deadline");
    Ok(WaitOutcome::TimedOut(last))
}

/// Poll `condition` at `interval` until it returns true or `timeout` passes.
///
/// Returns whether the condition was met. Errors from the condition end the
/// poll immediately.
pub async fn poll_until<F, Fut>(interval: Duration, timeout: Duration, mut condition: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if condition().await? {
            return Ok(true);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        sleep(interval.min(deadline - now)).await;
    }
}
