//! Deployment invocation.
//!
//! Manifests are applied by an external tool (`ko create` by default, which
//! builds any `ko://` image references before handing the result to the API
//! server). The tool is opaque: the harness feeds it the manifest on stdin and
//! keeps whatever it prints for extraction and diagnostics.

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

/// Combined output of a successful apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOutput {
    /// stdout and stderr merged line by line in arrival order.
    pub output: Vec<u8>,
}

impl DeployOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Applies a manifest to a namespace.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Apply `manifest` into `namespace`.
    ///
    /// A non-zero exit is `DeploymentFailed` carrying the captured output.
    /// Implementations never retry.
    async fn deploy(&self, manifest: &[u8], namespace: &str) -> Result<DeployOutput>;
}

/// Runs `<program> <base_args...> -n <namespace> -f -`.
#[derive(Debug, Clone)]
pub struct CommandDeployer {
    program: String,
    base_args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandDeployer {
    /// `<program> create -n <namespace> -f -`, e.g. `ko` or `kubectl`.
    pub fn create(program: impl Into<String>) -> Self {
        Self::new(program, vec!["create".to_string()])
    }

    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
            timeout: None,
        }
    }

    /// Kill the tool and fail with `DeploymentTimedOut` after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, namespace: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(["-n", namespace, "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Deployer for CommandDeployer {
    #[instrument(skip_all, fields(program = %self.program, namespace = %namespace))]
    async fn deploy(&self, manifest: &[u8], namespace: &str) -> Result<DeployOutput> {
        let mut child = self
            .command(namespace)
            .spawn()
            .map_err(|source| HarnessError::DeployerUnavailable {
                program: self.program.clone(),
                source,
            })?;

        let mut output = Vec::new();
        let run = run_to_completion(&mut child, manifest, &mut output);

        let finished = match self.timeout {
            None => Some(run.await),
            Some(timeout) => tokio::time::timeout(timeout, run).await.ok(),
        };

        let Some(status) = finished else {
            let timeout = self.timeout.unwrap_or_default();
            warn!(timeout = ?timeout, "Apply tool did not exit in time, killing it");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill apply tool");
            }
            return Err(HarnessError::DeploymentTimedOut {
                timeout,
                output: String::from_utf8_lossy(&output).into_owned(),
            });
        };

        let status = status.map_err(|source| HarnessError::DeployerUnavailable {
            program: self.program.clone(),
            source,
        })?;

        debug!(status = %status, bytes = output.len(), "Apply tool exited");

        if !status.success() {
            return Err(HarnessError::DeploymentFailed {
                status: status.to_string(),
                output: String::from_utf8_lossy(&output).into_owned(),
            });
        }

        Ok(DeployOutput { output })
    }
}

/// Feed `manifest` to the child, collect its merged output and wait for exit.
async fn run_to_completion(
    child: &mut Child,
    manifest: &[u8],
    output: &mut Vec<u8>,
) -> std::io::Result<std::process::ExitStatus> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let feed = async {
        if let Some(mut stdin) = stdin {
            // A tool that exits without reading stdin closes the pipe early;
            // its exit status is what matters.
            if let Err(e) = stdin.write_all(manifest).await {
                debug!(error = %e, "Apply tool closed stdin early");
            }
            // dropping stdin sends EOF
        }
    };

    let (_, merged) = tokio::join!(feed, merge_lines(stdout, stderr, output));
    merged?;

    child.wait().await
}

/// Read both streams concurrently, appending whole lines to `output` as they
/// arrive.
async fn merge_lines<A, B>(stdout: Option<A>, stderr: Option<B>, output: &mut Vec<u8>) -> std::io::Result<()>
where
    A: AsyncRead + Unpin,
    B: AsyncRead + Unpin,
{
    let mut out = stdout.map(BufReader::new);
    let mut err = stderr.map(BufReader::new);
    // Partial lines survive select! cancellation in these buffers.
    let mut out_line = Vec::new();
    let mut err_line = Vec::new();

    loop {
        tokio::select! {
            read = read_line(&mut out, &mut out_line), if out.is_some() => {
                let n = read?;
                output.append(&mut out_line);
                if n == 0 {
                    out = None;
                }
            }
            read = read_line(&mut err, &mut err_line), if err.is_some() => {
                let n = read?;
                output.append(&mut err_line);
                if n == 0 {
                    err = None;
                }
            }
            else => break,
        }
    }

    Ok(())
}

async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut Option<BufReader<R>>,
    line: &mut Vec<u8>,
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read_until(b'\n', line).await,
        None => Ok(0),
    }
}

/// Mock deployer module for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// Mock deployer for unit testing.
    pub struct MockDeployer {
        output: String,
        fail: bool,
        calls: AtomicUsize,
        last_manifest: Mutex<Option<Vec<u8>>>,
    }

    impl MockDeployer {
        /// Create a mock that succeeds and prints `output`.
        pub fn printing(output: &str) -> Self {
            Self {
                output: output.to_string(),
                fail: false,
                calls: AtomicUsize::new(0),
                last_manifest: Mutex::new(None),
            }
        }

        /// Create a mock that exits non-zero after printing `output`.
        pub fn failing(output: &str) -> Self {
            Self {
                fail: true,
                ..Self::printing(output)
            }
        }

        /// Get the number of calls made.
        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// The manifest passed to the most recent call.
        pub fn last_manifest(&self) -> Option<Vec<u8>> {
            self.last_manifest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl Deployer for MockDeployer {
        async fn deploy(&self, manifest: &[u8], _namespace: &str) -> Result<DeployOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self
                .last_manifest
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(manifest.to_vec());

            if self.fail {
                return Err(HarnessError::DeploymentFailed {
                    status: "exit status: 1".to_string(),
                    output: self.output.clone(),
                });
            }
            Ok(DeployOutput {
                output: self.output.clone().into_bytes(),
            })
        }
    }
}
