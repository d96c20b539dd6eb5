//! Classifier Invoker
//!
//! Runs the external classification program as
//! `program [args...] <stored-path>` and captures stdout and stderr together,
//! in arrival order, as one byte sequence.
//!
//! Every invocation is bounded by a deadline. The child is spawned with
//! kill-on-drop, so when the request future is dropped (client went away) the
//! process is terminated with it.

use dfd_common::config::ClassifierConfig;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Classifier Invoker errors
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Stored file vanished before the classifier could be started
    #[error("classification target missing: {}", .0.display())]
    MissingTarget(PathBuf),

    /// Executable missing, not executable, or spawn failed
    #[error("error running deepfake detection: cannot launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Process finished with a non-zero status
    #[error(
        "error running deepfake detection: {} - output: {}",
        describe_exit(.exit_code),
        String::from_utf8_lossy(.output)
    )]
    Failed {
        exit_code: Option<i32>,
        output: Vec<u8>,
    },

    /// Deadline elapsed; the process was killed
    #[error("classifier timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    /// Reading the output pipes or waiting on the child failed
    #[error("error capturing classifier output: {0}")]
    Capture(#[source] io::Error),
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Result of running the classifier once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationInvocation {
    pub target_path: PathBuf,
    /// Combined stdout/stderr
    pub raw_output: Vec<u8>,
    pub exit_succeeded: bool,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl ClassificationInvocation {
    /// Turn a non-zero exit into [`ClassifierError::Failed`]
    pub fn require_success(self) -> Result<Self, ClassifierError> {
        if self.exit_succeeded {
            Ok(self)
        } else {
            Err(ClassifierError::Failed {
                exit_code: self.exit_code,
                output: self.raw_output,
            })
        }
    }
}

/// Launches the external classifier
#[derive(Debug, Clone)]
pub struct ProcessClassifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessClassifier {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone(), config.timeout)
    }

    /// Run the classifier and require exit status 0
    pub async fn classify(&self, target: &Path) -> Result<ClassificationInvocation, ClassifierError> {
        self.run(target).await?.require_success()
    }

    /// Run the classifier once against `target`, whatever its exit status
    pub async fn run(&self, target: &Path) -> Result<ClassificationInvocation, ClassifierError> {
        let target_is_file = tokio::fs::metadata(target)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false);
        if !target_is_file {
            return Err(ClassifierError::MissingTarget(target.to_path_buf()));
        }

        debug!(
            program = %self.program,
            args = ?self.args,
            target = %target.display(),
            "Launching classifier"
        );

        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ClassifierError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = tokio::time::timeout(self.timeout, async {
            let output = read_combined(stdout, stderr).await?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((output, status))
        })
        .await;

        let (raw_output, status) = match outcome {
            Ok(Ok(finished)) => finished,
            Ok(Err(e)) => return Err(ClassifierError::Capture(e)),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out classifier: {}", e);
                }
                warn!(
                    target = %target.display(),
                    timeout_secs = self.timeout.as_secs(),
                    "Classifier exceeded its deadline"
                );
                return Err(ClassifierError::TimedOut(self.timeout));
            }
        };

        info!(
            target = %target.display(),
            exit_succeeded = status.success(),
            exit_code = ?status.code(),
            output_bytes = raw_output.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classifier finished"
        );

        Ok(ClassificationInvocation {
            target_path: target.to_path_buf(),
            raw_output,
            exit_succeeded: status.success(),
            exit_code: status.code(),
        })
    }
}

/// Read both pipes to EOF, appending chunks to one buffer as they arrive
async fn read_combined<O, E>(mut stdout: Option<O>, mut stderr: Option<E>) -> io::Result<Vec<u8>>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut combined = Vec::new();
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => {
                match read? {
                    0 => stdout = None,
                    n => combined.extend_from_slice(&out_buf[..n]),
                }
            }
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => {
                match read? {
                    0 => stderr = None,
                    n => combined.extend_from_slice(&err_buf[..n]),
                }
            }
            else => break,
        }
    }

    Ok(combined)
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}
