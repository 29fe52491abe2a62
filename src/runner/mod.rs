//! Spawns and supervises the harness child process for one loop iteration.

mod quoting;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::debug;

use crate::domain::{Profile, PromptMode};

pub use quoting::{render_command, shell_quote, split_command};

/// Resolve a profile's `env` value: `env:<VAR>` is looked up directly in the
/// Forge process's own environment; a `vault:<name>` reference or anything
/// else it cannot resolve is passed through as an opaque literal (Vault
/// resolution is out of scope here).
fn resolve_env_value(value: &str) -> String {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var).unwrap_or_else(|_| value.to_string()),
        None => value.to_string(),
    }
}

/// Last N lines of combined stdout+stderr kept for `LoopRun.output_tail`.
pub const DEFAULT_OUTPUT_TAIL_LINES: usize = 1_000;

/// Grace period between SIGINT and a forced SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn harness: {0}")]
    SpawnFailed(String),

    #[error("harness timed out")]
    Timeout,

    #[error("harness exited with status {0}")]
    NonZeroExit(i32),

    #[error("harness was killed")]
    Killed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    Killed,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub output_tail: String,
}

/// A bounded ring buffer of output lines.
#[derive(Default)]
struct RingBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self { lines: VecDeque::with_capacity(capacity.min(1024)), capacity }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn join(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

pub struct RunRequest<'a> {
    pub profile: &'a Profile,
    pub prompt: &'a str,
    pub prompt_path: Option<&'a Path>,
    pub workdir: &'a Path,
    pub timeout: Option<Duration>,
    pub log_path: Option<&'a Path>,
    /// Flips to `true` to request cooperative cancellation (e.g. from a
    /// `kill_now` queue intent or runtime shutdown).
    pub cancel: watch::Receiver<bool>,
}

#[derive(Default)]
pub struct Runner;

impl Runner {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, req: RunRequest<'_>) -> Result<RunResult, RunnerError> {
        debug!(harness = %req.profile.harness, ?req.workdir, "Runner::run: called");

        let prompt_path_owned: Option<PathBuf>;
        let prompt_path_str = match (req.profile.prompt_mode, req.prompt_path) {
            (PromptMode::Path, Some(p)) => Some(p.to_string_lossy().to_string()),
            (PromptMode::Path, None) => {
                let tmp = tempfile::Builder::new().prefix("forge-prompt-").tempfile().map_err(RunnerError::Io)?;
                std::fs::write(tmp.path(), req.prompt).map_err(RunnerError::Io)?;
                let (_, path) = tmp.keep().map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;
                prompt_path_owned = Some(path.clone());
                Some(path.to_string_lossy().to_string())
            }
            _ => None,
        };
        let _keep_alive = &prompt_path_owned;

        let command = render_command(&req.profile.command_template, req.prompt, prompt_path_str.as_deref());
        let mut argv = split_command(&command);
        if argv.is_empty() {
            return Err(RunnerError::SpawnFailed("empty command template".to_string()));
        }
        argv.extend(req.profile.extra_args.iter().cloned());

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(req.workdir).stdout(Stdio::piped()).stderr(Stdio::piped());
        if matches!(req.profile.prompt_mode, PromptMode::Stdin) {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        for (k, v) in &req.profile.env {
            cmd.env(k, resolve_env_value(v));
        }
        if matches!(req.profile.prompt_mode, PromptMode::Env) {
            cmd.env("FORGE_PROMPT", req.prompt);
        }

        let mut child = cmd.spawn().map_err(|e| RunnerError::SpawnFailed(e.to_string()))?;

        if matches!(req.profile.prompt_mode, PromptMode::Stdin) {
            if let Some(mut stdin) = child.stdin.take() {
                let prompt = req.prompt.to_string();
                tokio::spawn(async move {
                    let _ = stdin.write_all(prompt.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let tail = std::sync::Arc::new(std::sync::Mutex::new(RingBuffer::new(DEFAULT_OUTPUT_TAIL_LINES)));
        let log_path = req.log_path.map(|p| p.to_path_buf());

        let stdout_task = spawn_line_reader(stdout, tail.clone(), log_path.clone());
        let stderr_task = spawn_line_reader(stderr, tail.clone(), log_path.clone());

        let mut cancel = req.cancel.clone();
        let wait_for_cancel = async {
            while !*cancel.borrow() {
                if cancel.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        let wait_fut = child.wait();

        let status = if let Some(timeout) = req.timeout {
            tokio::select! {
                result = tokio::time::timeout(timeout, wait_fut) => {
                    match result {
                        Ok(Ok(status)) => WaitOutcome::Exited(status),
                        Ok(Err(e)) => return Err(RunnerError::Io(e)),
                        Err(_) => WaitOutcome::TimedOut,
                    }
                }
                _ = wait_for_cancel => WaitOutcome::Cancelled,
            }
        } else {
            tokio::select! {
                result = wait_fut => match result {
                    Ok(status) => WaitOutcome::Exited(status),
                    Err(e) => return Err(RunnerError::Io(e)),
                },
                _ = wait_for_cancel => WaitOutcome::Cancelled,
            }
        };

        let (outcome, exit_code) = match status {
            WaitOutcome::Exited(status) => {
                let code = status.code().unwrap_or(-1);
                if code == 0 {
                    (Outcome::Success, Some(code))
                } else {
                    (Outcome::Error, Some(code))
                }
            }
            WaitOutcome::TimedOut => {
                terminate_gracefully(&mut child).await;
                (Outcome::Error, None)
            }
            WaitOutcome::Cancelled => {
                terminate_gracefully(&mut child).await;
                (Outcome::Killed, None)
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let output_tail = tail.lock().expect("ring buffer mutex poisoned").join();
        debug!(?outcome, ?exit_code, "Runner::run: finished");
        Ok(RunResult { outcome, exit_code, output_tail })
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

fn spawn_line_reader<R>(reader: R, tail: std::sync::Arc<std::sync::Mutex<RingBuffer>>, log_path: Option<PathBuf>) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut file = match &log_path {
            Some(path) => tokio::fs::OpenOptions::new().create(true).append(true).open(path).await.ok(),
            None => None,
        };
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tail.lock().expect("ring buffer mutex poisoned").push(line.clone());
            if let Some(f) = file.as_mut() {
                let _ = f.write_all(line.as_bytes()).await;
                let _ = f.write_all(b"\n").await;
            }
        }
    })
}

/// Send SIGINT, wait up to [`DEFAULT_GRACE_PERIOD`], then force-kill.
async fn terminate_gracefully(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT) {
            debug!(error = %e, "terminate_gracefully: SIGINT failed, falling back to kill()");
        }
    }
    let grace = tokio::time::timeout(DEFAULT_GRACE_PERIOD, child.wait()).await;
    if grace.is_err() {
        debug!("terminate_gracefully: grace period elapsed, forcing kill");
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Profile;

    fn profile(template: &str) -> Profile {
        Profile::new("p1", "test", "sh", template).with_prompt_mode(PromptMode::Stdin)
    }

    #[test]
    fn resolve_env_value_looks_up_env_prefixed_var() {
        std::env::set_var("FORGE_TEST_RESOLVE_ENV_VAR", "resolved");
        assert_eq!(resolve_env_value("env:FORGE_TEST_RESOLVE_ENV_VAR"), "resolved");
        std::env::remove_var("FORGE_TEST_RESOLVE_ENV_VAR");
    }

    #[test]
    fn resolve_env_value_passes_through_unresolvable_or_vault_references() {
        assert_eq!(resolve_env_value("env:FORGE_TEST_DEFINITELY_UNSET"), "env:FORGE_TEST_DEFINITELY_UNSET");
        assert_eq!(resolve_env_value("vault:some-secret"), "vault:some-secret");
        assert_eq!(resolve_env_value("literal-value"), "literal-value");
    }

    #[tokio::test]
    async fn successful_command_returns_success_outcome() {
        let (_tx, rx) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new();
        let result = runner
            .run(RunRequest {
                profile: &profile("sh -c 'echo ok'"),
                prompt: "irrelevant",
                prompt_path: None,
                workdir: dir.path(),
                timeout: Some(Duration::from_secs(5)),
                log_path: None,
                cancel: rx,
            })
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.output_tail.contains("ok"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_outcome() {
        let (_tx, rx) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new();
        let result = runner
            .run(RunRequest {
                profile: &profile("sh -c 'exit 3'"),
                prompt: "x",
                prompt_path: None,
                workdir: dir.path(),
                timeout: Some(Duration::from_secs(5)),
                log_path: None,
                cancel: rx,
            })
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Error);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_produces_error_outcome_without_exit_code() {
        let (_tx, rx) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new();
        let result = runner
            .run(RunRequest {
                profile: &profile("sh -c 'sleep 10'"),
                prompt: "x",
                prompt_path: None,
                workdir: dir.path(),
                timeout: Some(Duration::from_millis(100)),
                log_path: None,
                cancel: rx,
            })
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Error);
        assert!(result.exit_code.is_none());
    }

    #[tokio::test]
    async fn cancel_signal_produces_killed_outcome() {
        let (tx, rx) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new();
        let handle = tokio::spawn(async move {
            runner
                .run(RunRequest {
                    profile: &profile("sh -c 'sleep 10'"),
                    prompt: "x",
                    prompt_path: None,
                    workdir: dir.path(),
                    timeout: None,
                    log_path: None,
                    cancel: rx,
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.outcome, Outcome::Killed);
    }

    #[tokio::test]
    async fn env_prompt_mode_injects_forge_prompt_var() {
        let (_tx, rx) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new();
        let result = runner
            .run(RunRequest {
                profile: &profile("sh -c 'echo $FORGE_PROMPT'").with_prompt_mode(PromptMode::Env),
                prompt: "hello-env",
                prompt_path: None,
                workdir: dir.path(),
                timeout: Some(Duration::from_secs(5)),
                log_path: None,
                cancel: rx,
            })
            .await
            .unwrap();
        assert!(result.output_tail.contains("hello-env"));
    }
}
