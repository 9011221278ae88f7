//! External command execution
//!
//! [`CommandRunner`] is the only place the provisioner spawns processes. The
//! production [`ProcessRunner`] resolves the executable, runs it in its own
//! process group with both streams drained by separate tasks, and bounds it
//! with a timeout and a cancellation token. On timeout or cancellation the
//! whole group is killed and whatever output arrived is kept. Non-zero exits
//! are errors carrying the rendered command line and both streams.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::SecretString;

const REDACTED: &str = "********";
/// How long to wait for the output pipes to close once the child is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One argument of a command line. Secret arguments are passed to the child
/// verbatim but rendered redacted.
#[derive(Debug, Clone)]
pub enum CommandArg {
    Plain(String),
    /// `{prefix}{value}`, e.g. `--admin-password=` followed by the secret.
    Secret { prefix: String, value: SecretString },
}

impl CommandArg {
    pub fn plain(value: impl Into<String>) -> Self {
        CommandArg::Plain(value.into())
    }

    pub fn secret(prefix: impl Into<String>, value: SecretString) -> Self {
        CommandArg::Secret {
            prefix: prefix.into(),
            value,
        }
    }

    fn to_os_string(&self) -> OsString {
        match self {
            CommandArg::Plain(value) => OsString::from(value),
            CommandArg::Secret { prefix, value } => {
                OsString::from(format!("{}{}", prefix, value.expose()))
            }
        }
    }

    fn rendered(&self) -> String {
        match self {
            CommandArg::Plain(value) => value.clone(),
            CommandArg::Secret { prefix, .. } => format!("{}{}", prefix, REDACTED),
        }
    }
}

/// A fully described invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    pub args: Vec<CommandArg>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,
    /// Put the resolved executable's directory first on the child's `PATH`
    pub prepend_program_dir_to_path: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            prepend_program_dir_to_path: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(CommandArg::plain(arg));
        self
    }

    pub fn secret_arg(mut self, prefix: impl Into<String>, value: SecretString) -> Self {
        self.args.push(CommandArg::secret(prefix, value));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn prepend_program_dir_to_path(mut self) -> Self {
        self.prepend_program_dir_to_path = true;
        self
    }

    /// Arguments exactly as the child receives them, secrets included.
    pub fn args_os(&self) -> Vec<OsString> {
        self.args.iter().map(CommandArg::to_os_string).collect()
    }

    /// Space-joined argv with secret values redacted.
    pub fn render(&self, program: &str) -> String {
        std::iter::once(program.to_string())
            .chain(self.args.iter().map(CommandArg::rendered))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Why a command that started did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NonZeroExit(i32),
    /// Killed by a signal before reporting an exit code
    Signaled,
    TimedOut(Duration),
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NonZeroExit(code) => write!(f, "exited with code {}", code),
            FailureReason::Signaled => f.write_str("was terminated by a signal"),
            FailureReason::TimedOut(limit) => {
                write!(f, "timed out after {:?} and was killed", limit)
            }
            FailureReason::Cancelled => f.write_str("was cancelled and killed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("toolchain executable '{program}' not found (searched: {})", display_paths(.searched))]
    ToolchainNotFound {
        program: String,
        searched: Vec<PathBuf>,
    },
    #[error("toolchain command {reason}: {command}")]
    ToolchainExecutionFailed {
        /// Rendered, redacted command line
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        reason: FailureReason,
    },
    #[error("failed to launch '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Human-readable diagnostic suitable for persisting as a failure reason.
    pub fn diagnostic(&self) -> String {
        match self {
            CommandError::ToolchainExecutionFailed {
                command,
                stdout,
                stderr,
                reason,
                ..
            } => {
                let mut stderr = stderr.clone();
                if !matches!(reason, FailureReason::NonZeroExit(_)) {
                    if !stderr.is_empty() && !stderr.ends_with('\n') {
                        stderr.push('\n');
                    }
                    stderr.push_str(&format!("[command {}]", reason));
                }
                format!(
                    "CMD: {}\n\nSTDOUT:\n{}\n\nSTDERR:\n{}",
                    command, stdout, stderr
                )
            }
            other => other.to_string(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "nothing".to_string();
    }
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Executes external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion. Non-zero exit, timeout and cancellation are
    /// all [`CommandError::ToolchainExecutionFailed`].
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    search_path: Vec<PathBuf>,
    fallback: Option<PathBuf>,
    timeout: Duration,
}

impl ProcessRunner {
    /// `search_path` of `None` uses the process `PATH`.
    pub fn new(search_path: Option<Vec<PathBuf>>, fallback: Option<PathBuf>, timeout: Duration) -> Self {
        let search_path = search_path.unwrap_or_else(|| {
            std::env::var_os("PATH")
                .map(|path| std::env::split_paths(&path).collect())
                .unwrap_or_default()
        });

        Self {
            search_path,
            fallback,
            timeout,
        }
    }

    /// Locate `program` as given, on the search path, then at the fallback.
    pub async fn resolve(&self, program: &str) -> Result<PathBuf, CommandError> {
        let mut searched = Vec::new();
        let direct = Path::new(program);

        if direct.components().count() > 1 || direct.is_absolute() {
            if is_executable_file(direct).await {
                return Ok(direct.to_path_buf());
            }
            searched.push(direct.to_path_buf());
        } else {
            for dir in &self.search_path {
                let candidate = dir.join(program);
                if is_executable_file(&candidate).await {
                    return Ok(candidate);
                }
                searched.push(candidate);
            }
        }

        if let Some(fallback) = &self.fallback {
            if is_executable_file(fallback).await {
                return Ok(fallback.clone());
            }
            searched.push(fallback.clone());
        }

        Err(CommandError::ToolchainNotFound {
            program: program.to_string(),
            searched,
        })
    }
}

async fn is_executable_file(path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        metadata.is_file()
    }
}

/// Child `PATH` with `dir` first, based on the command's own `PATH` when it has one.
fn path_with_prepended(dir: &Path, spec_env: &[(String, String)]) -> Option<OsString> {
    let base = spec_env
        .iter()
        .rev()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| OsString::from(value))
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_default();

    let entries = std::iter::once(dir.to_path_buf())
        .chain(std::env::split_paths(&base).filter(|entry| entry != dir));

    std::env::join_paths(entries).ok()
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let executable = self.resolve(&spec.program).await?;
        let rendered = spec.render(&executable.display().to_string());

        let mut command = Command::new(&executable);
        command
            .args(spec.args_os())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own group, so the toolchain's helpers can be killed together with it.
        #[cfg(unix)]
        command.process_group(0);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        if spec.prepend_program_dir_to_path
            && let Some(dir) = executable.parent()
            && let Some(path) = path_with_prepended(dir, &spec.env)
        {
            command.env("PATH", path);
        }

        debug!(command = %rendered, "Spawning command");
        let started = Instant::now();

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let waited = tokio::select! {
            waited = tokio::time::timeout(self.timeout, child.wait()) => match waited {
                Ok(status) => Ok(status),
                Err(_) => {
                    warn!(command = %rendered, timeout_secs = self.timeout.as_secs(), "Command timed out");
                    Err(FailureReason::TimedOut(self.timeout))
                }
            },
            _ = cancel.cancelled() => {
                warn!(command = %rendered, "Command cancelled");
                Err(FailureReason::Cancelled)
            }
        };

        if waited.is_err() {
            kill_process_group(&mut child).await;
        }

        let stdout = collect_output(stdout_reader).await;
        let stderr = collect_output(stderr_reader).await;

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(CommandError::Spawn {
                    command: rendered,
                    source,
                });
            }
            Err(reason) => {
                return Err(CommandError::ToolchainExecutionFailed {
                    command: rendered,
                    exit_code: None,
                    stdout,
                    stderr,
                    reason,
                });
            }
        };

        debug!(
            command = %rendered,
            status = %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );

        match status.code() {
            Some(0) => Ok(CommandResult {
                exit_code: 0,
                stdout,
                stderr,
            }),
            Some(code) => Err(CommandError::ToolchainExecutionFailed {
                command: rendered,
                exit_code: Some(code),
                stdout,
                stderr,
                reason: FailureReason::NonZeroExit(code),
            }),
            None => Err(CommandError::ToolchainExecutionFailed {
                command: rendered,
                exit_code: None,
                stdout,
                stderr,
                reason: FailureReason::Signaled,
            }),
        }
    }
}

fn spawn_reader<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        // A read error ends the stream; keep what arrived before it.
        let _ = pipe.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect_output(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };

    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(err)) => {
            warn!(error = %err, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            warn!("Output pipe still open after the command ended");
            String::new()
        }
    }
}

/// SIGKILL the child's whole process group, then reap the child.
async fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id()
        && let Ok(pid) = libc::pid_t::try_from(pid)
    {
        // A negative pid addresses the group created by `process_group(0)`.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }

    if let Err(err) = child.start_kill() {
        debug!(error = %err, "Child already exited");
    }
    if let Err(err) = child.wait().await {
        warn!(error = %err, "Failed to reap killed child");
    }
}
