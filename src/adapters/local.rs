//! Local process-group sandbox.
//!
//! Runs `/bin/sh -c <command>` as the leader of a fresh process group so
//! that the whole tree can be signalled at once. Output is drained from
//! both pipes concurrently into capped buffers, and the timeout escalates
//! from SIGTERM to SIGKILL after the grace period.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Executor, SandboxError};
use crate::core::redact::redact_secrets;
use crate::core::safety::{CappedBuffer, SandboxLimits};
use crate::domain::{CommandRequest, LimitViolation, OutputStream, SandboxResult, TIMEOUT_EXIT_CODE};

/// Slice of the grace period kept for reading pipes after SIGKILL
const FINAL_DRAIN: Duration = Duration::from_millis(200);

/// Read chunk size for output pipes
const CHUNK_SIZE: usize = 8 * 1024;

/// Shell exit status for "command not found"
const EXIT_NOT_FOUND: i32 = 127;

/// Shell exit status for "found but not executable"
const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Shell diagnostics for a missing command (dash, bash, busybox, zsh)
const NOT_FOUND_MARKERS: &[&str] = &["not found", "No such file or directory"];

/// Shell diagnostics for a command that exists but cannot be executed
const NOT_EXECUTABLE_MARKERS: &[&str] = &["Permission denied", "Is a directory", "cannot execute"];

/// Executes commands in a local process group
pub struct LocalSandbox {
    /// Shell used to interpret command text (default: /bin/sh)
    shell: PathBuf,
}

impl Default for LocalSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }

    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn build_command(&self, command: &str, cwd: &Path, limits: &SandboxLimits) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(target_os = "linux")]
        {
            if let Some(bytes) = limits.max_memory_bytes {
                // SAFETY: pre_exec runs after fork() and before exec() in the child.
                // setrlimit is async-signal-safe and touches no shared state.
                unsafe {
                    cmd.pre_exec(move || apply_memory_limit(bytes));
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            if limits.max_memory_bytes.is_some() {
                debug!("Memory limit is advisory only on this platform; not applied");
            }
        }

        cmd
    }

    /// Run a command under limits
    ///
    /// Returns within `timeout + grace_period` of spawning, regardless of
    /// how the command or anything it forks behaves.
    pub async fn run(&self, command: &str, limits: &SandboxLimits) -> Result<SandboxResult, SandboxError> {
        limits.validate()?;

        let cwd = limits
            .working_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        let started = Instant::now();
        let mut child = self
            .build_command(command, &cwd, limits)
            .spawn()
            .map_err(SandboxError::Spawn)?;

        // Every wait below is bounded by this single deadline
        let deadline = started + limits.deadline();
        let kill_at = deadline - (limits.grace_period() / 4).min(FINAL_DRAIN);

        let pgid = child.id().map(|pid| pid as i32);
        debug!(
            pid = ?pgid,
            cwd = %cwd.display(),
            command = %redact_secrets(command),
            "Spawned sandboxed command"
        );

        let stdout = spawn_reader(child.stdout.take(), OutputStream::Stdout, limits.max_output_bytes);
        let stderr = spawn_reader(child.stderr.take(), OutputStream::Stderr, limits.max_output_bytes);

        let mut timed_out = false;
        let status = match tokio::time::timeout_at(started + limits.timeout(), child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                signal_group(pgid, &mut child, Signal::Kill);
                stdout.handle.abort();
                stderr.handle.abort();
                return Err(SandboxError::Spawn(e));
            }
            Err(_) => {
                timed_out = true;
                warn!(
                    pid = ?pgid,
                    timeout_seconds = limits.timeout_seconds,
                    "Command timed out, terminating process group"
                );
                terminate(pgid, &mut child, kill_at).await
            }
        };

        // Pipes may outlive the shell; drain for at most one grace period
        let drain_by = if timed_out {
            kill_at
        } else {
            (Instant::now() + limits.grace_period()).min(kill_at)
        };
        if tokio::time::timeout_at(drain_by, join_readers(&stdout, &stderr))
            .await
            .is_err()
        {
            debug!(pid = ?pgid, "Output still open after exit, killing leftover group members");
            signal_group(pgid, &mut child, Signal::Kill);
            // Descendants that left the group can hold the pipes forever
            if tokio::time::timeout_at(deadline, join_readers(&stdout, &stderr))
                .await
                .is_err()
            {
                stdout.handle.abort();
                stderr.handle.abort();
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let (stdout_bytes, stdout_violation) = stdout.take();
        let (stderr_bytes, stderr_violation) = stderr.take();

        let mut violations = Vec::new();
        violations.extend(stdout_violation);
        violations.extend(stderr_violation);

        let exit_code = if timed_out {
            violations.push(LimitViolation::Timeout {
                limit_seconds: limits.timeout_seconds,
            });
            TIMEOUT_EXIT_CODE
        } else {
            // The non-timeout path always has a status
            let (code, signal) = status.map(decode_status).unwrap_or((-1, None));

            if let (Some(signal), Some(limit)) = (signal, limits.max_memory_bytes) {
                if is_memory_signal(signal) {
                    violations.push(LimitViolation::MemoryLimitSuspected {
                        limit_bytes: limit,
                        signal,
                    });
                }
            }

            // 127/126 only mean "never started" when the shell's own
            // complaint is the sole output; anything else ran and is a result
            match code {
                EXIT_NOT_FOUND if never_started(&stdout_bytes, &stderr_bytes, NOT_FOUND_MARKERS) => {
                    return Err(SandboxError::CommandNotFound(describe_failure(
                        command,
                        &stderr_bytes,
                    )))
                }
                EXIT_NOT_EXECUTABLE
                    if never_started(&stdout_bytes, &stderr_bytes, NOT_EXECUTABLE_MARKERS) =>
                {
                    return Err(SandboxError::NotExecutable(describe_failure(
                        command,
                        &stderr_bytes,
                    )))
                }
                _ => code,
            }
        };

        debug!(
            pid = ?pgid,
            exit_code,
            duration_ms,
            timed_out,
            "Sandboxed command finished"
        );

        Ok(SandboxResult {
            exit_code,
            stdout: stdout_bytes,
            stderr: stderr_bytes,
            duration_ms,
            violations,
            terminated_by_timeout: timed_out,
            provider: "local".to_string(),
        })
    }
}

#[async_trait]
impl Executor for LocalSandbox {
    fn provider(&self) -> &str {
        "local"
    }

    async fn execute(
        &self,
        request: &CommandRequest,
        limits: &SandboxLimits,
    ) -> std::result::Result<SandboxResult, SandboxError> {
        let mut limits = limits.clone();
        if limits.working_directory.is_none() {
            limits.working_directory = Some(request.working_dir.clone());
        }
        self.run(&request.command, &limits).await
    }

    async fn health_check(&self) -> Result<()> {
        if !self.shell.exists() {
            anyhow::bail!("shell {} not found", self.shell.display());
        }
        Ok(())
    }
}

/// A pipe reader task and the buffer it fills
struct Reader {
    handle: JoinHandle<()>,
    buffer: Arc<Mutex<CappedBuffer>>,
    stream: OutputStream,
    limit: u64,
}

impl Reader {
    /// Take whatever was captured, even if the task was aborted
    fn take(self) -> (Vec<u8>, Option<LimitViolation>) {
        let mut guard = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = std::mem::replace(&mut *guard, CappedBuffer::new(self.stream, self.limit));
        buffer.finish()
    }
}

fn spawn_reader<R>(pipe: Option<R>, stream: OutputStream, limit: u64) -> Reader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(CappedBuffer::new(stream, limit)));
    let sink = Arc::clone(&buffer);

    let handle = tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(&chunk[..n]),
            }
        }
    });

    Reader {
        handle,
        buffer,
        stream,
        limit,
    }
}

async fn join_readers(stdout: &Reader, stderr: &Reader) {
    // Poll completion without consuming the handles
    while !(stdout.handle.is_finished() && stderr.handle.is_finished()) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// SIGTERM the group, wait until `kill_at`, then SIGKILL
async fn terminate(pgid: Option<i32>, child: &mut Child, kill_at: Instant) -> Option<ExitStatus> {
    signal_group(pgid, child, Signal::Term);

    let status = match tokio::time::timeout_at(kill_at, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => None,
    };

    // Escalate even if the leader exited: members may ignore SIGTERM
    signal_group(pgid, child, Signal::Kill);

    match status {
        Some(status) => Some(status),
        None => child.try_wait().ok().flatten(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, _child: &mut Child, signal: Signal) {
    let Some(pgid) = pgid.filter(|p| *p > 1) else {
        return;
    };
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg only delivers a signal to the group we created.
    let rc = unsafe { libc::killpg(pgid, signo) };
    if rc != 0 {
        // ESRCH once the whole group is gone
        debug!(pgid, ?signal, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<i32>, child: &mut Child, _signal: Signal) {
    let _ = child.start_kill();
}

#[cfg(target_os = "linux")]
fn apply_memory_limit(bytes: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: bytes as libc::rlim_t,
        rlim_max: bytes as libc::rlim_t,
    };
    // SAFETY: plain syscall on a stack value.
    if unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Exit code and terminating signal; signal deaths map to 128 + signal
fn decode_status(status: ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal, Some(signal));
        }
    }
    (-1, None)
}

#[cfg(unix)]
fn is_memory_signal(signal: i32) -> bool {
    matches!(signal, libc::SIGKILL | libc::SIGSEGV | libc::SIGABRT | libc::SIGBUS)
}

#[cfg(not(unix))]
fn is_memory_signal(_signal: i32) -> bool {
    false
}

/// Whether the only output is a single shell diagnostic line
fn never_started(stdout: &[u8], stderr: &[u8], markers: &[&str]) -> bool {
    if !stdout.is_empty() {
        return false;
    }
    let stderr = String::from_utf8_lossy(stderr);
    let mut lines = stderr.lines().filter(|l| !l.trim().is_empty());
    match (lines.next(), lines.next()) {
        (Some(line), None) => markers.iter().any(|m| line.contains(m)),
        _ => false,
    }
}

fn describe_failure(command: &str, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let detail = stderr.trim();
    if detail.is_empty() {
        redact_secrets(command).into_owned()
    } else {
        detail.lines().last().unwrap_or(detail).to_string()
    }
}
