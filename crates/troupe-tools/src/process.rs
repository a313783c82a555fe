//! Process supervisor: spawns commands, tracks live processes, and keeps
//! output for commands that outlive the call that started them.
//!
//! Every spawned process gets two reader tasks (stdout, stderr) and a waiter
//! task. The waiter joins both readers before it fires the single-shot
//! completion signal, so whoever observes completion sees complete output.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a foreground command may run before it is moved to the background.
pub const DEFAULT_QUICK_TIMEOUT: Duration = Duration::from_secs(10);

type OutputBuffer = Arc<Mutex<Vec<u8>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What to run.
#[derive(Clone, Debug, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Skip the quick wait and background immediately.
    pub background: bool,
}

/// Final status of a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
    pub description: String,
}

impl ExitInfo {
    fn from_wait(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(s) => Self {
                code: s.code(),
                success: s.success(),
                description: s.to_string(),
            },
            Err(e) => Self::unknown(format!("wait failed: {}", e)),
        }
    }

    fn unknown(description: impl Into<String>) -> Self {
        Self {
            code: None,
            success: false,
            description: description.into(),
        }
    }
}

/// Combined output: stdout followed by stderr.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    fn snapshot(stdout: &OutputBuffer, stderr: &OutputBuffer) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&lock(stdout)).into_owned(),
            stderr: String::from_utf8_lossy(&lock(stderr)).into_owned(),
        }
    }

    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Result of `ProcessSupervisor::run`.
#[derive(Debug)]
pub enum RunOutcome {
    Completed { exit: ExitInfo, output: Output },
    /// Moved to the background table; poll with `logs`.
    Background { pid: u32, output: Output, requested: bool },
    /// The triggering call was cancelled and the process was terminated.
    Interrupted { output: Output },
}

/// Result of `ProcessSupervisor::logs`.
#[derive(Debug, PartialEq, Eq)]
pub enum LogsOutcome {
    NotFound,
    Running { output: Output, elapsed: Duration },
    Completed { exit: ExitInfo, output: Output },
}

struct LiveProcess {
    #[cfg_attr(unix, allow(dead_code))]
    kill: CancellationToken,
}

struct BackgroundProcess {
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    done: oneshot::Receiver<ExitInfo>,
    started: Instant,
    command: String,
}

pub struct ProcessSupervisor {
    live: Arc<Mutex<HashMap<u32, LiveProcess>>>,
    background: Mutex<HashMap<u32, BackgroundProcess>>,
    quick_timeout: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_QUICK_TIMEOUT)
    }
}

impl ProcessSupervisor {
    pub fn new(quick_timeout: Duration) -> Self {
        Self {
            live: Arc::new(Mutex::new(HashMap::new())),
            background: Mutex::new(HashMap::new()),
            quick_timeout,
        }
    }

    pub fn quick_timeout(&self) -> Duration {
        self.quick_timeout
    }

    /// Number of processes that have not exited yet.
    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }

    /// Pids currently in the background table.
    pub fn background_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = lock(&self.background).keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Spawn `spec` and wait up to the quick timeout for it to finish.
    ///
    /// Cancelling `cancel` while waiting terminates the process. Once a
    /// command is in the background, `cancel` no longer affects it.
    /// Spawn failures are returned as `Err` with a readable message.
    pub async fn run(&self, spec: CommandSpec, cancel: CancellationToken) -> Result<RunOutcome, String> {
        let command_line = format!("{} {}", spec.program, spec.args.join(" "));

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("Failed to start command: {}", e))?;
        let pid = child
            .id()
            .ok_or_else(|| "Failed to start command: process exited before it was registered".to_string())?;

        let started = Instant::now();
        let stdout: OutputBuffer = Arc::default();
        let stderr: OutputBuffer = Arc::default();
        let stdout_reader = tokio::spawn(copy_into(child.stdout.take(), stdout.clone()));
        let stderr_reader = tokio::spawn(copy_into(child.stderr.take(), stderr.clone()));

        let kill = CancellationToken::new();
        lock(&self.live).insert(pid, LiveProcess { kill: kill.clone() });
        debug!(pid, "spawned: {}", command_line);

        let (done_tx, mut done_rx) = oneshot::channel();
        let live = self.live.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let _ = stdout_reader.await;
            let _ = stderr_reader.await;
            lock(&live).remove(&pid);
            let exit = ExitInfo::from_wait(status);
            debug!(pid, "exited: {}", exit.description);
            let _ = done_tx.send(exit);
        });

        if !spec.background {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(pid, "cancelled, terminating process group");
                    self.terminate(pid);
                    return Ok(RunOutcome::Interrupted {
                        output: Output::snapshot(&stdout, &stderr),
                    });
                }
                exit = &mut done_rx => {
                    let exit = exit.unwrap_or_else(|_| ExitInfo::unknown("process monitor dropped"));
                    return Ok(RunOutcome::Completed {
                        exit,
                        output: Output::snapshot(&stdout, &stderr),
                    });
                }
                _ = tokio::time::sleep(self.quick_timeout) => {
                    info!(pid, "still running after {:?}, moving to background", self.quick_timeout);
                }
            }
        }

        let output = Output::snapshot(&stdout, &stderr);
        lock(&self.background).insert(
            pid,
            BackgroundProcess {
                stdout,
                stderr,
                done: done_rx,
                started,
                command: command_line,
            },
        );

        Ok(RunOutcome::Background {
            pid,
            output,
            requested: spec.background,
        })
    }

    /// Poll a background process. The first poll that sees it finished
    /// removes it from the table.
    pub fn logs(&self, pid: u32) -> LogsOutcome {
        let mut table = lock(&self.background);
        let Some(entry) = table.get_mut(&pid) else {
            return LogsOutcome::NotFound;
        };

        let exit = match entry.done.try_recv() {
            Ok(exit) => exit,
            Err(oneshot::error::TryRecvError::Empty) => {
                return LogsOutcome::Running {
                    output: Output::snapshot(&entry.stdout, &entry.stderr),
                    elapsed: entry.started.elapsed(),
                };
            }
            Err(oneshot::error::TryRecvError::Closed) => ExitInfo::unknown("process monitor dropped"),
        };

        match table.remove(&pid) {
            Some(entry) => {
                debug!(pid, "background command finished: {}", entry.command);
                LogsOutcome::Completed {
                    exit,
                    output: Output::snapshot(&entry.stdout, &entry.stderr),
                }
            }
            None => LogsOutcome::NotFound,
        }
    }

    /// Signal every live process, then forget them. Background entries stay
    /// in the table so their final output can still be collected.
    pub fn shutdown(&self) -> usize {
        let pids: Vec<u32> = lock(&self.live).keys().copied().collect();
        for pid in &pids {
            self.terminate(*pid);
        }
        lock(&self.live).clear();
        if !pids.is_empty() {
            info!("terminated {} live process(es)", pids.len());
        }
        pids.len()
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) {
        let Ok(pgid) = i32::try_from(pid) else {
            warn!(pid, "pid out of range, cannot signal");
            return;
        };
        // Negative pid targets the whole process group.
        let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, "SIGTERM to process group failed: {}", std::io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) {
        if let Some(proc) = lock(&self.live).get(&pid) {
            proc.kill.cancel();
        }
    }
}

async fn copy_into(pipe: Option<impl AsyncRead + Unpin>, buffer: OutputBuffer) {
    let Some(mut pipe) = pipe else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => lock(&buffer).extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!("output pipe read failed: {}", e);
                break;
            }
        }
    }
}
