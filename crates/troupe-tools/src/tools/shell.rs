//! Shell tool set: `shell` runs commands, `get_logs` polls the ones that
//! were moved to the background.

use crate::process::{CommandSpec, LogsOutcome, Output, ProcessSupervisor, RunOutcome};
use crate::registry::{parse_args, Tool, ToolError, ToolResult, ToolSet};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_OUTPUT_CHARS: usize = 30000;

const INSTRUCTIONS: &str = "# Shell Tool Usage Guide

Use the `shell` tool to run commands in the user's environment.

- Always pass `cwd`. Use \".\" for the current working directory.
- Each call runs in a fresh shell. Shell state such as `cd` or exported variables does not persist between calls.
- Commands that take longer than a few seconds are moved to the background automatically. The result then contains the PID instead of the full output.
- Set `background: true` for servers, watchers, and other commands that never exit.
- Use the `get_logs` tool with the PID to read the output of a background command and to learn whether it has finished.
- Prefer non-interactive flags (`-y`, `--yes`, `--no-pager`). Commands cannot read from stdin.";

/// Settings for the shell tool set.
#[derive(Clone, Debug)]
pub struct ShellConfig {
    /// Directory relative `cwd` arguments are resolved against.
    pub working_dir: PathBuf,
    /// Program and leading arguments to run commands with, e.g. `["bash", "-c"]`.
    /// The platform default is used when empty.
    pub shell: Vec<String>,
    /// Extra environment variables for every command.
    pub env: Vec<(String, String)>,
    pub quick_timeout: Duration,
}

impl ShellConfig {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            shell: Vec::new(),
            env: Vec::new(),
            quick_timeout: crate::process::DEFAULT_QUICK_TIMEOUT,
        }
    }

    pub fn with_quick_timeout(mut self, timeout: Duration) -> Self {
        self.quick_timeout = timeout;
        self
    }
}

/// Resolve the program and arguments used to run a command string.
pub fn resolve_shell(overridden: &[String]) -> (String, Vec<String>) {
    if let Some((program, args)) = overridden.split_first() {
        return (program.clone(), args.to_vec());
    }
    platform_shell()
}

#[cfg(not(windows))]
fn platform_shell() -> (String, Vec<String>) {
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string());
    (shell, vec!["-c".to_string()])
}

#[cfg(windows)]
fn platform_shell() -> (String, Vec<String>) {
    for candidate in ["pwsh.exe", "powershell.exe"] {
        if find_on_path(candidate).is_some() {
            return (
                candidate.to_string(),
                vec!["-NoProfile".into(), "-NonInteractive".into(), "-Command".into()],
            );
        }
    }
    let comspec = std::env::var("ComSpec")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "cmd.exe".to_string());
    (comspec, vec!["/C".to_string()])
}

#[cfg(windows)]
fn find_on_path(exe: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exe))
        .find(|candidate| candidate.is_file())
}

/// Truncate to `MAX_OUTPUT_CHARS` characters, on a char boundary.
fn truncate_output(text: &str) -> String {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((cut, _)) => format!(
            "{}\n... [truncated, {} total chars]",
            &text[..cut],
            text.chars().count()
        ),
        None => text.to_string(),
    }
}

fn with_output(header: String, label: &str, output: &Output) -> String {
    let combined = output.combined();
    if combined.trim().is_empty() {
        header
    } else {
        format!("{}\n\n{}:\n{}", header, label, truncate_output(&combined))
    }
}

// ---------------------------------------------------------------------------
// Tool set
// ---------------------------------------------------------------------------

pub struct ShellToolSet {
    supervisor: Arc<ProcessSupervisor>,
    shell: Arc<ShellTool>,
    get_logs: Arc<GetLogsTool>,
}

impl ShellToolSet {
    pub fn new(config: ShellConfig) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(config.quick_timeout));
        Self {
            shell: Arc::new(ShellTool {
                supervisor: supervisor.clone(),
                config,
            }),
            get_logs: Arc::new(GetLogsTool {
                supervisor: supervisor.clone(),
            }),
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

#[async_trait::async_trait]
impl ToolSet for ShellToolSet {
    fn instructions(&self) -> Option<String> {
        Some(INSTRUCTIONS.to_string())
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![self.shell.clone(), self.get_logs.clone()]
    }

    async fn stop(&self) -> troupe_core::Result<()> {
        self.supervisor.shutdown();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// shell
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ShellArgs {
    cmd: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    background: bool,
}

pub struct ShellTool {
    supervisor: Arc<ProcessSupervisor>,
    config: ShellConfig,
}

impl ShellTool {
    fn resolve_cwd(&self, cwd: Option<&str>) -> PathBuf {
        match cwd.map(str::trim).filter(|c| !c.is_empty() && *c != ".") {
            Some(dir) => self.config.working_dir.join(dir),
            None => self.config.working_dir.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str { "shell" }

    fn category(&self) -> &str { "shell" }

    fn title(&self) -> &str { "Run Shell Command" }

    fn description(&self) -> &str {
        "Executes the given shell command in the user's default shell. \
         Returns stdout followed by stderr. Commands still running after a short \
         wait continue in the background and return their PID."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "The working directory to execute the command in"
                },
                "background": {
                    "type": "boolean",
                    "description": "Set to true to run the command in the background immediately and return the PID. Use this for long-running commands like 'npm start', 'npm run dev', or 'docker-compose up'."
                }
            },
            "required": ["cmd", "cwd"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value, cancel: CancellationToken) -> Result<ToolResult, ToolError> {
        let args: ShellArgs = parse_args(args)?;
        let (program, mut shell_args) = resolve_shell(&self.config.shell);
        shell_args.push(args.cmd.clone());
        let cwd = self.resolve_cwd(args.cwd.as_deref());
        debug!("shell [{}]: {}", cwd.display(), &args.cmd);

        let spec = CommandSpec {
            program,
            args: shell_args,
            cwd: Some(cwd),
            env: self.config.env.clone(),
            background: args.background,
        };

        let outcome = match self.supervisor.run(spec, cancel).await {
            Ok(outcome) => outcome,
            Err(message) => return Ok(ToolResult::error(message)),
        };

        Ok(match outcome {
            RunOutcome::Completed { exit, output } if exit.success => {
                let combined = output.combined();
                if combined.trim().is_empty() {
                    ToolResult::text("(no output)")
                } else {
                    ToolResult::text(truncate_output(&combined))
                }
            }
            RunOutcome::Completed { exit, output } => ToolResult::error(format!(
                "Error executing command: {}\nOutput: {}",
                exit.description,
                truncate_output(&output.combined())
            )),
            RunOutcome::Background { pid, output, requested } => {
                let header = if requested {
                    format!("Command is running in background (PID: {})", pid)
                } else {
                    format!(
                        "Command is still running in background (PID: {}) after {}s",
                        pid,
                        self.supervisor.quick_timeout().as_secs()
                    )
                };
                let header = format!("{}\nUse get_logs tool with this PID to check its output and status.", header);
                ToolResult::text(with_output(header, "Output so far", &output))
            }
            RunOutcome::Interrupted { output } => ToolResult::error(with_output(
                "[process killed by interrupt]".to_string(),
                "Output",
                &output,
            )),
        })
    }
}

// ---------------------------------------------------------------------------
// get_logs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GetLogsArgs {
    pid: u32,
}

pub struct GetLogsTool {
    supervisor: Arc<ProcessSupervisor>,
}

#[async_trait::async_trait]
impl Tool for GetLogsTool {
    fn name(&self) -> &str { "get_logs" }

    fn category(&self) -> &str { "shell" }

    fn title(&self) -> &str { "Get Background Process Logs" }

    fn description(&self) -> &str {
        "Retrieves the output logs of a command running in the background, \
         and reports whether it has finished."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pid": {
                    "type": "integer",
                    "description": "The PID returned by the shell tool"
                }
            },
            "required": ["pid"],
            "additionalProperties": false
        })
    }

    fn is_read_only(&self) -> bool { true }

    async fn execute(&self, args: Value, _cancel: CancellationToken) -> Result<ToolResult, ToolError> {
        let GetLogsArgs { pid } = parse_args(args)?;

        Ok(match self.supervisor.logs(pid) {
            LogsOutcome::NotFound => {
                ToolResult::error(format!("No background process found with PID: {}", pid))
            }
            LogsOutcome::Running { output, elapsed } => ToolResult::text(with_output(
                format!("Process is still running (PID: {}, running for {}s)", pid, elapsed.as_secs()),
                "Output so far",
                &output,
            )),
            LogsOutcome::Completed { exit, output } => ToolResult::text(with_output(
                format!("Process completed (PID: {}) with {}", pid, exit.description),
                "Output",
                &output,
            )),
        })
    }
}
