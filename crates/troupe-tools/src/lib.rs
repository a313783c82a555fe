//! Troupe Tools: tool sets and the process supervisor behind the shell tool
//!
//! A tool reports execution failures inside its `ToolResult` so the model can
//! correct itself. Only arguments that do not match the tool's schema are a
//! hard `ToolError`.

pub mod process;
pub mod registry;
pub mod tools;

pub use process::{CommandSpec, ExitInfo, LogsOutcome, Output, ProcessSupervisor, RunOutcome};
pub use registry::{parse_args, Tool, ToolError, ToolRegistry, ToolResult, ToolSet};
pub use tools::shell::{resolve_shell, GetLogsTool, ShellConfig, ShellTool, ShellToolSet};
