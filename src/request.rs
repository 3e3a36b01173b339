//! The validated, immutable description of one execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::accumulator::Encoding;
use crate::command::ScriptRuntime;
use crate::reader::ByteCap;
use crate::signals::DEFAULT_KILL_SIGNAL;

/// Whether the child's standard streams are shared with the parent or
/// captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    #[default]
    Inherited,
    /// stdout and stderr are captured; stdin reads from `/dev/null`.
    Piped,
}

/// Everything needed to run one command. Build it directly or through
/// [`crate::options::ExecOptions::resolve`], which validates loosely typed
/// input first.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Exact child environment; `None` inherits the parent's.
    pub env: Option<BTreeMap<String, String>>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub stdio: StdioMode,
    pub encoding: Encoding,
    pub max_buffer: ByteCap,
    pub kill_signal: Signal,
    /// `None` means no time limit.
    pub timeout: Option<Duration>,
    pub fail_fast: bool,
    pub script_runtime: Option<ScriptRuntime>,
}

impl ExecRequest {
    /// A request with the engine defaults: inherited stdio, raw-byte
    /// output, 1 MiB cap, `SIGTERM`, no timeout, no fail-fast, and the
    /// current directory (or `/` if it cannot be determined).
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            env: None,
            uid: None,
            gid: None,
            stdio: StdioMode::Inherited,
            encoding: Encoding::Buffer,
            max_buffer: ByteCap::default(),
            kill_signal: DEFAULT_KILL_SIGNAL,
            timeout: None,
            fail_fast: false,
            script_runtime: None,
        }
    }

    /// `program` followed by the space-joined arguments.
    pub fn command_line(&self) -> String {
        format_command_line(&self.program.display().to_string(), &self.args)
    }
}

pub(crate) fn format_command_line(program: &str, args: &[String]) -> String {
    let mut cmd = program.to_owned();
    if !args.is_empty() {
        cmd.push(' ');
        cmd.push_str(&args.join(" "));
    }
    cmd
}
