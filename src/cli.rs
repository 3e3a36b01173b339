use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// fgexec: run a command in the foreground.
///
/// The child shares (or, with `--silent`, has captured) the standard
/// streams, is killed on timeout or when captured output exceeds the
/// buffer cap, and receives the signals this process receives.
#[derive(Debug, Parser)]
#[command(name = "fgexec", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a command and exit with its status.
    Run(RunArgs),

    /// Print the signals relayed to a running child.
    Signals,
}

/// Arguments for the `run` subcommand.
///
/// Every option can also be set in a TOML config file or through
/// `FGEXEC_*` environment variables. Precedence: CLI > env > file.
#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Absolute working directory for the command (default: current directory).
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Output encoding for captured streams (default: "utf8"; "buffer" for raw bytes).
    #[arg(long)]
    pub encoding: Option<String>,

    /// Extra environment variable for the command, as KEY=VALUE. Repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Numeric user id to run the command as.
    #[arg(long)]
    pub uid: Option<String>,

    /// Numeric group id to run the command as.
    #[arg(long)]
    pub gid: Option<String>,

    /// Signal sent on timeout or overflow, by name or number (default: SIGTERM).
    #[arg(long)]
    pub kill_signal: Option<String>,

    /// Byte cap per captured stream (default: 1048576; "inf" for no cap).
    #[arg(long)]
    pub max_buffer: Option<String>,

    /// Capture stdout and stderr instead of sharing this process's streams.
    #[arg(long, default_value_t = false)]
    pub silent: bool,

    /// When a failed command is reported: "early" (default), "late" or "never".
    #[arg(long)]
    pub throw_exec_error: Option<String>,

    /// Kill the command after this many milliseconds (default: no limit).
    #[arg(long)]
    pub timeout: Option<String>,

    /// Write a JSON run summary to this path after the command finishes.
    #[arg(long = "summary")]
    pub summary_path: Option<PathBuf>,

    /// Print the execution result as JSON on stdout.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Log level filter (default: "info"). Supports tracing directives
    /// (e.g. "debug", "fgexec=trace,warn"). Overridden by FGEXEC_LOG env var.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to a log file. When set, structured JSON logs are appended here
    /// in addition to the human-readable stderr output.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// The command to run, followed by its arguments.
    #[arg(last = true, required = true, num_args = 1.., value_name = "COMMAND")]
    pub command: Vec<String>,
}
