//! Run summary: a JSON record of one execution, written after the command
//! finishes.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;

use crate::result::ExecResult;

/// Summary of a finished execution.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// The command line as given.
    pub command: String,
    pub status: Option<i32>,
    /// Name of the signal that ended the child, if any.
    pub signal: Option<String>,
    pub pid: Option<u32>,
    pub killed: bool,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured bytes (or decoded length for text output); 0 when inherited.
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub duration_ms: u64,
    /// RFC 3339 timestamp when the summary was built.
    pub completed_at: String,
}

pub fn build_summary(command: &str, result: &ExecResult, duration: Duration) -> RunSummary {
    let error = result.error.as_ref();
    RunSummary {
        command: command.to_owned(),
        status: result.status,
        signal: result.signal.map(|s| s.as_str().to_owned()),
        pid: result.pid,
        killed: error.is_some_and(|e| e.killed()),
        timed_out: error.is_some_and(|e| e.kind() == crate::error::ErrorKind::Timeout),
        error_code: error.map(|e| e.code().to_string()),
        error: error.map(|e| e.to_string()),
        stdout_bytes: result.stdout().len(),
        stderr_bytes: result.stderr().len(),
        duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        completed_at: Utc::now().to_rfc3339(),
    }
}

/// Write summary to the given path. Creates parent dirs if needed; writes
/// atomically (temp file then rename).
pub fn write_run_summary(summary: &RunSummary, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory for run summary {}", path.display())
            })?;
        }
    }

    let json = serde_json::to_string_pretty(summary).context("failed to serialize run summary")?;

    let tmp_path = path.with_extension("json.tmp");
    let written = (|| -> std::io::Result<()> {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e).with_context(|| format!("failed to write run summary {}", path.display()));
    }
    tracing::debug!(path = %path.display(), "wrote run summary");
    Ok(())
}
