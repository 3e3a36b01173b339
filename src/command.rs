//! Command resolution.
//!
//! Bare command names are looked up on `PATH`; anything containing a path
//! separator is resolved against the working directory. A resolved file can
//! further be recognized as a script for a configured runtime (by extension
//! or by a `#!/usr/bin/env <runtime>` first line), in which case the runtime
//! is spawned with the script as its first argument.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

use crate::request::{ExecRequest, format_command_line};

/// Longest first line inspected for an interpreter directive.
const FIRST_LINE_LIMIT: u64 = 1024;

/// An interpreter whose scripts are run through its binary rather than
/// executed directly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptRuntime {
    /// Binary used to run scripts.
    pub program: PathBuf,
    /// Name matched in `#!/usr/bin/env <name>`.
    pub name: String,
    /// File extensions (without the dot) that mark a script.
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// What is actually spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    /// Resolve the program of `request` and apply script detection.
    pub async fn resolve(request: &ExecRequest) -> Self {
        let path_var = request
            .env
            .as_ref()
            .and_then(|env| env.get("PATH"))
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"));
        let program = resolve_program(&request.program, &request.cwd, path_var);

        if let Some(runtime) = &request.script_runtime {
            if is_runtime_script(&program, runtime).await {
                debug!(
                    script = %program.display(),
                    runtime = %runtime.program.display(),
                    "running script through runtime"
                );
                let mut args = Vec::with_capacity(request.args.len() + 1);
                args.push(program.display().to_string());
                args.extend(request.args.iter().cloned());
                return Self {
                    program: runtime.program.clone(),
                    args,
                };
            }
        }

        Self {
            program,
            args: request.args.clone(),
        }
    }

    pub fn command_line(&self) -> String {
        format_command_line(&self.program.display().to_string(), &self.args)
    }
}

/// Resolve `program` to the path that will be spawned.
///
/// A bare name found on `path_var` resolves to that file. Everything else,
/// including a bare name that is not found, resolves relative to `cwd`, so
/// that a missing command surfaces as a spawn error.
pub fn resolve_program(program: &Path, cwd: &Path, path_var: Option<OsString>) -> PathBuf {
    let is_bare = program.components().count() == 1 && !program.is_absolute();
    if is_bare {
        if let Some(found) = search_path(program, path_var) {
            return found;
        }
    }
    cwd.join(program)
}

fn search_path(cmd: &Path, path_var: Option<OsString>) -> Option<PathBuf> {
    let paths = path_var?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(cmd))
        .find(|candidate| is_executable(candidate))
}

/// Returns `true` when `path` exists, is a regular file, and has an
/// executable permission bit set.
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = path.metadata() else {
        return false;
    };
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
}

/// Whether `path` is a script for `runtime`.
pub async fn is_runtime_script(path: &Path, runtime: &ScriptRuntime) -> bool {
    let by_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| runtime.extensions.iter().any(|e| e == ext));
    if by_extension {
        return true;
    }
    let Some(line) = read_first_line(path).await else {
        return false;
    };
    shebang_pattern(&runtime.name).is_some_and(|re| re.is_match(&line))
}

fn shebang_pattern(name: &str) -> Option<Regex> {
    let pattern = format!(
        r"^#![\t ]*/usr/bin/env[\t ]+{}(?:$|[\x00\t #])",
        regex::escape(name)
    );
    Regex::new(&pattern).ok()
}

/// Read up to the first newline (or end of file) without loading the whole
/// file. Unreadable files and directories yield `None`.
async fn read_first_line(path: &Path) -> Option<String> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut reader = BufReader::new(file.take(FIRST_LINE_LIMIT));
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await.ok()?;
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}
