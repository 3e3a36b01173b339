//! Caller-facing result of an execution.

use nix::sys::signal::Signal;
use serde::Serialize;
use serde::ser::Serializer;

use crate::accumulator::{LazyOutput, Output};
use crate::error::{ErrorCode, ErrorKind, ExecError};

/// Outcome of a command that ran (or was at least attempted and did not fail
/// to spawn).
///
/// `stdout` and `stderr` are merged on first access.
#[derive(Debug)]
pub struct ExecResult {
    /// Exit code, or `None` when the child died by a signal.
    pub status: Option<i32>,
    pub signal: Option<Signal>,
    pub pid: Option<u32>,
    /// `None` on success.
    pub error: Option<ExecError>,
    stdout: LazyOutput,
    stderr: LazyOutput,
}

impl ExecResult {
    pub(crate) fn new(
        status: Option<i32>,
        signal: Option<Signal>,
        pid: Option<u32>,
        error: Option<ExecError>,
        stdout: LazyOutput,
        stderr: LazyOutput,
    ) -> Self {
        Self {
            status,
            signal,
            pid,
            error,
            stdout,
            stderr,
        }
    }

    pub fn stdout(&self) -> &Output {
        self.stdout.get()
    }

    pub fn stderr(&self) -> &Output {
        self.stderr.get()
    }

    /// `[None, stdout, stderr]`, indexed like file descriptors.
    pub fn output(&self) -> [Option<&Output>; 3] {
        [None, Some(self.stdout()), Some(self.stderr())]
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Remove and return the error, leaving the result otherwise intact.
    pub fn take_error(&mut self) -> Option<ExecError> {
        self.error.take()
    }
}

/// Serialized view of an [`ExecError`].
#[derive(Debug, Serialize)]
pub struct ErrorView<'a> {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<&'a str>,
    pub killed: bool,
    #[serde(serialize_with = "serialize_signal")]
    pub signal: Option<Signal>,
}

impl<'a> From<&'a ExecError> for ErrorView<'a> {
    fn from(err: &'a ExecError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code(),
            message: err.to_string(),
            cmd: err.cmd(),
            killed: err.killed(),
            signal: err.signal(),
        }
    }
}

#[derive(Serialize)]
struct ResultView<'a> {
    status: Option<i32>,
    #[serde(serialize_with = "serialize_signal")]
    signal: Option<Signal>,
    output: [Option<&'a Output>; 3],
    pid: Option<u32>,
    stdout: &'a Output,
    stderr: &'a Output,
    error: Option<ErrorView<'a>>,
}

impl Serialize for ExecResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ResultView {
            status: self.status,
            signal: self.signal,
            output: self.output(),
            pid: self.pid,
            stdout: self.stdout(),
            stderr: self.stderr(),
            error: self.error.as_ref().map(ErrorView::from),
        }
        .serialize(serializer)
    }
}

pub(crate) fn serialize_signal<S: Serializer>(
    signal: &Option<Signal>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match signal {
        Some(sig) => serializer.serialize_some(sig.as_str()),
        None => serializer.serialize_none(),
    }
}
