use std::fmt;
use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use serde::Serialize;

use crate::reader::StreamName;

pub const ERR_INVALID_ARG_TYPE: &str = "ERR_INVALID_ARG_TYPE";
pub const ERR_OUT_OF_RANGE: &str = "ERR_OUT_OF_RANGE";
pub const ERR_UNKNOWN_SIGNAL: &str = "ERR_UNKNOWN_SIGNAL";
pub const ERR_INVALID_CWD: &str = "ERR_INVALID_CWD";
pub const ERR_CHILD_PROCESS_STDIO_MAXBUFFER: &str = "ERR_CHILD_PROCESS_STDIO_MAXBUFFER";

/// Errors raised while validating, spawning, or running a command.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("The \"{option}\" option must be {expected}. Received {received}")]
    InvalidArgType {
        option: &'static str,
        expected: &'static str,
        received: String,
    },

    #[error("The value of \"{option}\" is out of range. It must be {range}. Received {received}")]
    OutOfRange {
        option: &'static str,
        range: &'static str,
        received: String,
    },

    #[error("Unknown signal: {signal}")]
    UnknownSignal { signal: String },

    #[error("Invalid working directory: {detail}")]
    WorkingDirectory {
        detail: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("spawn {cmd} {}", errno_name(.source))]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    #[error("{cmd}: {source}")]
    Io {
        cmd: String,
        #[source]
        source: io::Error,
    },

    #[error("Command failed: {cmd}\n{stderr}")]
    Failed {
        cmd: String,
        code: Option<i32>,
        signal: Option<Signal>,
        killed: bool,
        timed_out: bool,
        stderr: String,
    },

    #[error("{stream} maxBuffer length exceeded")]
    MaxBuffer { cmd: String, stream: StreamName },
}

/// Errors raised while loading the `fgexec` configuration layers.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for environment variable {var}: {detail}")]
    EnvParse { var: String, detail: String },

    #[error("invalid --env entry {entry:?}: expected KEY=VALUE")]
    EnvEntry { entry: String },
}

/// Broad category of an [`ExecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Options rejected before anything was spawned.
    Validation,
    Spawn,
    /// The child ran and exited nonzero or died by a signal.
    Exec,
    Timeout,
    ResourceLimit,
    Io,
}

/// Stable error code: an exit code (or null) for exec failures, a name
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Exit(Option<i32>),
    Name(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Exit(Some(code)) => write!(f, "{code}"),
            ErrorCode::Exit(None) => f.write_str("null"),
            ErrorCode::Name(name) => f.write_str(name),
        }
    }
}

impl ErrorCode {
    fn name(name: &str) -> Self {
        ErrorCode::Name(name.to_owned())
    }
}

impl ExecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecError::InvalidArgType { .. } => ErrorCode::name(ERR_INVALID_ARG_TYPE),
            ExecError::OutOfRange { .. } => ErrorCode::name(ERR_OUT_OF_RANGE),
            ExecError::UnknownSignal { .. } => ErrorCode::name(ERR_UNKNOWN_SIGNAL),
            ExecError::WorkingDirectory { .. } => ErrorCode::name(ERR_INVALID_CWD),
            ExecError::Spawn { source, .. } | ExecError::Io { source, .. } => {
                ErrorCode::Name(errno_name(source))
            }
            ExecError::Failed { code, .. } => ErrorCode::Exit(*code),
            ExecError::MaxBuffer { .. } => ErrorCode::name(ERR_CHILD_PROCESS_STDIO_MAXBUFFER),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::InvalidArgType { .. }
            | ExecError::OutOfRange { .. }
            | ExecError::UnknownSignal { .. }
            | ExecError::WorkingDirectory { .. } => ErrorKind::Validation,
            ExecError::Spawn { .. } => ErrorKind::Spawn,
            ExecError::Io { .. } => ErrorKind::Io,
            ExecError::Failed { timed_out: true, .. } => ErrorKind::Timeout,
            ExecError::Failed { .. } => ErrorKind::Exec,
            ExecError::MaxBuffer { .. } => ErrorKind::ResourceLimit,
        }
    }

    /// The attempted command line, when a command was involved.
    pub fn cmd(&self) -> Option<&str> {
        match self {
            ExecError::Spawn { cmd, .. }
            | ExecError::Io { cmd, .. }
            | ExecError::Failed { cmd, .. }
            | ExecError::MaxBuffer { cmd, .. } => Some(cmd),
            _ => None,
        }
    }

    /// Whether the child was sent a signal by the engine.
    pub fn killed(&self) -> bool {
        matches!(self, ExecError::Failed { killed: true, .. })
    }

    pub fn signal(&self) -> Option<Signal> {
        match self {
            ExecError::Failed { signal, .. } => *signal,
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

fn errno_name(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(raw) => format!("{:?}", Errno::from_raw(raw)),
        None => "EIO".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_code_is_errno_name() {
        let err = ExecError::Spawn {
            cmd: "/nope".into(),
            source: io::Error::from_raw_os_error(Errno::ENOENT as i32),
        };
        assert_eq!(err.code(), ErrorCode::Name("ENOENT".into()));
        assert_eq!(err.to_string(), "spawn /nope ENOENT");
        assert_eq!(err.kind(), ErrorKind::Spawn);
        assert_eq!(err.cmd(), Some("/nope"));
    }

    #[test]
    fn io_error_without_errno_reports_eio() {
        let err = ExecError::Io {
            cmd: "x".into(),
            source: io::Error::other("boom"),
        };
        assert_eq!(err.code(), ErrorCode::Name("EIO".into()));
    }

    #[test]
    fn failed_carries_exit_code_and_stderr() {
        let err = ExecError::Failed {
            cmd: "/bin/sh -c exit 3".into(),
            code: Some(3),
            signal: None,
            killed: false,
            timed_out: false,
            stderr: "oops\n".into(),
        };
        assert_eq!(err.code(), ErrorCode::Exit(Some(3)));
        assert_eq!(err.to_string(), "Command failed: /bin/sh -c exit 3\noops\n");
        assert_eq!(err.kind(), ErrorKind::Exec);
        assert!(!err.killed());
    }

    #[test]
    fn timed_out_failure_is_a_timeout() {
        let err = ExecError::Failed {
            cmd: "sleep 5".into(),
            code: None,
            signal: Some(Signal::SIGTERM),
            killed: true,
            timed_out: true,
            stderr: String::new(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code(), ErrorCode::Exit(None));
        assert_eq!(err.signal(), Some(Signal::SIGTERM));
        assert!(err.killed());
    }

    #[test]
    fn max_buffer_names_the_stream() {
        let err = ExecError::MaxBuffer {
            cmd: "x".into(),
            stream: StreamName::Stderr,
        };
        assert_eq!(err.to_string(), "stderr maxBuffer length exceeded");
        assert_eq!(
            err.code(),
            ErrorCode::Name(ERR_CHILD_PROCESS_STDIO_MAXBUFFER.into())
        );
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    }

    #[test]
    fn config_env_error_names_the_variable() {
        let err = ConfigError::EnvParse {
            var: "FGEXEC_SILENT".into(),
            detail: "provided string was not `true` or `false`".into(),
        };
        assert!(err.to_string().contains("FGEXEC_SILENT"));
    }

    #[test]
    fn validation_errors_have_no_command() {
        let err = ExecError::OutOfRange {
            option: "timeout",
            range: "an integer >= 0",
            received: "1.5".into(),
        };
        assert!(err.is_validation());
        assert_eq!(err.cmd(), None);
        assert_eq!(err.code().to_string(), ERR_OUT_OF_RANGE);
    }
}
