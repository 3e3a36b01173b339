//! Loosely typed execution options and their validation into an
//! [`ExecRequest`].
//!
//! Option values may arrive as numbers or strings (from a TOML file, an
//! environment variable, or a command-line flag). Everything is checked
//! here, before anything is spawned, and every rejection is an
//! [`ExecError`] with a stable validation code.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;

use crate::accumulator::Encoding;
use crate::command::ScriptRuntime;
use crate::error::ExecError;
use crate::exec::ThrowPolicy;
use crate::reader::ByteCap;
use crate::request::{ExecRequest, StdioMode};
use crate::signals::{DEFAULT_KILL_SIGNAL, parse_signal_name, signal_from_number};

/// Encoding used when none is configured.
pub const DEFAULT_ENCODING: &str = "utf8";

const ID_RANGE: &str = ">= 0 && <= 4294967295";

/// A number or a string, as supplied by the user.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl OptionValue {
    /// Interpret raw text: integers and floats (including `inf` and `NaN`)
    /// become numbers, anything else stays text.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(n) = trimmed.parse::<i64>() {
            OptionValue::Int(n)
        } else if let Ok(f) = trimmed.parse::<f64>() {
            OptionValue::Float(f)
        } else {
            OptionValue::Text(raw.to_owned())
        }
    }

    /// The value as a whole number, if it is one.
    fn as_integer(&self) -> Option<i64> {
        match *self {
            OptionValue::Int(n) => Some(n),
            OptionValue::Float(f) if f.is_finite() && f.fract() == 0.0 => {
                // Saturates outside the i64 range, which every caller rejects.
                Some(f as i64)
            }
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Int(n) => write!(f, "{n}"),
            OptionValue::Float(x) => write!(f, "{x}"),
            OptionValue::Text(s) => write!(f, "type string ({s:?})"),
        }
    }
}

impl From<i64> for OptionValue {
    fn from(n: i64) -> Self {
        OptionValue::Int(n)
    }
}

impl From<f64> for OptionValue {
    fn from(x: f64) -> Self {
        OptionValue::Float(x)
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Text(s.to_owned())
    }
}

/// User-facing execution options. Every field is optional; unset fields take
/// the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecOptions {
    /// Absolute working directory; defaults to the current directory.
    pub cwd: Option<PathBuf>,
    /// Output encoding label; defaults to `utf8`. `buffer` and unrecognized
    /// labels return raw bytes.
    pub encoding: Option<String>,
    /// Variables merged over the parent environment.
    pub env: Option<BTreeMap<String, String>>,
    pub uid: Option<OptionValue>,
    pub gid: Option<OptionValue>,
    pub kill_signal: Option<OptionValue>,
    /// Byte cap per captured stream; `inf` disables the cap.
    pub max_buffer: Option<OptionValue>,
    /// Capture output instead of sharing the parent's streams.
    #[serde(default)]
    pub silent: bool,
    pub throw_exec_error: Option<String>,
    /// Milliseconds; `0` disables the timeout.
    pub timeout: Option<OptionValue>,
    pub script_runtime: Option<ScriptRuntime>,
}

impl ExecOptions {
    pub fn throw_policy(&self) -> ThrowPolicy {
        self.throw_exec_error
            .as_deref()
            .map(ThrowPolicy::from_label)
            .unwrap_or_default()
    }

    /// Validate the options and build the request for `program` and `args`.
    ///
    /// The request is fail-fast when the throw policy is `early`.
    pub fn resolve(
        &self,
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<ExecRequest, ExecError> {
        let mut request = ExecRequest::new(program, args);
        request.cwd = resolve_cwd(self.cwd.as_deref())?;
        request.uid = self.uid.as_ref().map(|v| parse_id("uid", v)).transpose()?;
        request.gid = self.gid.as_ref().map(|v| parse_id("gid", v)).transpose()?;
        request.kill_signal = match &self.kill_signal {
            Some(value) => parse_kill_signal(value)?,
            None => DEFAULT_KILL_SIGNAL,
        };
        if let Some(value) = &self.max_buffer {
            request.max_buffer = parse_max_buffer(value)?;
        }
        request.timeout = match &self.timeout {
            Some(value) => parse_timeout(value)?,
            None => None,
        };
        request.encoding =
            Encoding::from_label(Some(self.encoding.as_deref().unwrap_or(DEFAULT_ENCODING)));
        request.env = self.env.as_ref().map(|overrides| {
            let mut env: BTreeMap<String, String> = std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect();
            env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
            env
        });
        request.stdio = if self.silent {
            StdioMode::Piped
        } else {
            StdioMode::Inherited
        };
        request.fail_fast = self.throw_policy() == ThrowPolicy::Early;
        request.script_runtime = self.script_runtime.clone();
        Ok(request)
    }
}

fn resolve_cwd(cwd: Option<&Path>) -> Result<PathBuf, ExecError> {
    match cwd {
        None => std::env::current_dir().map_err(|e| ExecError::WorkingDirectory {
            detail: "cannot determine the current directory".to_owned(),
            source: Some(e),
        }),
        Some(path) if path.is_absolute() => Ok(path.to_path_buf()),
        Some(path) => Err(ExecError::WorkingDirectory {
            detail: format!("'cwd' must be an absolute path, got {}", path.display()),
            source: None,
        }),
    }
}

fn parse_id(option: &'static str, value: &OptionValue) -> Result<u32, ExecError> {
    if let OptionValue::Text(_) = value {
        return Err(ExecError::InvalidArgType {
            option,
            expected: "of type number",
            received: value.to_string(),
        });
    }
    value
        .as_integer()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ExecError::OutOfRange {
            option,
            range: ID_RANGE,
            received: value.to_string(),
        })
}

fn parse_kill_signal(value: &OptionValue) -> Result<Signal, ExecError> {
    let signal = match value {
        OptionValue::Text(name) => parse_signal_name(name),
        number => number.as_integer().and_then(signal_from_number),
    };
    signal.ok_or_else(|| ExecError::UnknownSignal {
        signal: match value {
            OptionValue::Text(name) => name.clone(),
            number => number.to_string(),
        },
    })
}

fn parse_max_buffer(value: &OptionValue) -> Result<ByteCap, ExecError> {
    let out_of_range = || ExecError::OutOfRange {
        option: "maxBuffer",
        range: "a positive number",
        received: value.to_string(),
    };
    match *value {
        OptionValue::Int(n) => usize::try_from(n)
            .map(ByteCap::Limited)
            .map_err(|_| out_of_range()),
        OptionValue::Float(x) if x.is_nan() || x < 0.0 => Err(out_of_range()),
        OptionValue::Float(x) if x.is_infinite() => Ok(ByteCap::Unbounded),
        // Float-to-int casts saturate, so huge caps become usize::MAX.
        OptionValue::Float(x) => Ok(ByteCap::Limited(x.floor() as usize)),
        OptionValue::Text(_) => Err(out_of_range()),
    }
}

/// Any value that is not a non-negative integer, text included, is out of
/// range.
fn parse_timeout(value: &OptionValue) -> Result<Option<Duration>, ExecError> {
    let millis = value
        .as_integer()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| ExecError::OutOfRange {
            option: "timeout",
            range: "an integer >= 0",
            received: value.to_string(),
        })?;
    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}
