//! Diagnostics for the `fgexec` binary.
//!
//! An inherited child writes to the same stderr as these logs, so the
//! stderr layer stays compact and is colored only when stderr is a
//! terminal and `NO_COLOR` is unset. The optional file layer writes JSON
//! lines that carry the controller's `exec` span (`cmd`, `pid`), so lines
//! from concurrent runs can be told apart.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::Context;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Env var holding a filter directive for stderr, e.g. `fgexec=debug`.
pub const LOG_ENV: &str = "FGEXEC_LOG";
const NO_COLOR_ENV: &str = "NO_COLOR";
const DEFAULT_DIRECTIVE: &str = "info";
const FILE_DIRECTIVE: &str = "info,fgexec=debug";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
///
/// The stderr filter is `FGEXEC_LOG` if set, else `log_level`, else `info`.
/// An unparsable directive is an error rather than a silent fallback.
pub fn init(log_level: Option<&str>, log_file: Option<&Path>) -> anyhow::Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let env_directive = std::env::var(LOG_ENV).ok();
    let filter = stderr_filter(env_directive.as_deref(), log_level)?;
    let ansi = use_ansi(io::stderr().is_terminal(), std::env::var_os(NO_COLOR_ENV));
    let stderr = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(ansi)
        .compact()
        .with_filter(filter);
    let file = log_file.map(file_layer).transpose()?;

    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init()
        .context("failed to initialize logging")?;
    let _ = INSTALLED.set(());
    Ok(())
}

fn stderr_filter(env_directive: Option<&str>, log_level: Option<&str>) -> anyhow::Result<EnvFilter> {
    let (directive, source) = match (env_directive.filter(|d| !d.trim().is_empty()), log_level) {
        (Some(directive), _) => (directive, LOG_ENV),
        (None, Some(level)) => (level, "--log-level"),
        (None, None) => (DEFAULT_DIRECTIVE, "default"),
    };
    EnvFilter::try_new(directive)
        .with_context(|| format!("invalid log filter {directive:?} from {source}"))
}

fn use_ansi(stderr_is_terminal: bool, no_color: Option<OsString>) -> bool {
    stderr_is_terminal && no_color.is_none_or(|v| v.is_empty())
}

/// JSON lines with the current span's fields, appended to `path`.
fn file_layer<S>(path: &Path) -> anyhow::Result<impl Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let file = open_log_file(path)?;
    Ok(fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(EnvFilter::new(FILE_DIRECTIVE)))
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_directive_wins_over_log_level() {
        let filter = stderr_filter(Some("fgexec=trace"), Some("warn")).unwrap();
        assert!(filter.to_string().contains("fgexec=trace"), "{filter}");
    }

    #[test]
    fn log_level_then_default() {
        assert!(stderr_filter(None, Some("debug")).unwrap().to_string().contains("debug"));
        assert!(stderr_filter(Some(" "), None).unwrap().to_string().contains("info"));
    }

    #[test]
    fn invalid_directive_names_its_source() {
        let err = stderr_filter(None, Some("fgexec=loud")).unwrap_err();
        assert!(err.to_string().contains("--log-level"), "{err}");
    }

    #[test]
    fn color_only_on_a_terminal_without_no_color() {
        assert!(use_ansi(true, None));
        assert!(use_ansi(true, Some(OsString::new())));
        assert!(!use_ansi(true, Some("1".into())));
        assert!(!use_ansi(false, None));
    }

    #[test]
    fn open_log_file_creates_parent_dirs_and_appends() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("fgexec.log");
        for line in ["first", "second"] {
            writeln!(open_log_file(&path).unwrap(), "{line}").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn file_lines_carry_the_exec_span() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let subscriber = tracing_subscriber::registry().with(file_layer(&path).unwrap());

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("exec", cmd = "sh -c true", pid = 42u32);
            let _entered = span.enter();
            tracing::debug!("spawned child");
        });

        let contents = fs::read_to_string(&path).unwrap();
        let line: serde_json::Value =
            serde_json::from_str(contents.lines().next().expect("one line")).unwrap();
        assert_eq!(line["span"]["name"], "exec");
        assert_eq!(line["span"]["cmd"], "sh -c true");
        assert_eq!(line["span"]["pid"], 42);
        assert_eq!(line["fields"]["message"], "spawned child");
    }
}
