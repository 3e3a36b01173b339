use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::RunArgs;
use crate::command::ScriptRuntime;
use crate::error::ConfigError;
use crate::options::{ExecOptions, OptionValue};

// Precedence: CLI > env > file > defaults.

const ENV_PREFIX: &str = "FGEXEC_";

/// Resolved configuration for one `fgexec run`.
///
/// Execution options stay loosely typed here; they are validated when
/// [`ExecOptions::resolve`] builds the request, so a bad value is reported
/// with its validation code no matter which layer it came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunConfig {
    pub options: ExecOptions,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    /// Where to write the JSON run summary. No summary when `None`.
    pub summary_path: Option<PathBuf>,
}

/// TOML-deserializable config file representation. All fields optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    cwd: Option<PathBuf>,
    encoding: Option<String>,
    env: Option<BTreeMap<String, String>>,
    uid: Option<OptionValue>,
    gid: Option<OptionValue>,
    kill_signal: Option<OptionValue>,
    max_buffer: Option<OptionValue>,
    silent: Option<bool>,
    throw_exec_error: Option<String>,
    timeout: Option<OptionValue>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    summary_path: Option<PathBuf>,
    script_runtime: Option<ScriptRuntime>,
}

/// Intermediate layer where every field is optional, used to merge sources.
#[derive(Debug, Default)]
struct ConfigLayer {
    cwd: Option<PathBuf>,
    encoding: Option<String>,
    env: Option<BTreeMap<String, String>>,
    uid: Option<OptionValue>,
    gid: Option<OptionValue>,
    kill_signal: Option<OptionValue>,
    max_buffer: Option<OptionValue>,
    silent: Option<bool>,
    throw_exec_error: Option<String>,
    timeout: Option<OptionValue>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    summary_path: Option<PathBuf>,
    script_runtime: Option<ScriptRuntime>,
}

impl RunConfig {
    /// Load configuration with precedence: CLI > env > file > defaults.
    ///
    /// `config_path`: optional path to a TOML config file.
    /// `cli_args`: values provided on the command line.
    pub fn load(config_path: Option<&Path>, cli_args: &RunArgs) -> Result<Self, ConfigError> {
        Self::load_with_env(config_path, cli_args, real_env_var)
    }

    /// Internal constructor that accepts an env-var lookup function,
    /// enabling deterministic testing without process-global mutation.
    fn load_with_env(
        config_path: Option<&Path>,
        cli_args: &RunArgs,
        env_fn: fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file_layer = match config_path {
            Some(path) => load_file_layer(path)?,
            None => ConfigLayer::default(),
        };
        let env_layer = load_env_layer(env_fn)?;
        let cli_layer = cli_layer_from(cli_args)?;

        let merged = merge_layers(file_layer, env_layer, cli_layer);

        Ok(RunConfig {
            options: ExecOptions {
                cwd: merged.cwd,
                encoding: merged.encoding,
                env: merged.env,
                uid: merged.uid,
                gid: merged.gid,
                kill_signal: merged.kill_signal,
                max_buffer: merged.max_buffer,
                silent: merged.silent.unwrap_or(false),
                throw_exec_error: merged.throw_exec_error,
                timeout: merged.timeout,
                script_runtime: merged.script_runtime,
            },
            log_level: merged.log_level,
            log_file: merged.log_file,
            summary_path: merged.summary_path,
        })
    }
}

fn load_file_layer(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let fc: FileConfig = toml::from_str(&contents).map_err(|source| ConfigError::ParseFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ConfigLayer {
        cwd: fc.cwd,
        encoding: fc.encoding,
        env: fc.env,
        uid: fc.uid,
        gid: fc.gid,
        kill_signal: fc.kill_signal,
        max_buffer: fc.max_buffer,
        silent: fc.silent,
        throw_exec_error: fc.throw_exec_error,
        timeout: fc.timeout,
        log_level: fc.log_level,
        log_file: fc.log_file,
        summary_path: fc.summary_path,
        script_runtime: fc.script_runtime,
    })
}

fn real_env_var(suffix: &str) -> Option<String> {
    let key = format!("{ENV_PREFIX}{suffix}");
    env::var(&key).ok().filter(|v| !v.is_empty())
}

fn load_env_layer(env_fn: fn(&str) -> Option<String>) -> Result<ConfigLayer, ConfigError> {
    Ok(ConfigLayer {
        cwd: env_fn("CWD").map(PathBuf::from),
        encoding: env_fn("ENCODING"),
        env: env_fn("ENV")
            .map(|s| {
                parse_env_entries(s.split(',').map(str::trim).filter(|e| !e.is_empty())).map_err(
                    |e| ConfigError::EnvParse {
                        var: format!("{ENV_PREFIX}ENV"),
                        detail: e.to_string(),
                    },
                )
            })
            .transpose()?,
        uid: env_fn("UID").as_deref().map(OptionValue::parse),
        gid: env_fn("GID").as_deref().map(OptionValue::parse),
        kill_signal: env_fn("KILL_SIGNAL").as_deref().map(OptionValue::parse),
        max_buffer: env_fn("MAX_BUFFER").as_deref().map(OptionValue::parse),
        silent: parse_env_bool(env_fn, "SILENT")?,
        throw_exec_error: env_fn("THROW_EXEC_ERROR"),
        timeout: env_fn("TIMEOUT").as_deref().map(OptionValue::parse),
        log_level: env_fn("LOG_LEVEL"),
        log_file: env_fn("LOG_FILE").map(PathBuf::from),
        summary_path: env_fn("SUMMARY_PATH").map(PathBuf::from),
        script_runtime: None,
    })
}

fn parse_env_bool(
    env_fn: fn(&str) -> Option<String>,
    suffix: &str,
) -> Result<Option<bool>, ConfigError> {
    match env_fn(suffix) {
        Some(s) => s
            .parse::<bool>()
            .map(Some)
            .map_err(|e| ConfigError::EnvParse {
                var: format!("{ENV_PREFIX}{suffix}"),
                detail: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Parse `KEY=VALUE` entries; the value may itself contain `=`.
fn parse_env_entries<'a>(
    entries: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, String>, ConfigError> {
    entries
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
            _ => Err(ConfigError::EnvEntry {
                entry: entry.to_owned(),
            }),
        })
        .collect()
}

fn cli_layer_from(args: &RunArgs) -> Result<ConfigLayer, ConfigError> {
    let env = if args.env.is_empty() {
        None
    } else {
        Some(parse_env_entries(args.env.iter().map(String::as_str))?)
    };
    Ok(ConfigLayer {
        cwd: args.cwd.clone(),
        encoding: args.encoding.clone(),
        env,
        uid: args.uid.as_deref().map(OptionValue::parse),
        gid: args.gid.as_deref().map(OptionValue::parse),
        kill_signal: args.kill_signal.as_deref().map(OptionValue::parse),
        max_buffer: args.max_buffer.as_deref().map(OptionValue::parse),
        silent: if args.silent { Some(true) } else { None },
        throw_exec_error: args.throw_exec_error.clone(),
        timeout: args.timeout.as_deref().map(OptionValue::parse),
        log_level: args.log_level.clone(),
        log_file: args.log_file.clone(),
        summary_path: args.summary_path.clone(),
        script_runtime: None,
    })
}

/// Merge three layers. For each field, pick CLI first, then env, then file.
/// Environment tables are merged key by key with the same precedence.
fn merge_layers(file: ConfigLayer, env: ConfigLayer, cli: ConfigLayer) -> ConfigLayer {
    ConfigLayer {
        cwd: cli.cwd.or(env.cwd).or(file.cwd),
        encoding: cli.encoding.or(env.encoding).or(file.encoding),
        env: merge_env_tables([file.env, env.env, cli.env]),
        uid: cli.uid.or(env.uid).or(file.uid),
        gid: cli.gid.or(env.gid).or(file.gid),
        kill_signal: cli.kill_signal.or(env.kill_signal).or(file.kill_signal),
        max_buffer: cli.max_buffer.or(env.max_buffer).or(file.max_buffer),
        silent: cli.silent.or(env.silent).or(file.silent),
        throw_exec_error: cli
            .throw_exec_error
            .or(env.throw_exec_error)
            .or(file.throw_exec_error),
        timeout: cli.timeout.or(env.timeout).or(file.timeout),
        log_level: cli.log_level.or(env.log_level).or(file.log_level),
        log_file: cli.log_file.or(env.log_file).or(file.log_file),
        summary_path: cli.summary_path.or(env.summary_path).or(file.summary_path),
        script_runtime: cli
            .script_runtime
            .or(env.script_runtime)
            .or(file.script_runtime),
    }
}

/// Later tables override earlier ones. `None` when no layer set a table.
fn merge_env_tables<const N: usize>(
    tables: [Option<BTreeMap<String, String>>; N],
) -> Option<BTreeMap<String, String>> {
    tables.into_iter().flatten().reduce(|mut merged, table| {
        merged.extend(table);
        merged
    })
}
