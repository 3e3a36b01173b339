use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};

use fgexec::cli::{Cli, Commands, RunArgs};
use fgexec::config::RunConfig;
use fgexec::error::ExecError;
use fgexec::events::ParentEvents;
use fgexec::exec::Executor;
use fgexec::result::ExecResult;
use fgexec::run_summary::{build_summary, write_run_summary};
use fgexec::signals::FORWARDED_SIGNALS;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let executor = Executor::with_events(ParentEvents::process_with_default_exit());
    match run(cli, executor).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, executor: Executor) -> anyhow::Result<u8> {
    match cli.command {
        Commands::Signals => {
            for sig in FORWARDED_SIGNALS {
                println!("{sig}");
            }
            Ok(0)
        }
        Commands::Run(args) => run_command(args, executor).await,
    }
}

async fn run_command(args: RunArgs, executor: Executor) -> anyhow::Result<u8> {
    let config = RunConfig::load(args.config.as_deref(), &args)?;

    fgexec::logging::init(config.log_level.as_deref(), config.log_file.as_deref())?;

    let Some((program, rest)) = args.command.split_first() else {
        anyhow::bail!("no command given");
    };
    let request = config.options.resolve(program.as_str(), rest.iter().cloned())?;
    let policy = config.options.throw_policy();
    let command_line = request.command_line();

    info!(
        command = %command_line,
        cwd = %request.cwd.display(),
        ?policy,
        timeout_ms = request
            .timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        "running command"
    );

    let started = Instant::now();
    let outcome = executor
        .exec_deferred(&request, policy, |result| -> anyhow::Result<()> {
            if let Some(path) = &config.summary_path {
                let summary = build_summary(&command_line, result, started.elapsed());
                write_run_summary(&summary, path)?;
            }
            Ok(())
        })
        .await;

    match outcome {
        Ok((result, ())) => {
            if args.json {
                println!("{}", serde_json::to_string(&result)?);
            }
            if let Some(err) = &result.error {
                info!(code = %err.code(), "{err}");
            }
            Ok(exit_code_of_result(&result))
        }
        Err(e) => match e.downcast_ref::<ExecError>() {
            Some(exec_err @ ExecError::Failed { .. }) => {
                error!(code = %exec_err.code(), "{exec_err}");
                Ok(exit_code_of_error(exec_err))
            }
            _ => Err(e),
        },
    }
}

/// Exit code mirroring the child: its status, or `128 + signo` for a
/// signal death, or 1 when neither is known.
fn exit_code_of_result(result: &ExecResult) -> u8 {
    if result.error.is_none() {
        return 0;
    }
    exit_code_from(result.status, result.signal.map(|s| s as i32))
}

fn exit_code_of_error(err: &ExecError) -> u8 {
    match err {
        ExecError::Failed { code, signal, .. } => exit_code_from(*code, signal.map(|s| s as i32)),
        _ => 1,
    }
}

fn exit_code_from(status: Option<i32>, signo: Option<i32>) -> u8 {
    match (status, signo) {
        (Some(code), _) => (code & 0xff) as u8,
        (None, Some(signo)) => (128 + signo).clamp(0, 255) as u8,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn executor() -> Executor {
        Executor::with_events(ParentEvents::detached())
    }

    async fn run_args(args: &[&str]) -> anyhow::Result<u8> {
        let mut argv = vec!["fgexec", "run"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        run(cli, executor()).await
    }

    #[tokio::test]
    async fn signals_subcommand_succeeds() {
        let cli = Cli::try_parse_from(["fgexec", "signals"]).unwrap();
        assert_eq!(run(cli, executor()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn successful_command_exits_zero() {
        assert_eq!(run_args(&["--", "sh", "-c", "exit 0"]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_command_exit_status_is_mirrored() {
        let code = run_args(&["--silent", "--", "sh", "-c", "exit 3"]).await.unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn never_policy_still_mirrors_the_status() {
        let code = run_args(&["--throw-exec-error", "never", "--", "sh", "-c", "exit 7"])
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn timed_out_command_exits_with_signal_code() {
        let code = run_args(&["--timeout", "50", "--", "sleep", "5"]).await.unwrap();
        assert_eq!(code, 128 + 15);
    }

    #[tokio::test]
    async fn late_policy_writes_the_summary_before_failing() {
        let dir = tempfile::tempdir().unwrap();
        let summary = dir.path().join("summary.json");
        let code = run_args(&[
            "--silent",
            "--throw-exec-error",
            "late",
            "--summary",
            summary.to_str().unwrap(),
            "--",
            "sh",
            "-c",
            "echo done; exit 2",
        ])
        .await
        .unwrap();
        assert_eq!(code, 2);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&summary).unwrap()).unwrap();
        assert_eq!(json["status"], 2);
        assert_eq!(json["stdout_bytes"], 5);
        assert_eq!(json["error_code"], "2");
    }

    #[tokio::test]
    async fn invalid_option_fails_before_spawning() {
        let err = run_args(&["--timeout", "NaN", "--", "sh", "-c", "exit 0"])
            .await
            .unwrap_err();
        let exec_err = err.downcast_ref::<ExecError>().expect("validation error");
        assert!(exec_err.is_validation());
    }

    #[tokio::test]
    async fn text_timeout_is_out_of_range() {
        let err = run_args(&["--timeout", "abc", "--", "sh", "-c", "exit 0"])
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ExecError>().map(|e| e.code().to_string()),
            Some(fgexec::error::ERR_OUT_OF_RANGE.to_owned())
        );
    }

    #[tokio::test]
    async fn missing_command_is_an_engine_error() {
        let err = run_args(&["--", "/nonexistent/fgexec-missing"]).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ExecError>().map(|e| e.code().to_string()),
            Some("ENOENT".to_owned())
        );
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(exit_code_from(Some(0), None), 0);
        assert_eq!(exit_code_from(Some(256 + 4), None), 4);
        assert_eq!(exit_code_from(None, Some(9)), 137);
        assert_eq!(exit_code_from(None, None), 1);
    }
}
