//! Child process controller: spawn, capture, time out, and produce exactly
//! one terminal outcome.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, field, info_span, warn};

use crate::accumulator::{ChunkAccumulator, Encoding, LazyOutput};
use crate::command::Invocation;
use crate::kill::{KillReason, KillSwitch};
use crate::reader::{BoundedReader, StreamName};
use crate::request::{ExecRequest, StdioMode};

/// How the child ended.
#[derive(Debug)]
pub enum Termination {
    Exited(i32),
    /// Death by a signal, as a raw signal number.
    Signaled(i32),
    /// The process could not be started.
    SpawnFailed(io::Error),
    /// Waiting for the process or reading its output failed.
    Failed(io::Error),
}

/// Terminal outcome of one execution, built exactly once.
#[derive(Debug)]
pub struct Outcome {
    pub cmd: String,
    pub pid: Option<u32>,
    pub termination: Termination,
    pub stdout: LazyOutput,
    pub stderr: LazyOutput,
    pub killed: bool,
    pub timed_out: bool,
    pub overflow: Option<StreamName>,
    pub piped: bool,
}

type ReaderTask = JoinHandle<io::Result<ChunkAccumulator>>;

/// Run `request` to completion.
///
/// Kill requests from the readers, the timer, and the signal relay all go
/// through `switch`; the outcome is built after the child's exit has been
/// observed and its output streams have closed.
///
/// Everything logged for the run, the reader tasks included, sits inside an
/// `exec` span carrying `cmd` and, once spawned, `pid`.
pub async fn run(request: &ExecRequest, switch: &Arc<KillSwitch>) -> Outcome {
    let invocation = Invocation::resolve(request).await;
    let cmd = invocation.command_line();
    let span = info_span!("exec", cmd = %cmd, pid = field::Empty);
    run_invocation(request, invocation, cmd, switch)
        .instrument(span)
        .await
}

async fn run_invocation(
    request: &ExecRequest,
    invocation: Invocation,
    cmd: String,
    switch: &Arc<KillSwitch>,
) -> Outcome {
    let piped = request.stdio == StdioMode::Piped;

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(&request.cwd)
        .kill_on_drop(true);
    if let Some(env) = &request.env {
        command.env_clear().envs(env);
    }
    if let Some(uid) = request.uid {
        command.uid(uid);
    }
    if let Some(gid) = request.gid {
        command.gid(gid);
    }
    match request.stdio {
        StdioMode::Inherited => {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        StdioMode::Piped => {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!(error = %e, "spawn failed");
            switch.finalize();
            let outcome = Outcome::without_output(
                cmd,
                None,
                Termination::SpawnFailed(e),
                request.encoding,
                piped,
            );
            switch.complete();
            return outcome;
        }
    };

    let pid = child.id();
    if let Some(pid) = pid {
        Span::current().record("pid", pid);
        switch.arm(pid);
    }
    debug!("spawned child");

    let stdout = child.stdout.take().map(|stream| {
        let reader = BoundedReader::new(
            stream,
            StreamName::Stdout,
            request.max_buffer,
            request.encoding,
            Arc::clone(switch),
        );
        tokio::spawn(reader.run().in_current_span())
    });
    let stderr = child.stderr.take().map(|stream| {
        let reader = BoundedReader::new(
            stream,
            StreamName::Stderr,
            request.max_buffer,
            request.encoding,
            Arc::clone(switch),
        );
        tokio::spawn(reader.run().in_current_span())
    });

    let waited = wait_with_timeout(&mut child, request.timeout, switch).await;

    // The child was reaped inside `wait`; a relayed signal racing that reap
    // may still reach the stale pid until the gate closes here. The timer
    // went away with `wait_with_timeout`.
    switch.finalize();

    let outcome = match waited {
        Ok(status) => {
            let stdout = collect(stdout, request.encoding).await;
            let stderr = collect(stderr, request.encoding).await;
            match (stdout, stderr) {
                (Ok(stdout), Ok(stderr)) => Outcome {
                    cmd,
                    pid,
                    termination: termination_of(status),
                    stdout: LazyOutput::new(stdout),
                    stderr: LazyOutput::new(stderr),
                    killed: switch.killed(),
                    timed_out: switch.timed_out(),
                    overflow: switch.overflow(),
                    piped,
                },
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "reading child output failed");
                    Outcome::without_output(cmd, pid, Termination::Failed(e), request.encoding, piped)
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "waiting for child failed");
            for task in [stdout, stderr].into_iter().flatten() {
                task.abort();
            }
            let _ = child.start_kill();
            Outcome::without_output(cmd, pid, Termination::Failed(e), request.encoding, piped)
        }
    };
    switch.complete();
    debug!(termination = ?outcome.termination, "child finished");
    outcome
}

impl Outcome {
    fn without_output(
        cmd: String,
        pid: Option<u32>,
        termination: Termination,
        encoding: Encoding,
        piped: bool,
    ) -> Self {
        Self {
            cmd,
            pid,
            termination,
            stdout: LazyOutput::empty(encoding),
            stderr: LazyOutput::empty(encoding),
            killed: false,
            timed_out: false,
            overflow: None,
            piped,
        }
    }
}

/// Wait for the child, sending the kill signal once if `timeout` elapses.
async fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    switch: &KillSwitch,
) -> io::Result<ExitStatus> {
    let Some(timeout) = timeout else {
        return child.wait().await;
    };
    let timer = tokio::time::sleep(timeout);
    tokio::pin!(timer);
    let mut armed = true;
    loop {
        tokio::select! {
            status = child.wait() => return status,
            () = &mut timer, if armed => {
                armed = false;
                warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    signal = %switch.kill_signal(),
                    "child timed out"
                );
                switch.kill(KillReason::Timeout);
            }
        }
    }
}

async fn collect(task: Option<ReaderTask>, encoding: Encoding) -> io::Result<ChunkAccumulator> {
    match task {
        None => Ok(ChunkAccumulator::new(encoding)),
        Some(task) => task
            .await
            .map_err(|e| io::Error::other(format!("output reader task failed: {e}")))?,
    }
}

fn termination_of(status: ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited(code),
        (None, Some(signo)) => Termination::Signaled(signo),
        (None, None) => Termination::Failed(io::Error::other(format!(
            "unrecognized exit status: {status}"
        ))),
    }
}
