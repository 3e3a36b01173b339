//! Execution façade: run one command in the foreground and turn its outcome
//! into an [`ExecResult`] or an [`ExecError`].

use std::sync::Arc;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::controller::{self, Outcome, Termination};
use crate::error::ExecError;
use crate::events::ParentEvents;
use crate::kill::KillSwitch;
use crate::relay::SignalRelay;
use crate::request::ExecRequest;
use crate::result::ExecResult;

/// When an execution failure is surfaced relative to a follow-up step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrowPolicy {
    /// Fail immediately; the follow-up only runs after a success.
    #[default]
    Early,
    /// Run the follow-up, then surface the failure.
    Late,
    /// Run the follow-up and leave the failure in [`ExecResult::error`].
    Never,
}

impl ThrowPolicy {
    /// Parse a policy label. Anything unrecognized behaves as `early`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "late" => ThrowPolicy::Late,
            "never" => ThrowPolicy::Never,
            _ => ThrowPolicy::Early,
        }
    }
}

/// Runs commands with parent signals relayed from an event hub.
#[derive(Debug, Clone)]
pub struct Executor {
    events: ParentEvents,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// An executor fed by real OS signals through [`ParentEvents::process`].
    pub fn new() -> Self {
        Self::with_events(ParentEvents::process())
    }

    pub fn with_events(events: ParentEvents) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &ParentEvents {
        &self.events
    }

    /// Run `request` to completion.
    ///
    /// Spawn failures are always returned as `Err`. Other failures are
    /// returned as `Err` when `request.fail_fast` is set and otherwise land
    /// in [`ExecResult::error`].
    pub async fn exec(&self, request: &ExecRequest) -> Result<ExecResult, ExecError> {
        let switch = Arc::new(KillSwitch::new(request.kill_signal));
        let relay = SignalRelay::attach(&self.events, Arc::clone(&switch));
        let outcome = controller::run(request, &switch).await;
        relay.detach();

        let mut result = settle(outcome)?;
        if request.fail_fast {
            if let Some(error) = result.take_error() {
                return Err(error);
            }
        }
        Ok(result)
    }

    /// Run `request`, then `follow_up`, surfacing an execution failure
    /// according to `policy`.
    ///
    /// With [`ThrowPolicy::Late`] a follow-up error takes precedence over the
    /// deferred execution failure.
    pub async fn exec_deferred<F, T, E>(
        &self,
        request: &ExecRequest,
        policy: ThrowPolicy,
        follow_up: F,
    ) -> Result<(ExecResult, T), E>
    where
        F: FnOnce(&ExecResult) -> Result<T, E>,
        E: From<ExecError>,
    {
        let mut request = request.clone();
        request.fail_fast = policy == ThrowPolicy::Early;
        let mut result = self.exec(&request).await?;

        let value = follow_up(&result)?;
        if policy == ThrowPolicy::Late {
            if let Some(error) = result.take_error() {
                return Err(error.into());
            }
        }
        Ok((result, value))
    }
}

/// Run `request` with the process-wide event hub.
pub async fn exec(request: &ExecRequest) -> Result<ExecResult, ExecError> {
    Executor::new().exec(request).await
}

/// Classify a finished execution. Only a spawn failure is returned as `Err`.
fn settle(outcome: Outcome) -> Result<ExecResult, ExecError> {
    let Outcome {
        cmd,
        pid,
        termination,
        stdout,
        stderr,
        killed,
        timed_out,
        overflow,
        piped,
    } = outcome;

    let (status, signal) = match &termination {
        Termination::Exited(code) => (Some(*code), None),
        Termination::Signaled(signo) => (None, Signal::try_from(*signo).ok()),
        Termination::SpawnFailed(_) | Termination::Failed(_) => (None, None),
    };

    let error = match termination {
        Termination::SpawnFailed(source) => {
            return Err(ExecError::Spawn { cmd, source });
        }
        Termination::Failed(source) => Some(ExecError::Io { cmd, source }),
        _ if overflow.is_some() => overflow.map(|stream| ExecError::MaxBuffer { cmd, stream }),
        Termination::Exited(0) => None,
        Termination::Exited(_) | Termination::Signaled(_) => {
            let stderr = if piped {
                stderr.get().to_text_lossy().into_owned()
            } else {
                String::new()
            };
            Some(ExecError::Failed {
                cmd,
                code: status,
                signal,
                killed,
                timed_out,
                stderr,
            })
        }
    };

    if let Some(error) = &error {
        debug!(pid, code = %error.code(), "execution failed: {error}");
    }
    Ok(ExecResult::new(status, signal, pid, error, stdout, stderr))
}
