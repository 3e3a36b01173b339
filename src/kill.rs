//! Per-execution kill switch: lifecycle state, the finalize gate, and the
//! single place where signals are delivered to the child.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::reader::StreamName;

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Spawning,
    Running,
    Finalizing,
    Done,
}

/// Why a kill was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Timeout,
    Overflow(StreamName),
    /// A signal relayed from the parent process.
    Relay,
}

#[derive(Debug)]
struct Inner {
    state: State,
    pid: Option<Pid>,
    killed: bool,
    timed_out: bool,
}

/// Shared by the stream readers, the timeout timer and the signal relay.
///
/// Signals are only delivered while the state is `Running`. The first call
/// to [`KillSwitch::finalize`] closes the gate; every later kill request and
/// every later finalize call is a no-op.
///
/// Once an overflow has been recorded and the gate is closed, the switch
/// halts: readers stop and drop their pipe ends, so descendants of the
/// killed child that still hold the pipes cannot keep the execution open.
#[derive(Debug)]
pub struct KillSwitch {
    kill_signal: Signal,
    inner: Mutex<Inner>,
    overflow: OnceLock<StreamName>,
    halt: watch::Sender<bool>,
}

impl KillSwitch {
    pub fn new(kill_signal: Signal) -> Self {
        Self {
            kill_signal,
            inner: Mutex::new(Inner {
                state: State::Spawning,
                pid: None,
                killed: false,
                timed_out: false,
            }),
            overflow: OnceLock::new(),
            halt: watch::channel(false).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kill_signal(&self) -> Signal {
        self.kill_signal
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    /// `Spawning -> Running` once the child has a pid.
    pub fn arm(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        let mut inner = self.lock();
        if inner.state != State::Spawning {
            return false;
        }
        inner.pid = Some(Pid::from_raw(raw));
        inner.state = State::Running;
        true
    }

    /// Send the configured kill signal.
    pub fn kill(&self, reason: KillReason) -> bool {
        self.signal(self.kill_signal, reason)
    }

    /// Send `signal` to the child. Returns `true` when it was delivered.
    pub fn signal(&self, signal: Signal, reason: KillReason) -> bool {
        let mut inner = self.lock();
        let pid = match (inner.state, inner.pid) {
            (State::Running, Some(pid)) => pid,
            _ => return false,
        };
        match kill(pid, signal) {
            Ok(()) => {
                inner.killed = true;
                if reason == KillReason::Timeout {
                    inner.timed_out = true;
                }
                debug!(pid = pid.as_raw(), %signal, ?reason, "signal sent to child");
                true
            }
            Err(errno) => {
                debug!(pid = pid.as_raw(), %signal, %errno, "failed to signal child");
                false
            }
        }
    }

    /// Record an overflow on `stream` and kill the child.
    ///
    /// Only the first overflow across both streams is kept.
    pub fn record_overflow(&self, stream: StreamName) -> bool {
        if self.overflow.set(stream).is_err() {
            return false;
        }
        warn!(%stream, "maxBuffer length exceeded, killing child");
        self.kill(KillReason::Overflow(stream));
        if matches!(self.state(), State::Finalizing | State::Done) {
            self.halt.send_replace(true);
        }
        true
    }

    pub fn overflow(&self) -> Option<StreamName> {
        self.overflow.get().copied()
    }

    /// Watch that turns `true` when readers must stop.
    pub fn halted(&self) -> watch::Receiver<bool> {
        self.halt.subscribe()
    }

    /// Close the gate. Only the first caller gets `true`.
    pub fn finalize(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            State::Spawning | State::Running => {
                inner.state = State::Finalizing;
                inner.pid = None;
                // Checked under the lock; `record_overflow` sets before locking.
                if self.overflow.get().is_some() {
                    self.halt.send_replace(true);
                }
                true
            }
            State::Finalizing | State::Done => false,
        }
    }

    /// `Finalizing -> Done` once the outcome has been built.
    pub fn complete(&self) {
        let mut inner = self.lock();
        if inner.state == State::Finalizing {
            inner.state = State::Done;
        }
    }

    /// Whether any signal was successfully delivered to the child.
    pub fn killed(&self) -> bool {
        self.lock().killed
    }

    pub fn timed_out(&self) -> bool {
        self.lock().timed_out
    }
}
