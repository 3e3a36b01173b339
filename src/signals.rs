//! Signal names, parsing, and the fixed set of signals relayed to children.

use std::str::FromStr;

use nix::sys::signal::Signal;

/// Signals forwarded from the parent to a running child.
///
/// `SIGKILL` and `SIGSTOP` cannot be caught; `SIGUSR1` is left alone so
/// debuggers attached to the parent keep working.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const FORWARDED_SIGNALS: &[Signal] = &[
    Signal::SIGABRT,
    Signal::SIGALRM,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGVTALRM,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGUSR2,
    Signal::SIGTRAP,
    Signal::SIGSYS,
    Signal::SIGQUIT,
    Signal::SIGIO,
    Signal::SIGPWR,
];

/// Signals forwarded from the parent to a running child.
///
/// `SIGKILL` and `SIGSTOP` cannot be caught; `SIGUSR1` is left alone so
/// debuggers attached to the parent keep working.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const FORWARDED_SIGNALS: &[Signal] = &[
    Signal::SIGABRT,
    Signal::SIGALRM,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGVTALRM,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGUSR2,
    Signal::SIGTRAP,
    Signal::SIGSYS,
    Signal::SIGQUIT,
];

/// Default signal used to kill a child on timeout or overflow.
pub const DEFAULT_KILL_SIGNAL: Signal = Signal::SIGTERM;

/// Signal sent to a child when the parent is about to exit.
pub const fn hangup_signal() -> Signal {
    Signal::SIGHUP
}

/// Parse a signal name such as `SIGTERM`, `sigint` or `HUP`.
pub fn parse_signal_name(name: &str) -> Option<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    if upper.starts_with("SIG") {
        Signal::from_str(&upper).ok()
    } else {
        Signal::from_str(&format!("SIG{upper}")).ok()
    }
}

/// Map a raw signal number to a known signal.
pub fn signal_from_number(signo: i64) -> Option<Signal> {
    i32::try_from(signo)
        .ok()
        .and_then(|n| Signal::try_from(n).ok())
}
