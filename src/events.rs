//! Process-wide parent events: relayed OS signals and imminent exit.
//!
//! Listeners are registered per execution and removed through the
//! [`Subscription`] handle returned at subscribe time, so concurrent
//! executions never detach each other's listeners.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::signals::FORWARDED_SIGNALS;

/// Something that happened to the parent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentEvent {
    Signal(Signal),
    /// The parent is about to exit.
    Exit,
}

type Listener = Arc<dyn Fn(ParentEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_id: AtomicU64,
    exit_when_idle: AtomicBool,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to a listener registry.
#[derive(Clone, Default)]
pub struct ParentEvents {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for ParentEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentEvents")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

static PROCESS_EVENTS: OnceLock<ParentEvents> = OnceLock::new();

impl ParentEvents {
    /// A private hub that only sees events passed to [`ParentEvents::emit`].
    pub fn detached() -> Self {
        Self::default()
    }

    /// The process-wide hub, fed by real OS signals.
    ///
    /// The first call installs handlers for every signal in
    /// [`FORWARDED_SIGNALS`]. Handlers run on a dedicated thread with its
    /// own runtime, so they outlive whichever runtime made the first call.
    pub fn process() -> Self {
        PROCESS_EVENTS
            .get_or_init(|| {
                let events = ParentEvents::default();
                if let Err(e) = install_os_listeners(events.clone()) {
                    warn!("failed to install signal listeners: {e}");
                }
                events
            })
            .clone()
    }

    /// The process-wide hub, which also exits with `128 + signo` when a
    /// relayed signal arrives while no execution is listening.
    ///
    /// The installed handlers replace each signal's default disposition.
    /// A binary that owns its process opts in here to keep terminating on
    /// those signals; code embedding the engine uses
    /// [`ParentEvents::process`] and keeps its own handling.
    pub fn process_with_default_exit() -> Self {
        let events = Self::process();
        events.registry.exit_when_idle.store(true, Ordering::SeqCst);
        events
    }

    /// Register `listener`; it stays registered until the returned handle
    /// is dropped or [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ParentEvent) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().insert(id, Arc::new(listener));
        Subscription {
            events: self.clone(),
            id,
        }
    }

    /// Invoke every current listener with `event`; returns how many ran.
    pub fn emit(&self, event: ParentEvent) -> usize {
        let listeners: Vec<Listener> = self.registry.lock().values().cloned().collect();
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    /// Tell every active execution that the parent is about to exit.
    pub fn notify_exit(&self) -> usize {
        self.emit(ParentEvent::Exit)
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().len()
    }

    fn remove(&self, id: u64) -> bool {
        self.registry.lock().remove(&id).is_some()
    }

    fn dispatch_os_signal(&self, sig: Signal) -> usize {
        let delivered = self.emit(ParentEvent::Signal(sig));
        if delivered > 0 {
            debug!(%sig, listeners = delivered, "relayed parent signal");
        } else if self.registry.exit_when_idle.load(Ordering::SeqCst) {
            debug!(%sig, "no active execution, exiting");
            std::process::exit(128 + sig as i32);
        } else {
            debug!(%sig, "no active execution, signal ignored");
        }
        delivered
    }
}

/// Notify the process-wide hub that the parent is exiting, then exit.
pub fn exit(code: i32) -> ! {
    ParentEvents::process().notify_exit();
    std::process::exit(code)
}

/// Handle for one registered listener.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    events: ParentEvents,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.events.remove(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

fn install_os_listeners(events: ParentEvents) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    // Register on this thread so handlers are in place before we return.
    let mut streams = Vec::new();
    {
        let _guard = runtime.enter();
        for &sig in FORWARDED_SIGNALS {
            match signal(SignalKind::from_raw(sig as i32)) {
                Ok(stream) => streams.push((sig, stream)),
                Err(e) => warn!(%sig, "cannot listen for signal: {e}"),
            }
        }
    }

    std::thread::Builder::new()
        .name("fgexec-signals".into())
        .spawn(move || {
            runtime.block_on(async move {
                let mut tasks = JoinSet::new();
                for (sig, mut stream) in streams {
                    let events = events.clone();
                    tasks.spawn(async move {
                        while stream.recv().await.is_some() {
                            events.dispatch_os_signal(sig);
                        }
                    });
                }
                while tasks.join_next().await.is_some() {}
            });
        })?;
    Ok(())
}
