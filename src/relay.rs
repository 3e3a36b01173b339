//! Signal relay: for one execution, forward parent signals to the child.

use std::sync::Arc;

use tracing::debug;

use crate::events::{ParentEvent, ParentEvents, Subscription};
use crate::kill::{KillReason, KillSwitch};
use crate::signals::hangup_signal;

/// Active relay for one execution. Detach exactly once, when the controller
/// has finished.
#[derive(Debug)]
pub struct SignalRelay {
    subscription: Subscription,
}

impl SignalRelay {
    pub fn attach(events: &ParentEvents, switch: Arc<KillSwitch>) -> Self {
        let subscription = events.subscribe(move |event| {
            let sig = match event {
                ParentEvent::Signal(sig) => sig,
                ParentEvent::Exit => hangup_signal(),
            };
            if switch.signal(sig, KillReason::Relay) {
                debug!(?event, %sig, "relayed to child");
            }
        });
        Self { subscription }
    }

    pub fn detach(self) {
        self.subscription.unsubscribe();
    }
}
