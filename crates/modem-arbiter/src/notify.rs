//! Observer fan-out.
//!
//! Listeners register per [`Topic`] with a channel sender; the arbiter
//! publishes from its worker and never blocks on a slow listener. A full
//! listener misses the notification, a disconnected one is dropped.

use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::dispatch::Lane;
use crate::ids::{SlotId, SubId};
use crate::modem::ModemFault;
use crate::ports::ModemCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Active modem set or preferred data modem changed.
    ActiveModems,
    /// The subscription carrying default data changed.
    ActiveDataSubscription,
    /// Persistent faults and exhausted command retries.
    Faults,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Notification {
    ActiveModemsChanged {
        active: Vec<SlotId>,
        preferred: Option<SlotId>,
    },
    ActiveDataSubscriptionChanged {
        sub: Option<SubId>,
    },
    ModemFault {
        fault: ModemFault,
    },
    CommandFailed {
        lane: Lane,
        command: ModemCommand,
        error: String,
    },
}

impl Notification {
    pub fn topic(&self) -> Topic {
        match self {
            Notification::ActiveModemsChanged { .. } => Topic::ActiveModems,
            Notification::ActiveDataSubscriptionChanged { .. } => Topic::ActiveDataSubscription,
            Notification::ModemFault { .. } | Notification::CommandFailed { .. } => Topic::Faults,
        }
    }
}

#[derive(Debug, Default)]
pub struct Notifier {
    listeners: Vec<(Topic, Sender<Notification>)>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: Topic, tx: Sender<Notification>) {
        debug!(?topic, "listener registered");
        self.listeners.push((topic, tx));
    }

    /// Delivers to one listener only (registration replay).
    pub fn send_to(&self, tx: &Sender<Notification>, notification: Notification) {
        let _ = tx.try_send(notification);
    }

    pub fn publish(&mut self, notification: Notification) {
        let topic = notification.topic();
        self.listeners.retain(|(t, tx)| {
            if *t != topic {
                return true;
            }
            match tx.try_send(notification.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(?topic, "listener queue full, notification dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
