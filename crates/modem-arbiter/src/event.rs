//! Arbiter inputs.
//!
//! Everything that can change the routing decision arrives as an [`Event`]
//! on one bounded queue, from whichever thread observed it. Collaborators
//! (radio, validator, call tracker) hold an [`EventSender`].

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::demand::NetworkDemand;
use crate::error::{ArbiterError, RadioError};
use crate::ids::{CommandToken, DemandId, SlotId, SubId, ValidationTicket};
use crate::modem::CallState;
use crate::notify::{Notification, Topic};

/// Target of an opportunistic data switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpportunisticTarget {
    /// Go back to the default data subscription.
    Default,
    Subscription(SubId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpportunisticResult {
    Success,
    ValidationFailed,
    InactiveSubscription,
}

#[derive(Debug)]
pub enum Event {
    DemandUpserted(NetworkDemand),
    DemandReleased(DemandId),
    /// Slot bindings changed; re-read the subscription directory.
    SubscriptionsChanged,
    /// The default data subscription changed; re-read it.
    DefaultDataSubscriptionChanged,
    CallStateChanged {
        slot: SlotId,
        call: CallState,
    },
    DataEnabledChanged {
        slot: SlotId,
        enabled: bool,
    },
    EmergencyCallbackMode {
        slot: SlotId,
        active: bool,
    },
    CommandCompleted {
        token: CommandToken,
        result: Result<(), RadioError>,
    },
    ValidationCompleted {
        ticket: ValidationTicket,
        sub: SubId,
        success: bool,
    },
    SetOpportunisticData {
        target: OpportunisticTarget,
        need_validation: bool,
        reply: Sender<OpportunisticResult>,
    },
    OverrideForEmergency {
        slot: SlotId,
        sub: SubId,
        reply: Sender<bool>,
    },
    Subscribe {
        topic: Topic,
        tx: Sender<Notification>,
    },
    /// Stops the runtime worker. Ignored by the arbiter itself.
    Shutdown,
}

/// Cloneable producer side of the arbiter queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    /// Enqueues without blocking.
    pub fn try_send(&self, event: Event) -> Result<(), ArbiterError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => ArbiterError::QueueFull,
            TrySendError::Disconnected(_) => ArbiterError::Disconnected,
        })
    }

    /// Enqueues, waiting for room. Used for completions, which must not be
    /// lost. Never call from the arbiter's own worker.
    pub fn send(&self, event: Event) -> Result<(), ArbiterError> {
        self.tx.send(event).map_err(|_| ArbiterError::Disconnected)
    }

    pub fn command_completed(
        &self,
        token: CommandToken,
        result: Result<(), RadioError>,
    ) -> Result<(), ArbiterError> {
        self.send(Event::CommandCompleted { token, result })
    }

    pub fn validation_completed(
        &self,
        ticket: ValidationTicket,
        sub: SubId,
        success: bool,
    ) -> Result<(), ArbiterError> {
        self.send(Event::ValidationCompleted {
            ticket,
            sub,
            success,
        })
    }

    /// Non-blocking completion, for ports that answer from inside
    /// `submit` on the arbiter's own thread.
    pub fn command_completed_nowait(
        &self,
        token: CommandToken,
        result: Result<(), RadioError>,
    ) -> Result<(), ArbiterError> {
        self.try_send(Event::CommandCompleted { token, result })
    }

    pub fn validation_completed_nowait(
        &self,
        ticket: ValidationTicket,
        sub: SubId,
        success: bool,
    ) -> Result<(), ArbiterError> {
        self.try_send(Event::ValidationCompleted {
            ticket,
            sub,
            success,
        })
    }

    pub fn call_state_changed(&self, slot: SlotId, call: CallState) -> Result<(), ArbiterError> {
        self.try_send(Event::CallStateChanged { slot, call })
    }

    pub fn emergency_callback_mode(&self, slot: SlotId, active: bool) -> Result<(), ArbiterError> {
        self.try_send(Event::EmergencyCallbackMode { slot, active })
    }
}

/// Creates the arbiter queue.
pub fn event_queue(capacity: usize) -> (EventSender, Receiver<Event>) {
    let (tx, rx) = bounded(capacity);
    (EventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_reports_queue_full() {
        let (tx, _rx) = event_queue(1);
        tx.try_send(Event::SubscriptionsChanged).unwrap();
        assert!(matches!(
            tx.try_send(Event::SubscriptionsChanged),
            Err(ArbiterError::QueueFull)
        ));
    }

    #[test]
    fn dropped_receiver_reports_disconnected() {
        let (tx, rx) = event_queue(4);
        drop(rx);
        assert!(matches!(
            tx.command_completed(CommandToken(1), Ok(())),
            Err(ArbiterError::Disconnected)
        ));
    }
}
