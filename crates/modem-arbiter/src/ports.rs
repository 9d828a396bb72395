//! Collaborator contracts.
//!
//! The arbiter never talks to the radio, the subscription database or the
//! validation service directly. It depends on these narrow traits, injected
//! at construction. Implementations report asynchronous outcomes back by
//! posting [`Event`](crate::event::Event)s on the arbiter's queue.

use std::time::Duration;

use serde::Serialize;

use crate::ids::{CommandToken, SlotId, SubId, ValidationTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    SetDataAllowed,
    SetPreferredDataModem,
}

/// A data-routing command for the radio layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ModemCommand {
    SetDataAllowed { slot: SlotId, allowed: bool },
    SetPreferredDataModem { slot: SlotId },
}

impl ModemCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            ModemCommand::SetDataAllowed { .. } => CommandKind::SetDataAllowed,
            ModemCommand::SetPreferredDataModem { .. } => CommandKind::SetPreferredDataModem,
        }
    }

    pub fn slot(&self) -> SlotId {
        match *self {
            ModemCommand::SetDataAllowed { slot, .. } => slot,
            ModemCommand::SetPreferredDataModem { slot } => slot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRequest {
    pub token: CommandToken,
    pub command: ModemCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRequest {
    pub ticket: ValidationTicket,
    pub sub: SubId,
    pub timeout: Duration,
    pub allow_downgrade: bool,
}

/// Which subscription occupies which slot, and the user's default for data.
pub trait SubscriptionDirectory: Send + Sync {
    fn subscription_for_slot(&self, slot: SlotId) -> Option<SubId>;
    fn default_data_subscription(&self) -> Option<SubId>;
}

/// The RIL / radio-config command transport.
pub trait ModemCommandChannel: Send + Sync {
    /// Sends the command and returns immediately. The implementation must
    /// later post exactly one `CommandCompleted` carrying `request.token`.
    fn submit(&self, request: CommandRequest);
}

/// Asynchronous connectivity validation.
pub trait ValidationService: Send + Sync {
    /// Starts validating `request.sub`. The implementation posts one
    /// `ValidationResult` carrying `request.ticket`.
    fn validate(&self, request: ValidationRequest);

    /// Abandons a validation. A result that still arrives for `ticket` is
    /// discarded by the arbiter.
    fn cancel(&self, ticket: ValidationTicket);
}
