//! Error taxonomy.
//!
//! Synchronous precondition failures are [`ArbiterError`]s. Everything that
//! happens asynchronously (command results, validation, emergency override)
//! is delivered as a value over a reply channel instead.

use thiserror::Error;

use crate::ids::SlotId;

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("unknown modem {0}")]
    UnknownSlot(SlotId),
    #[error("arbiter event queue is full")]
    QueueFull,
    #[error("arbiter worker has stopped")]
    Disconnected,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config TOML: {0}")]
    Parse(String),
    #[error("slot_count must be at least 1")]
    NoSlots,
    #[error("max_active_modems {max_active} must be within 1..={slots}")]
    ActiveCapOutOfRange { max_active: usize, slots: usize },
    #[error("preferred-data-modem mode needs max_active_modems = 1, got {0}")]
    PreferredModeNeedsSingleActive(usize),
}

/// Error classification carried by a modem command completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("modem reported a system error")]
    SystemError,
    #[error("radio not available")]
    RadioNotAvailable,
    #[error("request not supported")]
    RequestNotSupported,
    #[error("invalid arguments")]
    InvalidArguments,
    #[error("no completion before the wakelock timeout")]
    Timeout,
    #[error("radio error code {0}")]
    Other(i32),
}

impl RadioError {
    /// Errors that count toward the repetitive-system-error fault.
    pub fn is_system_error(&self) -> bool {
        matches!(self, RadioError::SystemError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_subject() {
        assert_eq!(
            ArbiterError::UnknownSlot(SlotId(4)).to_string(),
            "unknown modem slot4"
        );
        assert_eq!(RadioError::Other(38).to_string(), "radio error code 38");
    }

    #[test]
    fn only_system_error_is_classified() {
        assert!(RadioError::SystemError.is_system_error());
        assert!(!RadioError::Timeout.is_system_error());
        assert!(!RadioError::RadioNotAvailable.is_system_error());
    }
}
