//! Strongly-typed identifiers.
//!
//! Slots, subscriptions, demands, command tokens and validation tickets are
//! all small integers on the wire. Wrapping them keeps a subscription ID from
//! ever being passed where a slot index is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a physical modem slot, `0..slot_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// Subscription identifier as handed out by the subscription directory.
///
/// An unbound slot is modelled as `Option<SubId>::None`, never as a magic
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubId(pub i32);

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub{}", self.0)
    }
}

/// Identifier of a network demand, chosen by the demand source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DemandId(pub u64);

impl fmt::Display for DemandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "demand{}", self.0)
    }
}

/// Correlates a modem command with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandToken(pub u64);

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Correlates a validation request with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationTicket(pub u64);

impl fmt::Display for ValidationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "val#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_prefixed() {
        assert_eq!(SlotId(1).to_string(), "slot1");
        assert_eq!(SubId(7).to_string(), "sub7");
        assert_eq!(DemandId(3).to_string(), "demand3");
        assert_eq!(CommandToken(9).to_string(), "cmd#9");
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&SlotId(2)).unwrap();
        assert_eq!(json, "2");
        let sub: SubId = serde_json::from_str("-1").unwrap();
        assert_eq!(sub, SubId(-1));
        assert_eq!(serde_json::to_string(&CommandToken(9)).unwrap(), "9");
        let ticket: ValidationTicket = serde_json::from_str("4").unwrap();
        assert_eq!(ticket, ValidationTicket(4));
    }

    #[test]
    fn pending_token_serializes_with_slot() {
        let mut table = crate::modem::ModemTable::new(1);
        table.set_pending(SlotId(0), Some(CommandToken(3))).unwrap();
        let json = serde_json::to_value(table.get(SlotId(0)).unwrap()).unwrap();
        assert_eq!(json["pending"], 3);
    }
}
