//! # Modem State Table
//!
//! One record per physical modem slot, fixed at construction. Holds what the
//! arbiter knows about each modem: bound subscription, call activity, user
//! data setting, emergency-callback mode, and the last *confirmed* data state
//! (which lags the routing intent while a command is in flight).

use serde::{Deserialize, Serialize};

use crate::error::ArbiterError;
use crate::ids::{CommandToken, SlotId, SubId};

/// Voice call activity on a modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    #[default]
    Idle,
    Active,
    Holding,
    Ringing,
}

impl CallState {
    /// Active or holding calls keep a modem out of data selection.
    pub fn is_in_call(self) -> bool {
        matches!(self, CallState::Active | CallState::Holding)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModemSlot {
    pub slot: SlotId,
    pub subscription: Option<SubId>,
    /// Last command-confirmed data-allowed value.
    pub data_allowed: bool,
    pub call: CallState,
    pub data_enabled: bool,
    /// Present iff a command for this slot is in flight.
    pub pending: Option<CommandToken>,
    pub ecbm: bool,
    /// Set after command retries are exhausted; cleared by cooldown or a
    /// later successful command.
    pub degraded: bool,
}

impl ModemSlot {
    fn new(slot: SlotId) -> Self {
        Self {
            slot,
            subscription: None,
            data_allowed: false,
            call: CallState::Idle,
            data_enabled: true,
            pending: None,
            ecbm: false,
            degraded: false,
        }
    }

    /// Whether data selection (opportunistic or demand-driven) may pick this
    /// slot.
    pub fn is_selectable(&self) -> bool {
        self.subscription.is_some() && self.data_enabled && !self.call.is_in_call() && !self.degraded
    }
}

#[derive(Debug)]
pub struct ModemTable {
    slots: Vec<ModemSlot>,
    /// Last confirmed preferred data modem (preferred-data-modem mode).
    preferred_confirmed: Option<SlotId>,
}

impl ModemTable {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|i| ModemSlot::new(SlotId(i))).collect(),
            preferred_confirmed: None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[ModemSlot] {
        &self.slots
    }

    pub fn get(&self, slot: SlotId) -> Result<&ModemSlot, ArbiterError> {
        self.slots
            .get(slot.index())
            .ok_or(ArbiterError::UnknownSlot(slot))
    }

    fn get_mut(&mut self, slot: SlotId) -> Result<&mut ModemSlot, ArbiterError> {
        self.slots
            .get_mut(slot.index())
            .ok_or(ArbiterError::UnknownSlot(slot))
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        slot.index() < self.slots.len()
    }

    /// First slot bound to `sub`.
    pub fn slot_for_subscription(&self, sub: SubId) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|s| s.subscription == Some(sub))
            .map(|s| s.slot)
    }

    pub fn subscription_of(&self, slot: SlotId) -> Option<SubId> {
        self.slots.get(slot.index()).and_then(|s| s.subscription)
    }

    /// Last confirmed data-allowed value for `slot`.
    pub fn is_data_allowed(&self, slot: SlotId) -> bool {
        self.slots.get(slot.index()).is_some_and(|s| s.data_allowed)
    }

    pub fn preferred_confirmed(&self) -> Option<SlotId> {
        self.preferred_confirmed
    }

    // ─── Mutations (each returns whether anything changed) ──────────────

    pub fn bind_subscription(
        &mut self,
        slot: SlotId,
        sub: Option<SubId>,
    ) -> Result<bool, ArbiterError> {
        let s = self.get_mut(slot)?;
        Ok(replace(&mut s.subscription, sub))
    }

    pub fn set_call_state(&mut self, slot: SlotId, call: CallState) -> Result<bool, ArbiterError> {
        let s = self.get_mut(slot)?;
        Ok(replace(&mut s.call, call))
    }

    pub fn set_data_enabled(&mut self, slot: SlotId, enabled: bool) -> Result<bool, ArbiterError> {
        let s = self.get_mut(slot)?;
        Ok(replace(&mut s.data_enabled, enabled))
    }

    pub fn set_ecbm(&mut self, slot: SlotId, ecbm: bool) -> Result<bool, ArbiterError> {
        let s = self.get_mut(slot)?;
        Ok(replace(&mut s.ecbm, ecbm))
    }

    pub fn set_degraded(&mut self, slot: SlotId, degraded: bool) -> Result<bool, ArbiterError> {
        let s = self.get_mut(slot)?;
        Ok(replace(&mut s.degraded, degraded))
    }

    pub fn set_pending(
        &mut self,
        slot: SlotId,
        token: Option<CommandToken>,
    ) -> Result<(), ArbiterError> {
        self.get_mut(slot)?.pending = token;
        Ok(())
    }

    pub fn confirm_data_allowed(&mut self, slot: SlotId, allowed: bool) -> Result<(), ArbiterError> {
        self.get_mut(slot)?.data_allowed = allowed;
        Ok(())
    }

    /// Records a confirmed preferred data modem. Only that slot carries data
    /// afterwards, so the per-slot confirmed flags follow.
    pub fn confirm_preferred(&mut self, slot: SlotId) -> Result<(), ArbiterError> {
        if !self.contains(slot) {
            return Err(ArbiterError::UnknownSlot(slot));
        }
        self.preferred_confirmed = Some(slot);
        for s in &mut self.slots {
            s.data_allowed = s.slot == slot;
        }
        Ok(())
    }
}

fn replace<T: PartialEq>(field: &mut T, value: T) -> bool {
    if *field == value {
        false
    } else {
        *field = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_start_unbound_and_disallowed() {
        let table = ModemTable::new(2);
        assert_eq!(table.len(), 2);
        for s in table.slots() {
            assert!(s.subscription.is_none());
            assert!(!s.data_allowed);
            assert!(s.data_enabled);
            assert!(!s.is_selectable(), "unbound slot is never selectable");
        }
    }

    #[test]
    fn mutations_report_change() {
        let mut table = ModemTable::new(2);
        assert!(table.bind_subscription(SlotId(0), Some(SubId(1))).unwrap());
        assert!(!table.bind_subscription(SlotId(0), Some(SubId(1))).unwrap());
        assert!(table.set_call_state(SlotId(0), CallState::Active).unwrap());
        assert!(!table.set_call_state(SlotId(0), CallState::Active).unwrap());
        assert!(table.set_data_enabled(SlotId(1), false).unwrap());
        assert!(table.set_ecbm(SlotId(1), true).unwrap());
    }

    #[test]
    fn unknown_slot_is_rejected() {
        let mut table = ModemTable::new(1);
        let err = table.bind_subscription(SlotId(3), None).unwrap_err();
        assert!(matches!(err, ArbiterError::UnknownSlot(SlotId(3))));
        assert!(!table.is_data_allowed(SlotId(3)));
    }

    #[test]
    fn selectable_requires_bound_enabled_idle_healthy() {
        let mut table = ModemTable::new(1);
        let slot = SlotId(0);
        table.bind_subscription(slot, Some(SubId(5))).unwrap();
        assert!(table.get(slot).unwrap().is_selectable());

        table.set_call_state(slot, CallState::Holding).unwrap();
        assert!(!table.get(slot).unwrap().is_selectable());
        table.set_call_state(slot, CallState::Ringing).unwrap();
        assert!(table.get(slot).unwrap().is_selectable());

        table.set_data_enabled(slot, false).unwrap();
        assert!(!table.get(slot).unwrap().is_selectable());
        table.set_data_enabled(slot, true).unwrap();

        table.set_degraded(slot, true).unwrap();
        assert!(!table.get(slot).unwrap().is_selectable());
    }

    #[test]
    fn confirm_preferred_moves_data_flag() {
        let mut table = ModemTable::new(2);
        table.confirm_preferred(SlotId(1)).unwrap();
        assert!(!table.is_data_allowed(SlotId(0)));
        assert!(table.is_data_allowed(SlotId(1)));
        table.confirm_preferred(SlotId(0)).unwrap();
        assert!(table.is_data_allowed(SlotId(0)));
        assert!(!table.is_data_allowed(SlotId(1)));
        assert_eq!(table.preferred_confirmed(), Some(SlotId(0)));
    }

    #[test]
    fn lookup_by_subscription() {
        let mut table = ModemTable::new(2);
        table.bind_subscription(SlotId(1), Some(SubId(2))).unwrap();
        assert_eq!(table.slot_for_subscription(SubId(2)), Some(SlotId(1)));
        assert_eq!(table.slot_for_subscription(SubId(9)), None);
        assert_eq!(table.subscription_of(SlotId(1)), Some(SubId(2)));
    }
}
