//! Pure routing decision.
//!
//! `decide` maps one consistent snapshot of arbiter state to the set of
//! modems that should carry data. It has no side effects, so the controller
//! can call it on every event and diff the result.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::CommandMode;
use crate::demand::NetworkDemand;
use crate::ids::{DemandId, SlotId, SubId};
use crate::modem::ModemSlot;

#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    pub slots: &'a [ModemSlot],
    /// In evaluation order (descending score, ties by registration).
    pub demands: &'a [NetworkDemand],
    pub default_sub: Option<SubId>,
    /// Applied opportunistic subscription, if any.
    pub opportunistic: Option<SubId>,
    /// Slot pinned by an emergency override.
    pub emergency: Option<SlotId>,
    pub max_active: usize,
    pub mode: CommandMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    /// Slots that should carry data, ascending.
    pub active: Vec<SlotId>,
    /// Where default (unaffiliated) data goes.
    pub preferred: Option<SlotId>,
    pub preferred_sub: Option<SubId>,
    /// Which slot serves each satisfied demand.
    pub served: BTreeMap<DemandId, SlotId>,
}

impl RoutingDecision {
    pub fn is_active(&self, slot: SlotId) -> bool {
        self.active.contains(&slot)
    }

    pub fn serves(&self, demand: DemandId, slot: SlotId) -> bool {
        self.served.get(&demand) == Some(&slot)
    }
}

impl DecisionInput<'_> {
    fn slot(&self, slot: SlotId) -> Option<&ModemSlot> {
        self.slots.get(slot.index())
    }

    fn slot_for(&self, sub: SubId) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|s| s.subscription == Some(sub))
            .map(|s| s.slot)
    }

    fn selectable(&self, slot: SlotId) -> bool {
        self.slot(slot).is_some_and(ModemSlot::is_selectable)
    }

    /// Emergency slot, else the opportunistic slot, else the default-data
    /// slot. Only when the default slot is degraded does default data fall
    /// over to the first other selectable slot.
    pub fn preferred_slot(&self) -> Option<SlotId> {
        if let Some(slot) = self.emergency.filter(|s| self.slot(*s).is_some()) {
            return Some(slot);
        }
        if let Some(slot) = self
            .opportunistic
            .and_then(|sub| self.slot_for(sub))
            .filter(|s| self.selectable(*s))
        {
            return Some(slot);
        }
        let default_slot = self.default_sub.and_then(|sub| self.slot_for(sub))?;
        if self.selectable(default_slot) {
            return Some(default_slot);
        }
        if self.slot(default_slot).is_some_and(|s| s.degraded) {
            return self
                .slots
                .iter()
                .find(|s| s.is_selectable())
                .map(|s| s.slot);
        }
        None
    }
}

struct Selection {
    active: Vec<SlotId>,
    cap: usize,
}

impl Selection {
    fn contains(&self, slot: SlotId) -> bool {
        self.active.contains(&slot)
    }

    fn try_add(&mut self, slot: SlotId) -> bool {
        if self.contains(slot) {
            return true;
        }
        if self.active.len() >= self.cap {
            return false;
        }
        self.active.push(slot);
        true
    }
}

pub fn decide(input: &DecisionInput<'_>) -> RoutingDecision {
    let preferred = input.preferred_slot();
    let mut selection = Selection {
        active: Vec::with_capacity(input.max_active),
        cap: input.max_active.max(1),
    };

    // Emergency first, exempt from eligibility.
    if let Some(slot) = input.emergency.filter(|s| input.slot(*s).is_some()) {
        selection.try_add(slot);
    }

    if let Some(slot) = input
        .opportunistic
        .and_then(|sub| input.slot_for(sub))
        .filter(|s| input.selectable(*s))
    {
        selection.try_add(slot);
    }

    if input.mode == CommandMode::PreferredDataModem {
        if let Some(slot) = preferred {
            selection.try_add(slot);
        }
    }

    let mut served = BTreeMap::new();
    for demand in input.demands.iter().filter(|d| !d.restricted) {
        let candidate = match demand.affinity {
            Some(sub) => input.slot_for(sub),
            None => preferred,
        };
        let Some(slot) = candidate else {
            continue;
        };
        if selection.contains(slot) || (input.selectable(slot) && selection.try_add(slot)) {
            served.insert(demand.id, slot);
        }
    }

    // Restricted demands ride on whatever the selection settled on. They
    // never fall back to the default slot.
    for demand in input.demands.iter().filter(|d| d.restricted) {
        if let Some(slot) = demand
            .affinity
            .and_then(|sub| input.slot_for(sub))
            .filter(|s| selection.contains(*s))
        {
            served.insert(demand.id, slot);
        }
    }

    let mut active = selection.active;
    active.sort();
    RoutingDecision {
        active,
        preferred,
        preferred_sub: preferred.and_then(|s| input.slot(s)).and_then(|s| s.subscription),
        served,
    }
}
