//! # Arbiter
//!
//! The reactive half of the engine. Owns all arbiter state and is driven one
//! [`Event`] at a time from a single thread:
//!
//! 1. the event mutates state (demand registry, modem table, overrides),
//! 2. if anything changed, the decision is recomputed once,
//! 3. the decision is diffed against each lane's last-issued intent and only
//!    the differences are dispatched,
//! 4. observers are notified once per recomputation that changed routing.
//!
//! Timers are not threads: the owner asks for [`Arbiter::next_deadline`] and
//! calls [`Arbiter::fire_due_timers`] when it passes.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender};
use quanta::{Clock, Instant};
use tracing::{debug, info, warn};

use crate::config::{ArbiterConfig, CommandMode};
use crate::demand::{DemandRegistry, NetworkDemand, Upsert};
use crate::dispatch::{CommandDispatcher, DispatchCtx, DispatchEvent, Lane};
use crate::emergency::{EmergencyController, EmergencyPhase, RequestOutcome};
use crate::engine::decision::{decide, DecisionInput, RoutingDecision};
use crate::error::{ArbiterError, RadioError};
use crate::event::{Event, OpportunisticResult, OpportunisticTarget};
use crate::ids::{CommandToken, DemandId, SlotId, SubId, ValidationTicket};
use crate::modem::{CallState, ModemTable};
use crate::notify::{Notification, Notifier, Topic};
use crate::ports::{ModemCommand, ModemCommandChannel, SubscriptionDirectory, ValidationService};
use crate::timer::{TimerId, TimerKind, TimerQueue};
use crate::validation::ValidationCoordinator;

/// Collaborators injected into the arbiter.
#[derive(Clone)]
pub struct Ports {
    pub directory: Arc<dyn SubscriptionDirectory>,
    pub commands: Arc<dyn ModemCommandChannel>,
    pub validator: Arc<dyn ValidationService>,
}

/// An opportunistic switch waiting on validation.
#[derive(Debug)]
struct PendingSwitch {
    target: Option<SubId>,
    reply: Sender<OpportunisticResult>,
}

pub struct Arbiter {
    config: ArbiterConfig,
    ports: Ports,
    timers: TimerQueue,
    demands: DemandRegistry,
    modems: ModemTable,
    dispatcher: CommandDispatcher,
    validation: ValidationCoordinator<PendingSwitch>,
    emergency: EmergencyController,
    notifier: Notifier,
    default_sub: Option<SubId>,
    opportunistic: Option<SubId>,
    degraded_timers: HashMap<SlotId, TimerId>,
    decision: RoutingDecision,
    published: Arc<ArcSwap<RoutingDecision>>,
    dirty: bool,
    recomputes: u64,
}

impl Arbiter {
    /// Builds an arbiter and loads the initial slot bindings from the
    /// directory. Nothing is commanded until the first recomputation.
    pub fn new(config: ArbiterConfig, clock: Clock, ports: Ports) -> Result<Self, ArbiterError> {
        config.validate()?;
        let mut arbiter = Self {
            timers: TimerQueue::new(clock),
            demands: DemandRegistry::new(),
            modems: ModemTable::new(config.slot_count),
            dispatcher: CommandDispatcher::new(config.commands.clone(), config.slot_count),
            validation: ValidationCoordinator::new(config.validation.clone()),
            emergency: EmergencyController::new(config.emergency.clone()),
            notifier: Notifier::new(),
            default_sub: None,
            opportunistic: None,
            degraded_timers: HashMap::new(),
            decision: RoutingDecision::default(),
            published: Arc::new(ArcSwap::from_pointee(RoutingDecision::default())),
            dirty: false,
            recomputes: 0,
            config,
            ports,
        };
        arbiter.refresh_subscriptions();
        arbiter.refresh_default();
        arbiter.flush();
        info!(
            slots = arbiter.config.slot_count,
            max_active = arbiter.config.max_active_modems,
            mode = ?arbiter.config.command_mode,
            "arbiter started"
        );
        Ok(arbiter)
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn decision(&self) -> &RoutingDecision {
        &self.decision
    }

    /// Shared handle to the latest published decision.
    pub fn snapshot_handle(&self) -> Arc<ArcSwap<RoutingDecision>> {
        self.published.clone()
    }

    pub fn should_serve_demand(&self, demand: DemandId, slot: SlotId) -> bool {
        self.decision.serves(demand, slot)
    }

    pub fn modems(&self) -> &ModemTable {
        &self.modems
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn emergency_phase(&self) -> Option<EmergencyPhase> {
        self.emergency.phase()
    }

    pub fn opportunistic(&self) -> Option<SubId> {
        self.opportunistic
    }

    pub fn pending_validation(&self) -> Option<ValidationTicket> {
        self.validation.pending_ticket()
    }

    pub fn default_data_subscription(&self) -> Option<SubId> {
        self.default_sub
    }

    pub fn demand_count(&self) -> usize {
        self.demands.len()
    }

    /// Number of decision recomputations so far.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes
    }

    pub fn now(&self) -> Instant {
        self.timers.now()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn time_until_next_timer(&self) -> Option<std::time::Duration> {
        self.timers.time_until_next()
    }

    // ─── Exposed operations ─────────────────────────────────────────────

    pub fn try_set_opportunistic_data(
        &mut self,
        target: OpportunisticTarget,
        need_validation: bool,
    ) -> Receiver<OpportunisticResult> {
        let (reply, rx) = bounded(1);
        self.handle(Event::SetOpportunisticData {
            target,
            need_validation,
            reply,
        });
        rx
    }

    pub fn override_for_emergency(
        &mut self,
        slot: SlotId,
        sub: SubId,
    ) -> Result<Receiver<bool>, ArbiterError> {
        if !self.modems.contains(slot) {
            return Err(ArbiterError::UnknownSlot(slot));
        }
        let (reply, rx) = bounded(1);
        self.handle(Event::OverrideForEmergency { slot, sub, reply });
        Ok(rx)
    }

    /// Registers for routing changes. The current state is delivered
    /// immediately.
    pub fn register_for_active_modem_changed(&mut self, capacity: usize) -> Receiver<Notification> {
        let (tx, rx) = bounded(capacity.max(1));
        self.handle(Event::Subscribe {
            topic: Topic::ActiveModems,
            tx,
        });
        rx
    }

    pub fn subscribe(&mut self, topic: Topic, capacity: usize) -> Receiver<Notification> {
        let (tx, rx) = bounded(capacity.max(1));
        self.handle(Event::Subscribe { topic, tx });
        rx
    }

    // ─── Event handling ─────────────────────────────────────────────────

    /// Applies one event and recomputes if it changed anything.
    pub fn handle(&mut self, event: Event) {
        if let Err(err) = self.apply(event) {
            warn!(%err, "rejected arbiter event");
        }
        self.flush();
    }

    /// Fires every timer whose deadline has passed, then recomputes once.
    pub fn fire_due_timers(&mut self) {
        while let Some((id, kind)) = self.timers.pop_due() {
            self.on_timer(id, kind);
        }
        self.flush();
    }

    fn apply(&mut self, event: Event) -> Result<(), ArbiterError> {
        match event {
            Event::DemandUpserted(demand) => self.upsert_demand(demand),
            Event::DemandReleased(id) => {
                if self.demands.remove(id).is_some() {
                    debug!(demand = ?id, "demand released");
                    self.dirty = true;
                }
            }
            Event::SubscriptionsChanged => {
                self.refresh_subscriptions();
                self.refresh_default();
            }
            Event::DefaultDataSubscriptionChanged => self.refresh_default(),
            Event::CallStateChanged { slot, call } => self.on_call_state(slot, call)?,
            Event::DataEnabledChanged { slot, enabled } => {
                if self.modems.set_data_enabled(slot, enabled)? {
                    debug!(%slot, enabled, "data enabled changed");
                    self.dirty = true;
                }
            }
            Event::EmergencyCallbackMode { slot, active } => {
                if self.modems.set_ecbm(slot, active)? {
                    info!(%slot, active, "emergency callback mode");
                    if self.emergency.on_ecbm(slot, active, &mut self.timers) {
                        self.dirty = true;
                    }
                }
            }
            Event::CommandCompleted { token, result } => self.on_command_completed(token, result),
            Event::ValidationCompleted {
                ticket,
                sub,
                success,
            } => self.on_validation(ticket, sub, success),
            Event::SetOpportunisticData {
                target,
                need_validation,
                reply,
            } => self.set_opportunistic(target, need_validation, reply),
            Event::OverrideForEmergency { slot, sub, reply } => {
                if !self.modems.contains(slot) {
                    let _ = reply.try_send(false);
                    return Err(ArbiterError::UnknownSlot(slot));
                }
                if self.emergency.request(slot, sub, reply, &mut self.timers)
                    == RequestOutcome::Started
                {
                    self.dirty = true;
                }
            }
            Event::Subscribe { topic, tx } => self.subscribe_listener(topic, tx),
            Event::Shutdown => {}
        }
        Ok(())
    }

    fn upsert_demand(&mut self, demand: NetworkDemand) {
        let id = demand.id;
        match self.demands.upsert(demand) {
            Upsert::Inserted => {
                debug!(demand = ?id, "demand registered");
                self.dirty = true;
            }
            Upsert::ScoreUpdated => {
                debug!(demand = ?id, "demand score updated");
                self.dirty = true;
            }
            Upsert::Unchanged => {}
        }
    }

    fn refresh_subscriptions(&mut self) {
        for i in 0..self.modems.len() {
            let slot = SlotId(i);
            let sub = self.ports.directory.subscription_for_slot(slot);
            if let Ok(true) = self.modems.bind_subscription(slot, sub) {
                info!(%slot, sub = ?sub, "subscription binding changed");
                self.dirty = true;
            }
        }
    }

    fn refresh_default(&mut self) {
        let sub = self.ports.directory.default_data_subscription();
        if sub != self.default_sub {
            info!(from = ?self.default_sub, to = ?sub, "default data subscription changed");
            self.default_sub = sub;
            if self.opportunistic.is_some() && self.opportunistic == sub {
                self.opportunistic = None;
            }
            self.dirty = true;
        }
    }

    fn on_call_state(&mut self, slot: SlotId, call: CallState) -> Result<(), ArbiterError> {
        if !self.modems.set_call_state(slot, call)? {
            return Ok(());
        }
        debug!(%slot, ?call, "call state changed");
        self.dirty = true;
        let ecbm = self.modems.get(slot)?.ecbm;
        self.emergency
            .on_call_state(slot, call, ecbm, &mut self.timers);
        Ok(())
    }

    fn subscribe_listener(&mut self, topic: Topic, tx: Sender<Notification>) {
        let current = match topic {
            Topic::ActiveModems => Some(Notification::ActiveModemsChanged {
                active: self.decision.active.clone(),
                preferred: self.decision.preferred,
            }),
            Topic::ActiveDataSubscription => Some(Notification::ActiveDataSubscriptionChanged {
                sub: self.decision.preferred_sub,
            }),
            Topic::Faults => None,
        };
        if let Some(n) = current {
            self.notifier.send_to(&tx, n);
        }
        self.notifier.subscribe(topic, tx);
    }

    // ─── Opportunistic override ─────────────────────────────────────────

    fn set_opportunistic(
        &mut self,
        target: OpportunisticTarget,
        need_validation: bool,
        reply: Sender<OpportunisticResult>,
    ) {
        let resolved = match target {
            OpportunisticTarget::Default => None,
            OpportunisticTarget::Subscription(sub) if Some(sub) == self.default_sub => None,
            OpportunisticTarget::Subscription(sub) => Some(sub),
        };

        if let Some(sub) = resolved {
            if self.modems.slot_for_subscription(sub).is_none() {
                warn!(%sub, "opportunistic target is not bound to any modem");
                let _ = reply.try_send(OpportunisticResult::InactiveSubscription);
                return;
            }
        }

        if let Some(prev) = self
            .validation
            .cancel(&mut self.timers, &*self.ports.validator)
        {
            info!(sub = %prev.sub, "opportunistic switch superseded");
            let _ = prev
                .context
                .reply
                .try_send(OpportunisticResult::ValidationFailed);
        }

        if resolved == self.opportunistic {
            let _ = reply.try_send(OpportunisticResult::Success);
            return;
        }

        let validate_sub = resolved.or(self.default_sub);
        match validate_sub {
            Some(sub) if need_validation => {
                self.validation.start(
                    sub,
                    PendingSwitch {
                        target: resolved,
                        reply,
                    },
                    &mut self.timers,
                    &*self.ports.validator,
                );
            }
            _ => {
                self.apply_opportunistic(resolved);
                let _ = reply.try_send(OpportunisticResult::Success);
            }
        }
    }

    fn apply_opportunistic(&mut self, target: Option<SubId>) {
        info!(from = ?self.opportunistic, to = ?target, "opportunistic data subscription");
        self.opportunistic = target;
        self.dirty = true;
    }

    fn on_validation(&mut self, ticket: ValidationTicket, sub: SubId, success: bool) {
        let Some(done) = self.validation.complete(ticket, &mut self.timers) else {
            return;
        };
        if success && sub == done.sub {
            self.apply_opportunistic(done.context.target);
            let _ = done.context.reply.try_send(OpportunisticResult::Success);
        } else {
            info!(%sub, %ticket, "validation failed, routing unchanged");
            let _ = done
                .context
                .reply
                .try_send(OpportunisticResult::ValidationFailed);
        }
    }

    // ─── Commands ───────────────────────────────────────────────────────

    fn dispatch_ctx(&mut self) -> (&mut CommandDispatcher, DispatchCtx<'_>) {
        (
            &mut self.dispatcher,
            DispatchCtx {
                timers: &mut self.timers,
                channel: &*self.ports.commands,
                modems: &mut self.modems,
            },
        )
    }

    fn on_command_completed(&mut self, token: CommandToken, result: Result<(), RadioError>) {
        let (dispatcher, mut ctx) = self.dispatch_ctx();
        let events = dispatcher.on_completion(token, result, &mut ctx);
        self.on_dispatch_events(events);
    }

    fn on_dispatch_events(&mut self, events: Vec<DispatchEvent>) {
        for event in events {
            self.dirty = true;
            match event {
                DispatchEvent::Confirmed { command, .. } => {
                    let slot = command.slot();
                    if let Ok(true) = self.modems.set_degraded(slot, false) {
                        info!(%slot, "modem recovered");
                        if let Some(id) = self.degraded_timers.remove(&slot) {
                            self.timers.cancel(id);
                        }
                    }
                }
                DispatchEvent::Failed {
                    lane,
                    command,
                    error,
                } => {
                    let slot = command.slot();
                    if self.is_emergency_command(&command) {
                        self.emergency.fail(&mut self.timers);
                    }
                    self.mark_degraded(slot);
                    self.notifier.publish(Notification::CommandFailed {
                        lane,
                        command,
                        error: error.to_string(),
                    });
                }
                DispatchEvent::Fault(fault) => {
                    self.notifier.publish(Notification::ModemFault { fault });
                }
            }
        }
    }

    fn mark_degraded(&mut self, slot: SlotId) {
        if let Ok(true) = self.modems.set_degraded(slot, true) {
            warn!(
                %slot,
                cooldown_ms = self.config.commands.degraded_cooldown.as_millis() as u64,
                "modem degraded"
            );
        }
        if let Some(old) = self.degraded_timers.remove(&slot) {
            self.timers.cancel(old);
        }
        let id = self.timers.schedule(
            self.config.commands.degraded_cooldown,
            TimerKind::DegradedCooldown(slot),
        );
        self.degraded_timers.insert(slot, id);
    }

    /// The command that puts data on `slot` in the configured mode.
    fn activation_command(&self, slot: SlotId) -> ModemCommand {
        match self.config.command_mode {
            CommandMode::DataAllowed => ModemCommand::SetDataAllowed {
                slot,
                allowed: true,
            },
            CommandMode::PreferredDataModem => ModemCommand::SetPreferredDataModem { slot },
        }
    }

    fn is_emergency_command(&self, command: &ModemCommand) -> bool {
        self.emergency.phase() == Some(EmergencyPhase::Requested)
            && self
                .emergency
                .forced_slot()
                .is_some_and(|slot| *command == self.activation_command(slot))
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    fn on_timer(&mut self, id: TimerId, kind: TimerKind) {
        match kind {
            TimerKind::EmergencyCallStart | TimerKind::EmergencySettle => {
                let now = self.timers.now();
                if self.emergency.on_timer(id, kind, now).is_some() {
                    self.dirty = true;
                }
            }
            TimerKind::CommandRetry(lane) => {
                let (dispatcher, mut ctx) = self.dispatch_ctx();
                dispatcher.on_retry_timer(lane, &mut ctx);
            }
            TimerKind::WakelockTimeout(lane, token) => {
                let (dispatcher, mut ctx) = self.dispatch_ctx();
                let events = dispatcher.on_wakelock_timeout(lane, token, &mut ctx);
                self.on_dispatch_events(events);
            }
            TimerKind::DegradedCooldown(slot) => {
                if self.degraded_timers.get(&slot) == Some(&id) {
                    self.degraded_timers.remove(&slot);
                    if let Ok(true) = self.modems.set_degraded(slot, false) {
                        info!(%slot, "modem degraded cooldown elapsed");
                        self.dirty = true;
                    }
                }
            }
            TimerKind::ValidationDeadline(ticket) => {
                if let Some(expired) = self.validation.expire(ticket, &*self.ports.validator) {
                    warn!(sub = %expired.sub, %ticket, "validation timed out");
                    let _ = expired
                        .context
                        .reply
                        .try_send(OpportunisticResult::ValidationFailed);
                }
            }
        }
    }

    // ─── Recomputation ──────────────────────────────────────────────────

    fn flush(&mut self) {
        if self.dirty {
            self.dirty = false;
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        self.recomputes += 1;
        let demands = self.demands.snapshot();
        let emergency = self.emergency.forced_slot();
        let mut decision = decide(&DecisionInput {
            slots: self.modems.slots(),
            demands: &demands,
            default_sub: self.default_sub,
            opportunistic: self.opportunistic,
            emergency,
            max_active: self.config.max_active_modems,
            mode: self.config.command_mode,
        });
        debug_assert!(decision.active.len() <= self.config.max_active_modems);

        match self.config.command_mode {
            CommandMode::DataAllowed => self.converge_data_allowed(&decision, emergency),
            CommandMode::PreferredDataModem => self.converge_preferred(&decision, emergency),
        }

        if let Some(slot) = emergency {
            if self.emergency.phase() == Some(EmergencyPhase::Requested)
                && self.dispatcher.is_settled_on(&self.activation_command(slot))
            {
                let in_call = self
                    .modems
                    .get(slot)
                    .is_ok_and(|s| s.call.is_in_call());
                self.emergency.activate(in_call, &mut self.timers);
            }
        }

        // Consumers keep seeing the subscription that carries data until
        // the radio confirms the override.
        if self.emergency.phase() == Some(EmergencyPhase::Requested) {
            decision.preferred_sub = self.decision.preferred_sub;
        }
        self.publish(decision);
    }

    /// Whether the arbiter may put data on `slot`. Degraded slots are left
    /// alone unless an emergency pins them. Taking data off is always allowed.
    fn commandable(&self, slot: SlotId, emergency: Option<SlotId>) -> bool {
        emergency == Some(slot) || self.modems.get(slot).is_ok_and(|s| !s.degraded)
    }

    fn intends_data(&self, slot: SlotId) -> bool {
        matches!(
            self.dispatcher.intent(Lane::Slot(slot)),
            Some(ModemCommand::SetDataAllowed { allowed: true, .. })
        )
    }

    fn converge_data_allowed(&mut self, decision: &RoutingDecision, emergency: Option<SlotId>) {
        let mut deactivate = Vec::new();
        let mut activate = Vec::new();
        for i in 0..self.modems.len() {
            let slot = SlotId(i);
            let want = decision.is_active(slot);
            if want == self.intends_data(slot) {
                continue;
            }
            if !want {
                deactivate.push(slot);
            } else if self.commandable(slot, emergency) {
                activate.push(slot);
            }
        }

        {
            let (dispatcher, mut ctx) = self.dispatch_ctx();
            for slot in deactivate {
                dispatcher.submit(
                    ModemCommand::SetDataAllowed {
                        slot,
                        allowed: false,
                    },
                    &mut ctx,
                );
            }
        }

        // Never intend more modems than the budget allows.
        let cap = self.config.max_active_modems;
        let mut occupied = (0..self.modems.len())
            .filter(|i| self.intends_data(SlotId(*i)))
            .count();
        let (dispatcher, mut ctx) = self.dispatch_ctx();
        for slot in activate {
            if occupied >= cap {
                debug!(%slot, occupied, cap, "activation held, modem budget in use");
                break;
            }
            dispatcher.submit(
                ModemCommand::SetDataAllowed {
                    slot,
                    allowed: true,
                },
                &mut ctx,
            );
            occupied += 1;
        }
    }

    fn converge_preferred(&mut self, decision: &RoutingDecision, emergency: Option<SlotId>) {
        let Some(slot) = decision.preferred else {
            return;
        };
        let command = ModemCommand::SetPreferredDataModem { slot };
        if self.dispatcher.intent(Lane::PreferredModem) == Some(command)
            || !self.commandable(slot, emergency)
        {
            return;
        }
        let (dispatcher, mut ctx) = self.dispatch_ctx();
        dispatcher.submit(command, &mut ctx);
    }

    fn publish(&mut self, decision: RoutingDecision) {
        let modems_changed = decision.active != self.decision.active
            || decision.preferred != self.decision.preferred;
        let sub_changed = decision.preferred_sub != self.decision.preferred_sub;

        if modems_changed {
            info!(
                active = ?decision.active,
                preferred = ?decision.preferred,
                "routing decision changed"
            );
            self.notifier.publish(Notification::ActiveModemsChanged {
                active: decision.active.clone(),
                preferred: decision.preferred,
            });
        }
        if sub_changed {
            info!(sub = ?decision.preferred_sub, "active data subscription changed");
            self.notifier
                .publish(Notification::ActiveDataSubscriptionChanged {
                    sub: decision.preferred_sub,
                });
        }
        if modems_changed || sub_changed || decision.served != self.decision.served {
            self.published.store(Arc::new(decision.clone()));
        }
        self.decision = decision;
    }
}
