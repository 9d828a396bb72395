use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use quanta::Clock;
use tracing::debug;

use crate::config::ArbiterConfig;
use crate::demand::NetworkDemand;
use crate::engine::{Arbiter, Ports, RoutingDecision};
use crate::error::ArbiterError;
use crate::event::{Event, EventSender, OpportunisticResult, OpportunisticTarget};
use crate::ids::{DemandId, SlotId, SubId};
use crate::modem::CallState;
use crate::notify::{Notification, Topic};

/// Upper bound on how long the worker sleeps with no timer pending.
const IDLE_WAIT: Duration = Duration::from_millis(500);

const LISTENER_CAPACITY: usize = 64;

/// Thread-safe handle to the arbiter worker.
///
/// Owns a background thread that drains the event queue into an
/// [`Arbiter`] and fires its timers. Every mutation goes through the queue;
/// `should_serve_demand` and `snapshot` read the last published decision
/// without a round-trip.
///
/// Dropping the runtime shuts the worker down.
pub struct ArbiterRuntime {
    events: EventSender,
    snapshot: Arc<ArcSwap<RoutingDecision>>,
    slot_count: usize,
    handle: Option<thread::JoinHandle<()>>,
}

impl ArbiterRuntime {
    /// Builds the arbiter and starts its worker. `events` and `queue` come
    /// from [`event_queue`](crate::event::event_queue); ports that report
    /// completions should hold clones of `events`.
    pub fn spawn(
        config: ArbiterConfig,
        ports: Ports,
        events: EventSender,
        queue: Receiver<Event>,
    ) -> anyhow::Result<Self> {
        let slot_count = config.slot_count;
        let arbiter = Arbiter::new(config, Clock::new(), ports)
            .map_err(|e| anyhow::anyhow!("Failed to build arbiter: {}", e))?;
        let snapshot = arbiter.snapshot_handle();

        let handle = thread::Builder::new()
            .name("modem-arbiter".into())
            .spawn(move || runtime_worker(arbiter, queue))
            .map_err(|e| anyhow::anyhow!("Failed to spawn arbiter worker: {}", e))?;

        Ok(Self {
            events,
            snapshot,
            slot_count,
            handle: Some(handle),
        })
    }

    /// A sender for collaborators that report into the arbiter.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn upsert_demand(&self, demand: NetworkDemand) -> Result<(), ArbiterError> {
        self.events.try_send(Event::DemandUpserted(demand))
    }

    pub fn release_demand(&self, id: DemandId) -> Result<(), ArbiterError> {
        self.events.try_send(Event::DemandReleased(id))
    }

    pub fn subscriptions_changed(&self) -> Result<(), ArbiterError> {
        self.events.try_send(Event::SubscriptionsChanged)
    }

    pub fn default_data_subscription_changed(&self) -> Result<(), ArbiterError> {
        self.events.try_send(Event::DefaultDataSubscriptionChanged)
    }

    pub fn call_state_changed(&self, slot: SlotId, call: CallState) -> Result<(), ArbiterError> {
        self.check_slot(slot)?;
        self.events.call_state_changed(slot, call)
    }

    pub fn data_enabled_changed(&self, slot: SlotId, enabled: bool) -> Result<(), ArbiterError> {
        self.check_slot(slot)?;
        self.events
            .try_send(Event::DataEnabledChanged { slot, enabled })
    }

    pub fn emergency_callback_mode(&self, slot: SlotId, active: bool) -> Result<(), ArbiterError> {
        self.check_slot(slot)?;
        self.events.emergency_callback_mode(slot, active)
    }

    /// Requests an opportunistic data switch. The receiver yields exactly
    /// one result.
    pub fn try_set_opportunistic_data(
        &self,
        target: OpportunisticTarget,
        need_validation: bool,
    ) -> Result<Receiver<OpportunisticResult>, ArbiterError> {
        let (reply, rx) = bounded(1);
        self.events.try_send(Event::SetOpportunisticData {
            target,
            need_validation,
            reply,
        })?;
        Ok(rx)
    }

    /// Pins data to `slot` for an emergency call. The receiver yields
    /// `true` once routing is in place, `false` if refused or failed.
    pub fn override_for_emergency(
        &self,
        slot: SlotId,
        sub: SubId,
    ) -> Result<Receiver<bool>, ArbiterError> {
        self.check_slot(slot)?;
        let (reply, rx) = bounded(1);
        self.events
            .try_send(Event::OverrideForEmergency { slot, sub, reply })?;
        Ok(rx)
    }

    /// The first notification is the current routing state.
    pub fn register_for_active_modem_changed(&self) -> Result<Receiver<Notification>, ArbiterError> {
        self.subscribe(Topic::ActiveModems)
    }

    pub fn subscribe(&self, topic: Topic) -> Result<Receiver<Notification>, ArbiterError> {
        let (tx, rx) = bounded(LISTENER_CAPACITY);
        self.events.try_send(Event::Subscribe { topic, tx })?;
        Ok(rx)
    }

    pub fn should_serve_demand(&self, demand: DemandId, slot: SlotId) -> bool {
        self.snapshot.load().serves(demand, slot)
    }

    pub fn snapshot(&self) -> Arc<RoutingDecision> {
        self.snapshot.load_full()
    }

    /// Gracefully shuts down the worker thread. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.events.send(Event::Shutdown);
            let _ = handle.join();
        }
    }

    fn check_slot(&self, slot: SlotId) -> Result<(), ArbiterError> {
        if slot.index() < self.slot_count {
            Ok(())
        } else {
            Err(ArbiterError::UnknownSlot(slot))
        }
    }
}

impl Drop for ArbiterRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn runtime_worker(mut arbiter: Arbiter, queue: Receiver<Event>) {
    loop {
        let wait = arbiter.time_until_next_timer().unwrap_or(IDLE_WAIT);
        match queue.recv_timeout(wait) {
            Ok(Event::Shutdown) => break,
            Ok(event) => arbiter.handle(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        arbiter.fire_due_timers();
    }
    debug!("arbiter worker stopped");
}
