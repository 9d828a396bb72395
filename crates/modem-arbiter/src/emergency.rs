//! # Emergency Override Controller
//!
//! Temporarily pins data to one modem around an emergency call:
//!
//! ```text
//! Requested ──confirmed──▶ AwaitingCallStart ──call──▶ InCall ──end──▶ AwaitingSettle ──T2──▶ (reverted)
//!     │                         │ T1                                     ▲      │ ECBM enter
//!     └──command failed──▶ ✗    └──────────▶ (reverted)        ECBM exit └── HeldByEcbm
//! ```
//!
//! Only one override exists at a time. A request for a different slot or
//! subscription while one is live is refused on the spot; the same target
//! joins (or is answered by) the live override.

use crossbeam_channel::Sender;
use quanta::Instant;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EmergencyConfig;
use crate::ids::{SlotId, SubId};
use crate::modem::CallState;
use crate::timer::{TimerId, TimerKind, TimerQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmergencyPhase {
    /// Routing is moving to the target; waiting for the radio to confirm.
    Requested,
    /// Confirmed; T1 bounds the wait for the call to start.
    AwaitingCallStart,
    InCall,
    /// Call over; T2 runs.
    AwaitingSettle,
    /// Call over but the modem is in emergency-callback mode.
    HeldByEcbm,
}

impl EmergencyPhase {
    pub fn is_active(self) -> bool {
        !matches!(self, EmergencyPhase::Requested)
    }
}

#[derive(Debug)]
pub struct EmergencyOverride {
    pub slot: SlotId,
    pub sub: SubId,
    pub phase: EmergencyPhase,
    pub started: Instant,
    timer: Option<TimerId>,
    waiters: Vec<Sender<bool>>,
}

impl EmergencyOverride {
    fn resolve(&mut self, result: bool) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.try_send(result);
        }
    }

    fn arm(&mut self, timers: &mut TimerQueue, after: std::time::Duration, kind: TimerKind) {
        self.disarm(timers);
        self.timer = Some(timers.schedule(after, kind));
    }

    fn disarm(&mut self, timers: &mut TimerQueue) {
        if let Some(id) = self.timer.take() {
            timers.cancel(id);
        }
    }
}

/// What happened to an incoming override request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new override was created in `Requested`.
    Started,
    /// Same target as the live override, still awaiting confirmation.
    Joined,
    /// Same target as the live, already active override; answered `true`.
    AlreadyActive,
    /// Conflicts with the live override; answered `false`.
    Rejected,
}

#[derive(Debug)]
pub struct EmergencyController {
    config: EmergencyConfig,
    current: Option<EmergencyOverride>,
}

impl EmergencyController {
    pub fn new(config: EmergencyConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&EmergencyOverride> {
        self.current.as_ref()
    }

    pub fn phase(&self) -> Option<EmergencyPhase> {
        self.current.as_ref().map(|o| o.phase)
    }

    /// The slot routing must be pinned to, in any phase.
    pub fn forced_slot(&self) -> Option<SlotId> {
        self.current.as_ref().map(|o| o.slot)
    }

    pub fn request(
        &mut self,
        slot: SlotId,
        sub: SubId,
        reply: Sender<bool>,
        timers: &mut TimerQueue,
    ) -> RequestOutcome {
        if let Some(cur) = self.current.as_mut() {
            if cur.slot != slot || cur.sub != sub {
                warn!(
                    %slot,
                    %sub,
                    active_slot = %cur.slot,
                    "emergency override already in progress for another target"
                );
                let _ = reply.try_send(false);
                return RequestOutcome::Rejected;
            }
            return match cur.phase {
                EmergencyPhase::Requested => {
                    cur.waiters.push(reply);
                    RequestOutcome::Joined
                }
                EmergencyPhase::AwaitingCallStart => {
                    cur.arm(
                        timers,
                        self.config.call_start_timeout,
                        TimerKind::EmergencyCallStart,
                    );
                    let _ = reply.try_send(true);
                    RequestOutcome::AlreadyActive
                }
                _ => {
                    let _ = reply.try_send(true);
                    RequestOutcome::AlreadyActive
                }
            };
        }

        info!(%slot, %sub, "emergency override requested");
        self.current = Some(EmergencyOverride {
            slot,
            sub,
            phase: EmergencyPhase::Requested,
            started: timers.now(),
            timer: None,
            waiters: vec![reply],
        });
        RequestOutcome::Started
    }

    /// Routing to the target slot is confirmed. Resolves the waiters with
    /// `true` and starts T1, or goes straight to `InCall` if the call
    /// already started.
    pub fn activate(&mut self, in_call: bool, timers: &mut TimerQueue) -> bool {
        let Some(cur) = self.current.as_mut() else {
            return false;
        };
        if cur.phase != EmergencyPhase::Requested {
            return false;
        }
        cur.resolve(true);
        if in_call {
            cur.phase = EmergencyPhase::InCall;
        } else {
            cur.phase = EmergencyPhase::AwaitingCallStart;
            cur.arm(
                timers,
                self.config.call_start_timeout,
                TimerKind::EmergencyCallStart,
            );
        }
        info!(slot = %cur.slot, sub = %cur.sub, phase = ?cur.phase, "emergency override active");
        true
    }

    /// The routing command for a `Requested` override ultimately failed.
    /// Resolves the waiters with `false` and drops the override.
    pub fn fail(&mut self, timers: &mut TimerQueue) -> bool {
        if self.phase() != Some(EmergencyPhase::Requested) {
            return false;
        }
        let Some(mut cur) = self.current.take() else {
            return false;
        };
        warn!(slot = %cur.slot, sub = %cur.sub, "emergency override failed");
        cur.disarm(timers);
        cur.resolve(false);
        true
    }

    /// Call activity on some slot. Returns whether the phase changed.
    pub fn on_call_state(
        &mut self,
        slot: SlotId,
        call: CallState,
        ecbm: bool,
        timers: &mut TimerQueue,
    ) -> bool {
        let settle = self.config.ecbm_settle;
        let Some(cur) = self.current.as_mut().filter(|o| o.slot == slot) else {
            return false;
        };
        let next = match (cur.phase, call.is_in_call()) {
            (
                EmergencyPhase::AwaitingCallStart
                | EmergencyPhase::AwaitingSettle
                | EmergencyPhase::HeldByEcbm,
                true,
            ) => {
                cur.disarm(timers);
                EmergencyPhase::InCall
            }
            (EmergencyPhase::InCall, false) if ecbm => EmergencyPhase::HeldByEcbm,
            (EmergencyPhase::InCall, false) => {
                cur.arm(timers, settle, TimerKind::EmergencySettle);
                EmergencyPhase::AwaitingSettle
            }
            _ => return false,
        };
        debug!(%slot, from = ?cur.phase, to = ?next, "emergency override phase");
        cur.phase = next;
        true
    }

    /// Emergency-callback mode entered or left on some slot.
    pub fn on_ecbm(&mut self, slot: SlotId, on: bool, timers: &mut TimerQueue) -> bool {
        let settle = self.config.ecbm_settle;
        let Some(cur) = self.current.as_mut().filter(|o| o.slot == slot) else {
            return false;
        };
        let next = match (cur.phase, on) {
            (EmergencyPhase::AwaitingSettle, true) => {
                cur.disarm(timers);
                EmergencyPhase::HeldByEcbm
            }
            (EmergencyPhase::HeldByEcbm, false) => {
                cur.arm(timers, settle, TimerKind::EmergencySettle);
                EmergencyPhase::AwaitingSettle
            }
            _ => return false,
        };
        debug!(%slot, from = ?cur.phase, to = ?next, "emergency override phase");
        cur.phase = next;
        true
    }

    /// An emergency timer fired. Returns the override if it was reverted.
    pub fn on_timer(
        &mut self,
        id: TimerId,
        kind: TimerKind,
        now: Instant,
    ) -> Option<EmergencyOverride> {
        let cur = self.current.as_ref()?;
        if cur.timer != Some(id) {
            return None;
        }
        let expired = matches!(
            (cur.phase, kind),
            (EmergencyPhase::AwaitingCallStart, TimerKind::EmergencyCallStart)
                | (EmergencyPhase::AwaitingSettle, TimerKind::EmergencySettle)
        );
        if !expired {
            return None;
        }
        let mut done = self.current.take()?;
        done.timer = None;
        info!(
            slot = %done.slot,
            sub = %done.sub,
            phase = ?done.phase,
            held_ms = now.saturating_duration_since(done.started).as_millis() as u64,
            "emergency override reverted"
        );
        Some(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use quanta::Clock;
    use std::time::Duration;

    const SLOT: SlotId = SlotId(1);
    const SUB: SubId = SubId(2);

    fn controller() -> EmergencyController {
        EmergencyController::new(EmergencyConfig {
            call_start_timeout: Duration::from_millis(500),
            ecbm_settle: Duration::from_millis(300),
        })
    }

    fn fire(timers: &mut TimerQueue, ctl: &mut EmergencyController) -> Option<EmergencyOverride> {
        let (id, kind) = timers.pop_due()?;
        ctl.on_timer(id, kind, timers.now())
    }

    // ─── Request / activation ───────────────────────────────────────────

    #[test]
    fn activation_resolves_all_waiters() {
        let (clock, _mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let mut ctl = controller();
        let (tx1, rx1) = bounded(1);
        let (tx2, rx2) = bounded(1);

        assert_eq!(ctl.request(SLOT, SUB, tx1, &mut timers), RequestOutcome::Started);
        assert_eq!(ctl.request(SLOT, SUB, tx2, &mut timers), RequestOutcome::Joined);
        assert!(rx1.try_recv().is_err(), "unresolved until confirmed");

        assert!(ctl.activate(false, &mut timers));
        assert_eq!(rx1.try_recv(), Ok(true));
        assert_eq!(rx2.try_recv(), Ok(true));
        assert_eq!(ctl.phase(), Some(EmergencyPhase::AwaitingCallStart));
        assert_eq!(timers.len(), 1, "T1 armed");
    }

    #[test]
    fn conflicting_request_is_rejected() {
        let (clock, _mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let mut ctl = controller();
        let (tx, _rx) = bounded(1);
        ctl.request(SLOT, SUB, tx, &mut timers);

        let (tx_other, rx_other) = bounded(1);
        assert_eq!(
            ctl.request(SlotId(0), SubId(1), tx_other, &mut timers),
            RequestOutcome::Rejected
        );
        assert_eq!(rx_other.try_recv(), Ok(false));
        assert_eq!(ctl.forced_slot(), Some(SLOT));
    }

    #[test]
    fn failure_resolves_false_and_clears() {
        let (clock, _mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let mut ctl = controller();
        let (tx, rx) = bounded(1);
        ctl.request(SLOT, SUB, tx, &mut timers);
        assert!(ctl.fail(&mut timers));
        assert_eq!(rx.try_recv(), Ok(false));
        assert!(ctl.current().is_none());
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    #[test]
    fn no_call_reverts_after_t1() {
        let (clock, mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let mut ctl = controller();
        let (tx, _rx) = bounded(1);
        ctl.request(SLOT, SUB, tx, &mut timers);
        ctl.activate(false, &mut timers);

        mock.increment(Duration::from_millis(499));
        assert!(fire(&mut timers, &mut ctl).is_none());
        mock.increment(Duration::from_millis(1));
        let reverted = fire(&mut timers, &mut ctl).unwrap();
        assert_eq!(reverted.slot, SLOT);
        assert!(ctl.current().is_none());
    }

    #[test]
    fn same_target_restarts_t1() {
        let (clock, mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let mut ctl = controller();
        let (tx, _rx) = bounded(1);
        ctl.request(SLOT, SUB, tx, &mut timers);
        ctl.activate(false, &mut timers);

        mock.increment(Duration::from_millis(400));
        let (tx2, rx2) = bounded(1);
        assert_eq!(
            ctl.request(SLOT, SUB, tx2, &mut timers),
            RequestOutcome::AlreadyActive
        );
        assert_eq!(rx2.try_recv(), Ok(true));
        mock.increment(Duration::from_millis(400));
        assert!(fire(&mut timers, &mut ctl).is_none(), "T1 was restarted");
        mock.increment(Duration::from_millis(100));
        assert!(fire(&mut timers, &mut ctl).is_some());
    }

    #[test]
    fn call_then_settle_reverts_after_t2() {
        let (clock, mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let mut ctl = controller();
        let (tx, _rx) = bounded(1);
        ctl.request(SLOT, SUB, tx, &mut timers);
        ctl.activate(false, &mut timers);

        assert!(ctl.on_call_state(SLOT, CallState::Active, false, &mut timers));
        assert_eq!(ctl.phase(), Some(EmergencyPhase::InCall));
        assert!(timers.is_empty(), "T1 cancelled by call start");

        mock.increment(Duration::from_secs(60));
        assert!(ctl.on_call_state(SLOT, CallState::Idle, false, &mut timers));
        assert_eq!(ctl.phase(), Some(EmergencyPhase::AwaitingSettle));
        mock.increment(Duration::from_millis(300));
        assert!(fire(&mut timers, &mut ctl).is_some());
    }

    #[test]
    fn ecbm_holds_until_exit() {
        let (clock, mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let mut ctl = controller();
        let (tx, _rx) = bounded(1);
        ctl.request(SLOT, SUB, tx, &mut timers);
        ctl.activate(true, &mut timers);
        assert_eq!(ctl.phase(), Some(EmergencyPhase::InCall));

        ctl.on_call_state(SLOT, CallState::Idle, false, &mut timers);
        mock.increment(Duration::from_millis(100));
        assert!(ctl.on_ecbm(SLOT, true, &mut timers));
        assert_eq!(ctl.phase(), Some(EmergencyPhase::HeldByEcbm));

        mock.increment(Duration::from_secs(600));
        assert!(fire(&mut timers, &mut ctl).is_none(), "held while in ECBM");

        assert!(ctl.on_ecbm(SLOT, false, &mut timers));
        mock.increment(Duration::from_millis(299));
        assert!(fire(&mut timers, &mut ctl).is_none());
        mock.increment(Duration::from_millis(1));
        assert!(fire(&mut timers, &mut ctl).is_some());
    }

    #[test]
    fn call_end_in_ecbm_holds_directly() {
        let (clock, _mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let mut ctl = controller();
        let (tx, _rx) = bounded(1);
        ctl.request(SLOT, SUB, tx, &mut timers);
        ctl.activate(true, &mut timers);
        ctl.on_call_state(SLOT, CallState::Idle, true, &mut timers);
        assert_eq!(ctl.phase(), Some(EmergencyPhase::HeldByEcbm));
        assert!(timers.is_empty());
    }

    #[test]
    fn other_slot_events_are_ignored() {
        let (clock, _mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let mut ctl = controller();
        let (tx, _rx) = bounded(1);
        ctl.request(SLOT, SUB, tx, &mut timers);
        ctl.activate(false, &mut timers);
        assert!(!ctl.on_call_state(SlotId(0), CallState::Active, false, &mut timers));
        assert!(!ctl.on_ecbm(SlotId(0), true, &mut timers));
        assert_eq!(ctl.phase(), Some(EmergencyPhase::AwaitingCallStart));
    }
}
