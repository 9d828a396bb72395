//! # Command Dispatcher
//!
//! Turns routing intent into radio commands, one *lane* at a time:
//!
//! - `Lane::Slot(n)` carries `set_data_allowed` for modem `n`.
//! - `Lane::PreferredModem` carries the device-wide `set_preferred_data_modem`.
//!
//! Per lane at most one command is outstanding. A new desire arriving while
//! a command is in flight is coalesced: only the latest one is sent once the
//! in-flight command completes. Failures are retried with exponential backoff
//! up to `max_retries`; after that the lane falls back to its last confirmed
//! state and the failure is surfaced to the arbiter.
//!
//! Each in-flight command holds a wakelock, modelled as a timer. It is
//! released exactly once: by the completion, or by the timeout that
//! force-releases it when the completion never arrives.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::CommandConfig;
use crate::error::RadioError;
use crate::ids::{CommandToken, SlotId};
use crate::modem::{FaultDetector, ModemFault, ModemTable};
use crate::ports::{CommandRequest, ModemCommand, ModemCommandChannel};
use crate::timer::{TimerId, TimerKind, TimerQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "lane", content = "slot", rename_all = "kebab-case")]
pub enum Lane {
    Slot(SlotId),
    PreferredModem,
}

impl Lane {
    pub fn of(command: &ModemCommand) -> Lane {
        match command {
            ModemCommand::SetDataAllowed { slot, .. } => Lane::Slot(*slot),
            ModemCommand::SetPreferredDataModem { .. } => Lane::PreferredModem,
        }
    }
}

/// What the dispatcher reports back to the arbiter.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// The radio confirmed the command; the modem table is updated.
    Confirmed { lane: Lane, command: ModemCommand },
    /// Retries are exhausted. The lane keeps its last confirmed state.
    Failed {
        lane: Lane,
        command: ModemCommand,
        error: RadioError,
    },
    /// A persistent fault was classified on the lane.
    Fault(ModemFault),
}

/// Borrowed collaborators a dispatcher call needs.
pub struct DispatchCtx<'a> {
    pub timers: &'a mut TimerQueue,
    pub channel: &'a dyn ModemCommandChannel,
    pub modems: &'a mut ModemTable,
}

#[derive(Debug)]
struct InFlight {
    token: CommandToken,
    command: ModemCommand,
    attempt: u32,
    wakelock: TimerId,
}

#[derive(Debug)]
struct PendingRetry {
    timer: TimerId,
    command: ModemCommand,
    attempt: u32,
}

#[derive(Debug, Default)]
struct LaneState {
    /// Last-issued intent: in flight, queued, or awaiting retry.
    desired: Option<ModemCommand>,
    confirmed: Option<ModemCommand>,
    in_flight: Option<InFlight>,
    queued: Option<ModemCommand>,
    retry: Option<PendingRetry>,
}

impl LaneState {
    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.retry.is_none() && self.queued.is_none()
    }
}

#[derive(Debug)]
pub struct CommandDispatcher {
    config: CommandConfig,
    lanes: HashMap<Lane, LaneState>,
    faults: FaultDetector,
    next_token: u64,
    wakelocks_held: usize,
    forced_releases: u64,
}

impl CommandDispatcher {
    /// Slot lanes start confirmed as data-disallowed, so an arbiter with no
    /// demand issues nothing.
    pub fn new(config: CommandConfig, slot_count: usize) -> Self {
        let faults = FaultDetector::new(
            config.system_error_threshold,
            config.wakelock_timeout_threshold,
        );
        let mut lanes = HashMap::new();
        for i in 0..slot_count {
            let idle = ModemCommand::SetDataAllowed {
                slot: SlotId(i),
                allowed: false,
            };
            lanes.insert(
                Lane::Slot(SlotId(i)),
                LaneState {
                    desired: Some(idle),
                    confirmed: Some(idle),
                    ..Default::default()
                },
            );
        }
        lanes.insert(Lane::PreferredModem, LaneState::default());
        Self {
            config,
            lanes,
            faults,
            next_token: 1,
            wakelocks_held: 0,
            forced_releases: 0,
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────

    /// Last-issued intent for the lane.
    pub fn intent(&self, lane: Lane) -> Option<ModemCommand> {
        self.lanes.get(&lane).and_then(|s| s.desired)
    }

    pub fn confirmed(&self, lane: Lane) -> Option<ModemCommand> {
        self.lanes.get(&lane).and_then(|s| s.confirmed)
    }

    pub fn in_flight(&self, lane: Lane) -> Option<CommandToken> {
        self.lanes
            .get(&lane)
            .and_then(|s| s.in_flight.as_ref())
            .map(|f| f.token)
    }

    /// True when the lane has nothing in flight, queued or awaiting retry.
    pub fn is_idle(&self, lane: Lane) -> bool {
        self.lanes.get(&lane).map_or(true, LaneState::is_idle)
    }

    /// Whether `command` is the lane's confirmed state and nothing else is
    /// pending on it.
    pub fn is_settled_on(&self, command: &ModemCommand) -> bool {
        let lane = Lane::of(command);
        self.lanes
            .get(&lane)
            .is_some_and(|s| s.is_idle() && s.confirmed.as_ref() == Some(command))
    }

    pub fn wakelocks_held(&self) -> usize {
        self.wakelocks_held
    }

    pub fn forced_releases(&self) -> u64 {
        self.forced_releases
    }

    pub fn faults(&self) -> &FaultDetector {
        &self.faults
    }

    // ─── Commands ───────────────────────────────────────────────────────

    /// Records `command` as the lane's intent and sends it if the lane is
    /// free. Re-submitting the current intent is a no-op.
    pub fn submit(&mut self, command: ModemCommand, ctx: &mut DispatchCtx<'_>) {
        let lane = Lane::of(&command);
        let state = self.lanes.entry(lane).or_default();
        if state.desired == Some(command) {
            return;
        }
        state.desired = Some(command);

        if let Some(in_flight) = &state.in_flight {
            if in_flight.command == command {
                state.queued = None;
            } else {
                debug!(?lane, ?command, token = %in_flight.token, "coalescing behind in-flight command");
                state.queued = Some(command);
            }
            return;
        }

        if let Some(retry) = state.retry.take() {
            ctx.timers.cancel(retry.timer);
        }

        if state.confirmed == Some(command) {
            return;
        }
        self.send(lane, command, 1, ctx);
    }

    /// A command completion from the radio. Completions for tokens that are
    /// no longer in flight (superseded or force-released) are ignored.
    pub fn on_completion(
        &mut self,
        token: CommandToken,
        outcome: Result<(), RadioError>,
        ctx: &mut DispatchCtx<'_>,
    ) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        let Some(lane) = self.lane_for_token(token) else {
            debug!(%token, "ignoring completion for a command no longer in flight");
            return events;
        };
        let Some(in_flight) = self.lanes.get_mut(&lane).and_then(|s| s.in_flight.take()) else {
            return events;
        };
        ctx.timers.cancel(in_flight.wakelock);
        self.release_wakelock(in_flight.command.slot(), ctx);

        match outcome {
            Ok(()) => self.handle_success(lane, in_flight, ctx, &mut events),
            Err(err) => self.handle_failure(lane, in_flight, err, ctx, &mut events),
        }
        events
    }

    /// Backoff elapsed for `lane`.
    pub fn on_retry_timer(&mut self, lane: Lane, ctx: &mut DispatchCtx<'_>) {
        let Some(retry) = self.lanes.get_mut(&lane).and_then(|s| s.retry.take()) else {
            return;
        };
        debug!(?lane, command = ?retry.command, attempt = retry.attempt, "retrying command");
        self.send(lane, retry.command, retry.attempt, ctx);
    }

    /// The wakelock for `token` was held past its timeout: force-release it
    /// and treat the command as failed.
    pub fn on_wakelock_timeout(
        &mut self,
        lane: Lane,
        token: CommandToken,
        ctx: &mut DispatchCtx<'_>,
    ) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        let Some(state) = self.lanes.get_mut(&lane) else {
            return events;
        };
        if state.in_flight.as_ref().map(|f| f.token) != Some(token) {
            return events;
        }
        let Some(in_flight) = state.in_flight.take() else {
            return events;
        };

        self.forced_releases += 1;
        self.release_wakelock(in_flight.command.slot(), ctx);
        warn!(
            ?lane,
            %token,
            held_ms = self.config.wakelock_timeout.as_millis() as u64,
            "command wakelock timed out, force-released"
        );
        if let Some(fault) = self.faults.record_wakelock_timeout(lane) {
            warn!(?lane, ?fault, "persistent modem fault: wakelock timeouts");
            events.push(DispatchEvent::Fault(fault));
        }
        self.handle_failure(lane, in_flight, RadioError::Timeout, ctx, &mut events);
        events
    }

    // ─── Internal ───────────────────────────────────────────────────────

    fn lane_for_token(&self, token: CommandToken) -> Option<Lane> {
        self.lanes.iter().find_map(|(lane, s)| {
            s.in_flight
                .as_ref()
                .filter(|f| f.token == token)
                .map(|_| *lane)
        })
    }

    fn send(&mut self, lane: Lane, command: ModemCommand, attempt: u32, ctx: &mut DispatchCtx<'_>) {
        let token = CommandToken(self.next_token);
        self.next_token += 1;

        let wakelock = ctx.timers.schedule(
            self.config.wakelock_timeout,
            TimerKind::WakelockTimeout(lane, token),
        );
        self.wakelocks_held += 1;
        let slot = command.slot();
        if ctx.modems.set_pending(slot, Some(token)).is_err() {
            warn!(%slot, "command targets a slot outside the modem table");
        }
        if let Some(state) = self.lanes.get_mut(&lane) {
            state.in_flight = Some(InFlight {
                token,
                command,
                attempt,
                wakelock,
            });
        }

        debug!(?lane, ?command, %token, attempt, "issuing modem command");
        ctx.channel.submit(CommandRequest { token, command });
    }

    fn release_wakelock(&mut self, slot: SlotId, ctx: &mut DispatchCtx<'_>) {
        debug_assert!(self.wakelocks_held > 0, "wakelock released twice");
        self.wakelocks_held = self.wakelocks_held.saturating_sub(1);
        let _ = ctx.modems.set_pending(slot, None);
    }

    fn handle_success(
        &mut self,
        lane: Lane,
        done: InFlight,
        ctx: &mut DispatchCtx<'_>,
        events: &mut Vec<DispatchEvent>,
    ) {
        let applied = match done.command {
            ModemCommand::SetDataAllowed { slot, allowed } => {
                ctx.modems.confirm_data_allowed(slot, allowed)
            }
            ModemCommand::SetPreferredDataModem { slot } => ctx.modems.confirm_preferred(slot),
        };
        if let Err(err) = applied {
            warn!(?lane, %err, "confirmed command for unknown slot");
        }
        self.faults.record_success(lane, done.command.kind());
        debug!(?lane, command = ?done.command, token = %done.token, "command confirmed");
        events.push(DispatchEvent::Confirmed {
            lane,
            command: done.command,
        });

        let Some(state) = self.lanes.get_mut(&lane) else {
            return;
        };
        state.confirmed = Some(done.command);
        if let Some(next) = state.queued.take() {
            if Some(next) != state.confirmed {
                self.send(lane, next, 1, ctx);
            }
        }
    }

    fn handle_failure(
        &mut self,
        lane: Lane,
        failed: InFlight,
        err: RadioError,
        ctx: &mut DispatchCtx<'_>,
        events: &mut Vec<DispatchEvent>,
    ) {
        if let Some(fault) = self.faults.record_error(lane, failed.command.kind(), &err) {
            warn!(?lane, ?fault, "persistent modem fault: repetitive system errors");
            events.push(DispatchEvent::Fault(fault));
        }

        let max_retries = self.config.max_retries;
        let backoff = self.config.backoff_for(failed.attempt);
        let Some(state) = self.lanes.get_mut(&lane) else {
            return;
        };

        // A newer desire supersedes the failed command.
        if let Some(next) = state.queued.take() {
            warn!(?lane, command = ?failed.command, %err, "command failed, superseded by newer intent");
            if Some(next) != state.confirmed {
                self.send(lane, next, 1, ctx);
            }
            return;
        }

        if failed.attempt <= max_retries {
            warn!(
                ?lane,
                command = ?failed.command,
                %err,
                attempt = failed.attempt,
                backoff_ms = backoff.as_millis() as u64,
                "command failed, scheduling retry"
            );
            let timer = ctx.timers.schedule(backoff, TimerKind::CommandRetry(lane));
            state.retry = Some(PendingRetry {
                timer,
                command: failed.command,
                attempt: failed.attempt + 1,
            });
            return;
        }

        error!(
            ?lane,
            command = ?failed.command,
            %err,
            attempts = failed.attempt,
            "command retries exhausted, keeping last confirmed state"
        );
        state.desired = state.confirmed;
        events.push(DispatchEvent::Failed {
            lane,
            command: failed.command,
            error: err,
        });
    }
}
