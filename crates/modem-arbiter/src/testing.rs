//! In-memory collaborators for tests and the scenario runner.
//!
//! `Recording*` ports only capture what the arbiter asked for; the test
//! posts completions itself. `Loopback*` ports answer on their own through
//! an [`EventSender`], which is what a threaded runtime needs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::warn;

use crate::error::RadioError;
use crate::event::EventSender;
use crate::ids::{SlotId, SubId, ValidationTicket};
use crate::ports::{
    CommandRequest, ModemCommandChannel, SubscriptionDirectory, ValidationRequest,
    ValidationService,
};

/// Locks `m`, recovering the guard if a holder panicked.
pub fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Subscription directory ─────────────────────────────────────────────

#[derive(Debug)]
pub struct StaticDirectory {
    slots: Mutex<Vec<Option<SubId>>>,
    default: Mutex<Option<SubId>>,
}

impl StaticDirectory {
    pub fn new(slots: Vec<Option<SubId>>) -> Self {
        Self {
            slots: Mutex::new(slots),
            default: Mutex::new(None),
        }
    }

    pub fn set_slot(&self, slot: SlotId, sub: Option<SubId>) {
        let mut slots = lock(&self.slots);
        if slot.index() >= slots.len() {
            slots.resize(slot.index() + 1, None);
        }
        slots[slot.index()] = sub;
    }

    pub fn set_default(&self, sub: Option<SubId>) {
        *lock(&self.default) = sub;
    }
}

impl SubscriptionDirectory for StaticDirectory {
    fn subscription_for_slot(&self, slot: SlotId) -> Option<SubId> {
        lock(&self.slots).get(slot.index()).copied().flatten()
    }

    fn default_data_subscription(&self) -> Option<SubId> {
        *lock(&self.default)
    }
}

// ─── Recording ports ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingRadio {
    requests: Mutex<Vec<CommandRequest>>,
}

impl RecordingRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        lock(&self.requests).clone()
    }

    pub fn last(&self) -> Option<CommandRequest> {
        lock(&self.requests).last().copied()
    }

    /// Returns and forgets everything recorded so far.
    pub fn take(&self) -> Vec<CommandRequest> {
        std::mem::take(&mut *lock(&self.requests))
    }
}

impl ModemCommandChannel for RecordingRadio {
    fn submit(&self, request: CommandRequest) {
        lock(&self.requests).push(request);
    }
}

#[derive(Debug, Default)]
pub struct RecordingValidator {
    requests: Mutex<Vec<ValidationRequest>>,
    cancelled: Mutex<Vec<ValidationTicket>>,
}

impl RecordingValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ValidationRequest> {
        lock(&self.requests).clone()
    }

    pub fn last(&self) -> Option<ValidationRequest> {
        lock(&self.requests).last().copied()
    }

    pub fn cancelled(&self) -> Vec<ValidationTicket> {
        lock(&self.cancelled).clone()
    }
}

impl ValidationService for RecordingValidator {
    fn validate(&self, request: ValidationRequest) {
        lock(&self.requests).push(request);
    }

    fn cancel(&self, ticket: ValidationTicket) {
        lock(&self.cancelled).push(ticket);
    }
}

// ─── Loopback ports ─────────────────────────────────────────────────────

/// Completes every command immediately, optionally failing the next few.
#[derive(Debug)]
pub struct LoopbackRadio {
    events: EventSender,
    failures: Mutex<VecDeque<RadioError>>,
    log: RecordingRadio,
}

impl LoopbackRadio {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            failures: Mutex::new(VecDeque::new()),
            log: RecordingRadio::new(),
        }
    }

    /// The next `count` commands complete with `error`.
    pub fn fail_next(&self, count: usize, error: RadioError) {
        let mut failures = lock(&self.failures);
        failures.extend(std::iter::repeat(error).take(count));
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.log.requests()
    }
}

impl ModemCommandChannel for LoopbackRadio {
    fn submit(&self, request: CommandRequest) {
        self.log.submit(request);
        let result = match lock(&self.failures).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        if let Err(err) = self.events.command_completed_nowait(request.token, result) {
            warn!(token = %request.token, %err, "loopback radio dropped a completion");
        }
    }
}

/// Answers every validation at once with a per-subscription verdict
/// (default: success).
#[derive(Debug)]
pub struct LoopbackValidator {
    events: EventSender,
    verdicts: Mutex<HashMap<SubId, bool>>,
    log: RecordingValidator,
}

impl LoopbackValidator {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            verdicts: Mutex::new(HashMap::new()),
            log: RecordingValidator::new(),
        }
    }

    pub fn set_verdict(&self, sub: SubId, success: bool) {
        lock(&self.verdicts).insert(sub, success);
    }

    pub fn requests(&self) -> Vec<ValidationRequest> {
        self.log.requests()
    }
}

impl ValidationService for LoopbackValidator {
    fn validate(&self, request: ValidationRequest) {
        self.log.validate(request);
        let success = lock(&self.verdicts).get(&request.sub).copied().unwrap_or(true);
        if let Err(err) = self
            .events
            .validation_completed_nowait(request.ticket, request.sub, success)
        {
            warn!(ticket = %request.ticket, %err, "loopback validator dropped a result");
        }
    }

    fn cancel(&self, ticket: ValidationTicket) {
        self.log.cancel(ticket);
    }
}
