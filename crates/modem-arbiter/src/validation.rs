//! # Validation Coordinator
//!
//! Keeps at most one connectivity validation outstanding. Starting a new one
//! cancels the previous request with the service and hands its context back
//! to the caller, who fails it. Results are matched by ticket, so a late
//! answer for a superseded or expired validation is dropped.
//!
//! The coordinator is generic over the context `T` the caller wants back
//! when the validation resolves (the arbiter stores the pending switch and
//! its reply channel there).

use tracing::debug;

use crate::config::ValidationConfig;
use crate::ids::{SubId, ValidationTicket};
use crate::ports::{ValidationRequest, ValidationService};
use crate::timer::{TimerId, TimerKind, TimerQueue};

#[derive(Debug)]
struct Outstanding<T> {
    ticket: ValidationTicket,
    sub: SubId,
    deadline: TimerId,
    context: T,
}

/// A resolved validation: the subscription it was for and the caller's
/// context.
#[derive(Debug)]
pub struct Resolved<T> {
    pub ticket: ValidationTicket,
    pub sub: SubId,
    pub context: T,
}

#[derive(Debug)]
pub struct ValidationCoordinator<T> {
    config: ValidationConfig,
    next_ticket: u64,
    outstanding: Option<Outstanding<T>>,
}

impl<T> ValidationCoordinator<T> {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            next_ticket: 1,
            outstanding: None,
        }
    }

    pub fn pending_ticket(&self) -> Option<ValidationTicket> {
        self.outstanding.as_ref().map(|o| o.ticket)
    }

    pub fn pending_sub(&self) -> Option<SubId> {
        self.outstanding.as_ref().map(|o| o.sub)
    }

    pub fn is_pending(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Starts validating `sub`. Any outstanding validation is cancelled
    /// first and returned so the caller can fail it.
    pub fn start(
        &mut self,
        sub: SubId,
        context: T,
        timers: &mut TimerQueue,
        service: &dyn ValidationService,
    ) -> (ValidationTicket, Option<Resolved<T>>) {
        let superseded = self.cancel(timers, service);

        let ticket = ValidationTicket(self.next_ticket);
        self.next_ticket += 1;
        let deadline = timers.schedule(
            self.config.timeout + self.config.grace,
            TimerKind::ValidationDeadline(ticket),
        );
        self.outstanding = Some(Outstanding {
            ticket,
            sub,
            deadline,
            context,
        });

        debug!(%ticket, %sub, "requesting validation");
        service.validate(ValidationRequest {
            ticket,
            sub,
            timeout: self.config.timeout,
            allow_downgrade: false,
        });
        (ticket, superseded)
    }

    /// Cancels the outstanding validation, if any.
    pub fn cancel(
        &mut self,
        timers: &mut TimerQueue,
        service: &dyn ValidationService,
    ) -> Option<Resolved<T>> {
        let prev = self.outstanding.take()?;
        timers.cancel(prev.deadline);
        debug!(ticket = %prev.ticket, sub = %prev.sub, "cancelling validation");
        service.cancel(prev.ticket);
        Some(Resolved {
            ticket: prev.ticket,
            sub: prev.sub,
            context: prev.context,
        })
    }

    /// The service answered. Returns `None` for a stale ticket.
    pub fn complete(
        &mut self,
        ticket: ValidationTicket,
        timers: &mut TimerQueue,
    ) -> Option<Resolved<T>> {
        if self.pending_ticket() != Some(ticket) {
            debug!(%ticket, "dropping stale validation result");
            return None;
        }
        let done = self.outstanding.take()?;
        timers.cancel(done.deadline);
        Some(Resolved {
            ticket: done.ticket,
            sub: done.sub,
            context: done.context,
        })
    }

    /// The guard deadline for `ticket` fired without an answer.
    pub fn expire(
        &mut self,
        ticket: ValidationTicket,
        service: &dyn ValidationService,
    ) -> Option<Resolved<T>> {
        if self.pending_ticket() != Some(ticket) {
            return None;
        }
        let done = self.outstanding.take()?;
        service.cancel(ticket);
        Some(Resolved {
            ticket: done.ticket,
            sub: done.sub,
            context: done.context,
        })
    }
}
