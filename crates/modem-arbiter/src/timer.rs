//! Monotonic timer queue.
//!
//! Timers never run code on their own: the runtime asks for the next
//! deadline, sleeps on the event channel until then, and drains due timers
//! back into the arbiter as ordinary events. Backed by a [`quanta::Clock`]
//! so tests can drive time with `Clock::mock()`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use quanta::{Clock, Instant};

use crate::dispatch::Lane;
use crate::ids::{CommandToken, SlotId, ValidationTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// T1: the emergency call did not start in time.
    EmergencyCallStart,
    /// T2: post-call / post-ECBM settle window elapsed.
    EmergencySettle,
    /// Backoff elapsed; resend the lane's desired command.
    CommandRetry(Lane),
    /// In-flight command held the wakelock too long.
    WakelockTimeout(Lane, CommandToken),
    DegradedCooldown(SlotId),
    /// The validation service never answered.
    ValidationDeadline(ValidationTicket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
pub struct TimerQueue {
    clock: Clock,
    entries: BTreeMap<(Instant, u64), TimerKind>,
    deadlines: HashMap<TimerId, Instant>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn schedule(&mut self, after: Duration, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = self.clock.now() + after;
        self.entries.insert((deadline, id), kind);
        self.deadlines.insert(TimerId(id), deadline);
        TimerId(id)
    }

    /// Cancels a pending timer. Returns `false` if it already fired or was
    /// cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.entries.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Time until the earliest deadline, zero if one is already due.
    pub fn time_until_next(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Removes and returns the earliest timer whose deadline has passed.
    pub fn pop_due(&mut self) -> Option<(TimerId, TimerKind)> {
        let now = self.clock.now();
        let (&(deadline, id), _) = self.entries.iter().next()?;
        if deadline > now {
            return None;
        }
        let kind = self.entries.remove(&(deadline, id))?;
        self.deadlines.remove(&TimerId(id));
        Some((TimerId(id), kind))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let (clock, mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        timers.schedule(Duration::from_millis(200), TimerKind::EmergencySettle);
        timers.schedule(Duration::from_millis(100), TimerKind::EmergencyCallStart);

        assert!(timers.pop_due().is_none(), "nothing due yet");
        mock.increment(Duration::from_millis(150));
        assert_eq!(
            timers.pop_due().map(|(_, k)| k),
            Some(TimerKind::EmergencyCallStart)
        );
        assert!(timers.pop_due().is_none());
        mock.increment(Duration::from_millis(50));
        assert_eq!(
            timers.pop_due().map(|(_, k)| k),
            Some(TimerKind::EmergencySettle)
        );
        assert!(timers.is_empty());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let (clock, mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        let id = timers.schedule(Duration::from_millis(10), TimerKind::EmergencySettle);
        assert!(timers.is_pending(id));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id), "second cancel is a no-op");
        mock.increment(Duration::from_millis(20));
        assert!(timers.pop_due().is_none());
    }

    #[test]
    fn time_until_next_saturates() {
        let (clock, mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        assert!(timers.time_until_next().is_none());
        timers.schedule(Duration::from_millis(30), TimerKind::EmergencySettle);
        assert_eq!(timers.time_until_next(), Some(Duration::from_millis(30)));
        mock.increment(Duration::from_millis(100));
        assert_eq!(timers.time_until_next(), Some(Duration::ZERO));
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let (clock, mock) = Clock::mock();
        let mut timers = TimerQueue::new(clock);
        timers.schedule(Duration::from_millis(5), TimerKind::DegradedCooldown(SlotId(0)));
        timers.schedule(Duration::from_millis(5), TimerKind::DegradedCooldown(SlotId(1)));
        mock.increment(Duration::from_millis(5));
        assert_eq!(
            timers.pop_due().map(|(_, k)| k),
            Some(TimerKind::DegradedCooldown(SlotId(0)))
        );
        assert_eq!(
            timers.pop_due().map(|(_, k)| k),
            Some(TimerKind::DegradedCooldown(SlotId(1)))
        );
    }
}
