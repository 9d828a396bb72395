#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use quanta::{Clock, Mock};

use modem_arbiter::ports::{CommandRequest, ModemCommand};
use modem_arbiter::testing::{RecordingRadio, RecordingValidator, StaticDirectory};
use modem_arbiter::{
    Arbiter, ArbiterConfig, CommandToken, DemandId, Event, NetworkDemand, Notification, Ports,
    RadioError, SlotId, SubId,
};

/// A single-threaded arbiter on a mocked clock. Commands and validations
/// are only recorded; the test completes them explicitly.
pub struct Harness {
    pub arbiter: Arbiter,
    pub mock: Arc<Mock>,
    pub directory: Arc<StaticDirectory>,
    pub radio: Arc<RecordingRadio>,
    pub validator: Arc<RecordingValidator>,
}

impl Harness {
    pub fn new(config: ArbiterConfig, slots: &[Option<i32>], default_sub: Option<i32>) -> Self {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(1));
        let directory = Arc::new(StaticDirectory::new(
            slots.iter().map(|s| s.map(SubId)).collect(),
        ));
        directory.set_default(default_sub.map(SubId));
        let radio = Arc::new(RecordingRadio::new());
        let validator = Arc::new(RecordingValidator::new());
        let ports = Ports {
            directory: directory.clone(),
            commands: radio.clone(),
            validator: validator.clone(),
        };
        let arbiter = Arbiter::new(config, clock, ports).expect("valid config");
        Self {
            arbiter,
            mock,
            directory,
            radio,
            validator,
        }
    }

    /// Two slots holding sub 1 and sub 2, default data on sub 1.
    pub fn two_slots(config: ArbiterConfig) -> Self {
        Self::new(config, &[Some(1), Some(2)], Some(1))
    }

    pub fn demand(&mut self, id: u64, score: i32) {
        self.arbiter
            .handle(Event::DemandUpserted(NetworkDemand::new(DemandId(id), score)));
    }

    pub fn upsert(&mut self, demand: NetworkDemand) {
        self.arbiter.handle(Event::DemandUpserted(demand));
    }

    pub fn set_default(&mut self, sub: Option<i32>) {
        self.directory.set_default(sub.map(SubId));
        self.arbiter.handle(Event::DefaultDataSubscriptionChanged);
    }

    pub fn complete(&mut self, token: CommandToken, result: Result<(), RadioError>) {
        self.arbiter
            .handle(Event::CommandCompleted { token, result });
    }

    /// Completes every recorded command successfully, including ones
    /// issued as a consequence, and returns them in issue order.
    pub fn complete_all(&mut self) -> Vec<CommandRequest> {
        let mut done = Vec::new();
        loop {
            let batch = self.radio.take();
            if batch.is_empty() {
                return done;
            }
            for request in batch {
                self.complete(request.token, Ok(()));
                done.push(request);
            }
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.mock.increment(by);
        self.arbiter.fire_due_timers();
    }
}

pub fn allow(slot: usize, allowed: bool) -> ModemCommand {
    ModemCommand::SetDataAllowed {
        slot: SlotId(slot),
        allowed,
    }
}

pub fn prefer(slot: usize) -> ModemCommand {
    ModemCommand::SetPreferredDataModem { slot: SlotId(slot) }
}

pub fn commands(requests: &[CommandRequest]) -> Vec<ModemCommand> {
    requests.iter().map(|r| r.command).collect()
}

pub fn drain(rx: &Receiver<Notification>) -> Vec<Notification> {
    rx.try_iter().collect()
}
