//! # Arbiter Scenario Runner
//!
//! Replays a timed script of inputs against an [`Arbiter`] on a simulated
//! clock, with a simulated radio and validator, and prints every
//! notification and reply as a JSON line.
//!
//! ## Usage
//!
//! ```bash
//! arbiter-sim --scenario scenarios/default_switch.toml
//! arbiter-sim --config arbiter.toml --scenario scenarios/emergency_call.toml
//! RUST_LOG=modem_arbiter=debug arbiter-sim --scenario scenarios/radio_fault.toml
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::Receiver;
use quanta::{Clock, Instant, Mock};
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use modem_arbiter::error::RadioError;
use modem_arbiter::modem::CallState;
use modem_arbiter::ports::{
    CommandRequest, ModemCommandChannel, ValidationRequest, ValidationService,
};
use modem_arbiter::testing::{lock, StaticDirectory};
use modem_arbiter::{
    Arbiter, ArbiterConfig, CommandToken, DemandId, Event, NetworkDemand, Notification,
    OpportunisticResult, OpportunisticTarget, Ports, SlotId, SubId, Topic, ValidationTicket,
};

#[derive(Parser, Debug)]
#[command(name = "arbiter-sim", about = "Replay a modem-arbiter scenario")]
struct Cli {
    /// Arbiter configuration (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scenario script (TOML).
    #[arg(long)]
    scenario: PathBuf,
}

// ─── Scenario format ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Scenario {
    /// Subscription per slot; negative means empty.
    slots: Vec<i32>,
    default_sub: Option<i32>,
    #[serde(default)]
    radio: RadioScript,
    #[serde(default)]
    validator: ValidatorScript,
    /// Keep running this long after the last step.
    #[serde(default = "default_settle_ms")]
    settle_ms: u64,
    #[serde(default)]
    step: Vec<Step>,
}

fn default_settle_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RadioScript {
    latency_ms: u64,
    /// Commands that never complete (wakelock timeouts).
    drop_slots: Vec<usize>,
    fail: Vec<FailScript>,
}

impl Default for RadioScript {
    fn default() -> Self {
        Self {
            latency_ms: 20,
            drop_slots: Vec::new(),
            fail: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FailScript {
    slot: usize,
    count: usize,
    #[serde(default)]
    error: ErrorName,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ErrorName {
    #[default]
    SystemError,
    RadioNotAvailable,
    RequestNotSupported,
    InvalidArguments,
}

impl From<ErrorName> for RadioError {
    fn from(name: ErrorName) -> Self {
        match name {
            ErrorName::SystemError => RadioError::SystemError,
            ErrorName::RadioNotAvailable => RadioError::RadioNotAvailable,
            ErrorName::RequestNotSupported => RadioError::RequestNotSupported,
            ErrorName::InvalidArguments => RadioError::InvalidArguments,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ValidatorScript {
    latency_ms: u64,
    /// Subscriptions that fail validation.
    reject: Vec<i32>,
}

impl Default for ValidatorScript {
    fn default() -> Self {
        Self {
            latency_ms: 100,
            reject: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Step {
    at_ms: u64,
    action: Action,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum Action {
    Demand {
        id: u64,
        score: i32,
        #[serde(default)]
        affinity: Option<i32>,
        #[serde(default)]
        restricted: bool,
    },
    Release {
        id: u64,
    },
    BindSlot {
        slot: usize,
        #[serde(default)]
        sub: Option<i32>,
    },
    SetDefault {
        #[serde(default)]
        sub: Option<i32>,
    },
    Call {
        slot: usize,
        state: CallState,
    },
    DataEnabled {
        slot: usize,
        enabled: bool,
    },
    Ecbm {
        slot: usize,
        active: bool,
    },
    /// `sub` omitted means back to default.
    Opportunistic {
        #[serde(default)]
        sub: Option<i32>,
        #[serde(default)]
        validate: bool,
    },
    Emergency {
        slot: usize,
        sub: i32,
    },
}

// ─── Simulated collaborators ────────────────────────────────────────────

struct SimRadio {
    clock: Clock,
    latency: Duration,
    drop_slots: Vec<SlotId>,
    failures: Mutex<HashMap<SlotId, VecDeque<RadioError>>>,
    in_flight: Mutex<Vec<(Instant, CommandToken, Result<(), RadioError>)>>,
}

impl SimRadio {
    fn new(clock: Clock, script: &RadioScript) -> Self {
        let mut failures: HashMap<SlotId, VecDeque<RadioError>> = HashMap::new();
        for f in &script.fail {
            failures
                .entry(SlotId(f.slot))
                .or_default()
                .extend(std::iter::repeat(RadioError::from(f.error)).take(f.count));
        }
        Self {
            clock,
            latency: Duration::from_millis(script.latency_ms),
            drop_slots: script.drop_slots.iter().map(|s| SlotId(*s)).collect(),
            failures: Mutex::new(failures),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    fn next_due(&self) -> Option<Instant> {
        lock(&self.in_flight).iter().map(|(at, _, _)| *at).min()
    }

    fn take_due(&self, now: Instant) -> Vec<(CommandToken, Result<(), RadioError>)> {
        let mut in_flight = lock(&self.in_flight);
        let (due, pending): (Vec<_>, Vec<_>) = in_flight.drain(..).partition(|(at, _, _)| *at <= now);
        *in_flight = pending;
        due.into_iter().map(|(_, token, result)| (token, result)).collect()
    }
}

impl ModemCommandChannel for SimRadio {
    fn submit(&self, request: CommandRequest) {
        let slot = request.command.slot();
        emit(json!({ "radio": "submit", "token": request.token.0, "command": request.command }));
        if self.drop_slots.contains(&slot) {
            return;
        }
        let result = match lock(&self.failures).get_mut(&slot).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        };
        lock(&self.in_flight).push((self.clock.now() + self.latency, request.token, result));
    }
}

struct SimValidator {
    clock: Clock,
    latency: Duration,
    reject: Vec<SubId>,
    pending: Mutex<Vec<(Instant, ValidationTicket, SubId)>>,
}

impl SimValidator {
    fn next_due(&self) -> Option<Instant> {
        lock(&self.pending).iter().map(|(at, _, _)| *at).min()
    }

    fn take_due(&self, now: Instant) -> Vec<(ValidationTicket, SubId, bool)> {
        let mut pending = lock(&self.pending);
        let (due, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|(at, _, _)| *at <= now);
        *pending = rest;
        due.into_iter()
            .map(|(_, ticket, sub)| (ticket, sub, !self.reject.contains(&sub)))
            .collect()
    }
}

impl ValidationService for SimValidator {
    fn validate(&self, request: ValidationRequest) {
        let delay = self.latency.min(request.timeout);
        lock(&self.pending).push((self.clock.now() + delay, request.ticket, request.sub));
    }

    fn cancel(&self, ticket: ValidationTicket) {
        lock(&self.pending).retain(|(_, t, _)| *t != ticket);
    }
}

fn emit(value: serde_json::Value) {
    println!("{value}");
}

// ─── Simulation loop ────────────────────────────────────────────────────

enum Reply {
    Opportunistic(Receiver<OpportunisticResult>),
    Emergency(Receiver<bool>),
}

struct Sim {
    arbiter: Arbiter,
    mock: Arc<Mock>,
    start: Instant,
    directory: Arc<StaticDirectory>,
    radio: Arc<SimRadio>,
    validator: Arc<SimValidator>,
    listeners: Vec<Receiver<Notification>>,
    replies: Vec<Reply>,
}

impl Sim {
    fn t_ms(&self) -> u64 {
        self.arbiter
            .now()
            .saturating_duration_since(self.start)
            .as_millis() as u64
    }

    fn advance_to(&self, at: Instant) {
        let now = self.arbiter.now();
        if at > now {
            self.mock.increment(at.saturating_duration_since(now));
        }
    }

    fn next_internal(&self) -> Option<Instant> {
        [
            self.arbiter.next_deadline(),
            self.radio.next_due(),
            self.validator.next_due(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Delivers everything due at the current instant.
    fn pump(&mut self) {
        let now = self.arbiter.now();
        for (token, result) in self.radio.take_due(now) {
            self.arbiter
                .handle(Event::CommandCompleted { token, result });
        }
        for (ticket, sub, success) in self.validator.take_due(now) {
            self.arbiter.handle(Event::ValidationCompleted {
                ticket,
                sub,
                success,
            });
        }
        self.arbiter.fire_due_timers();
        self.drain_output();
    }

    fn drain_output(&mut self) {
        let t_ms = self.t_ms();
        for rx in &self.listeners {
            while let Ok(n) = rx.try_recv() {
                emit(json!({ "t_ms": t_ms, "notification": n }));
            }
        }
        self.replies.retain(|reply| match reply {
            Reply::Opportunistic(rx) => match rx.try_recv() {
                Ok(result) => {
                    emit(json!({ "t_ms": t_ms, "reply": "opportunistic", "result": result }));
                    false
                }
                Err(_) => true,
            },
            Reply::Emergency(rx) => match rx.try_recv() {
                Ok(result) => {
                    emit(json!({ "t_ms": t_ms, "reply": "emergency", "result": result }));
                    false
                }
                Err(_) => true,
            },
        });
    }

    fn apply(&mut self, action: Action) -> anyhow::Result<()> {
        match action {
            Action::Demand {
                id,
                score,
                affinity,
                restricted,
            } => {
                let mut demand = NetworkDemand::new(DemandId(id), score);
                demand.affinity = affinity.map(SubId);
                demand.restricted = restricted;
                self.arbiter.handle(Event::DemandUpserted(demand));
            }
            Action::Release { id } => self.arbiter.handle(Event::DemandReleased(DemandId(id))),
            Action::BindSlot { slot, sub } => {
                self.directory.set_slot(SlotId(slot), sub.map(SubId));
                self.arbiter.handle(Event::SubscriptionsChanged);
            }
            Action::SetDefault { sub } => {
                self.directory.set_default(sub.map(SubId));
                self.arbiter.handle(Event::DefaultDataSubscriptionChanged);
            }
            Action::Call { slot, state } => self.arbiter.handle(Event::CallStateChanged {
                slot: SlotId(slot),
                call: state,
            }),
            Action::DataEnabled { slot, enabled } => {
                self.arbiter.handle(Event::DataEnabledChanged {
                    slot: SlotId(slot),
                    enabled,
                })
            }
            Action::Ecbm { slot, active } => self.arbiter.handle(Event::EmergencyCallbackMode {
                slot: SlotId(slot),
                active,
            }),
            Action::Opportunistic { sub, validate } => {
                let target = match sub {
                    Some(sub) => OpportunisticTarget::Subscription(SubId(sub)),
                    None => OpportunisticTarget::Default,
                };
                let rx = self.arbiter.try_set_opportunistic_data(target, validate);
                self.replies.push(Reply::Opportunistic(rx));
            }
            Action::Emergency { slot, sub } => {
                let rx = self
                    .arbiter
                    .override_for_emergency(SlotId(slot), SubId(sub))
                    .with_context(|| format!("emergency override for slot{slot}"))?;
                self.replies.push(Reply::Emergency(rx));
            }
        }
        self.drain_output();
        Ok(())
    }

    fn run(&mut self, mut steps: Vec<Step>, settle: Duration) -> anyhow::Result<()> {
        steps.sort_by_key(|s| s.at_ms);
        let mut steps: VecDeque<Step> = steps.into();
        let last_ms = steps.back().map_or(0, |s| s.at_ms);
        let end = self.start + Duration::from_millis(last_ms) + settle;

        loop {
            let next_step = steps
                .front()
                .map(|s| self.start + Duration::from_millis(s.at_ms));
            let next = [next_step, self.next_internal()]
                .into_iter()
                .flatten()
                .min();
            let Some(next) = next.filter(|at| *at <= end) else {
                break;
            };
            self.advance_to(next);
            self.pump();
            while steps
                .front()
                .is_some_and(|s| self.start + Duration::from_millis(s.at_ms) <= next)
            {
                if let Some(step) = steps.pop_front() {
                    tracing::debug!(at_ms = step.at_ms, action = ?step.action, "scenario step");
                    self.apply(step.action)?;
                }
            }
        }
        self.advance_to(end);
        self.pump();
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            ArbiterConfig::from_toml_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => ArbiterConfig::default(),
    };
    let text = std::fs::read_to_string(&cli.scenario)
        .with_context(|| format!("reading scenario {}", cli.scenario.display()))?;
    let scenario: Scenario = toml::from_str(&text)
        .with_context(|| format!("parsing scenario {}", cli.scenario.display()))?;

    tracing::info!(
        scenario = %cli.scenario.display(),
        slots = config.slot_count,
        mode = ?config.command_mode,
        steps = scenario.step.len(),
        "arbiter-sim starting"
    );

    let (clock, mock) = Clock::mock();
    // Start away from zero so deadlines never underflow.
    mock.increment(Duration::from_secs(1));

    let directory = Arc::new(StaticDirectory::new(
        scenario
            .slots
            .iter()
            .map(|s| (*s >= 0).then_some(SubId(*s)))
            .collect(),
    ));
    directory.set_default(scenario.default_sub.map(SubId));
    let radio = Arc::new(SimRadio::new(clock.clone(), &scenario.radio));
    let validator = Arc::new(SimValidator {
        clock: clock.clone(),
        latency: Duration::from_millis(scenario.validator.latency_ms),
        reject: scenario.validator.reject.iter().map(|s| SubId(*s)).collect(),
        pending: Mutex::new(Vec::new()),
    });

    let ports = Ports {
        directory: directory.clone(),
        commands: radio.clone(),
        validator: validator.clone(),
    };
    let start = clock.now();
    let mut arbiter = Arbiter::new(config, clock, ports).context("building arbiter")?;
    let listeners: Vec<Receiver<Notification>> = [
        Topic::ActiveModems,
        Topic::ActiveDataSubscription,
        Topic::Faults,
    ]
    .into_iter()
    .map(|topic| arbiter.subscribe(topic, 1024))
    .collect();

    let mut sim = Sim {
        arbiter,
        mock,
        start,
        directory,
        radio,
        validator,
        listeners,
        replies: Vec::new(),
    };
    sim.drain_output();
    sim.run(scenario.step, Duration::from_millis(scenario.settle_ms))?;

    let arbiter = &sim.arbiter;
    emit(json!({ "t_ms": sim.t_ms(), "final": arbiter.decision() }));
    emit(json!({
        "t_ms": sim.t_ms(),
        "stats": {
            "recomputes": arbiter.recompute_count(),
            "demands": arbiter.demand_count(),
            "default_sub": arbiter.default_data_subscription(),
            "opportunistic": arbiter.opportunistic(),
            "forced_wakelock_releases": arbiter.dispatcher().forced_releases(),
        }
    }));
    Ok(())
}
