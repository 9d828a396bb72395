//! Multi-modem data-path arbiter.
//!
//! Decides which cellular modem(s) of a multi-SIM device may carry IP data
//! and drives the asynchronous radio commands that realise the decision.
//!
//! - **Demand Registry** (`demand`): outstanding connectivity demands
//! - **Modem State Table** (`modem`): per-slot state and fault detection
//! - **Command Dispatcher** (`dispatch`): one command in flight per lane, retries, wakelock liveness
//! - **Validation Coordinator** (`validation`): at most one outstanding validation
//! - **Emergency Override** (`emergency`): pins data around an emergency call
//! - **Arbitration Engine** (`engine`): pure decision plus the event-driven controller
//! - **Runtime** (`runtime`): worker thread owning the arbiter

pub mod config;
pub mod demand;
pub mod dispatch;
pub mod emergency;
pub mod engine;
pub mod error;
pub mod event;
pub mod ids;
pub mod modem;
pub mod notify;
pub mod ports;
pub mod runtime;
pub mod testing;
pub mod timer;
pub mod validation;

pub use config::{ArbiterConfig, CommandMode};
pub use demand::NetworkDemand;
pub use engine::{Arbiter, Ports, RoutingDecision};
pub use error::{ArbiterError, ConfigError, RadioError};
pub use event::{event_queue, Event, EventSender, OpportunisticResult, OpportunisticTarget};
pub use ids::{CommandToken, DemandId, SlotId, SubId, ValidationTicket};
pub use notify::{Notification, Topic};
pub use runtime::ArbiterRuntime;
