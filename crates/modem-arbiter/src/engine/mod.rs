//! # Arbitration Engine
//!
//! [`decision`] is the pure function from state to routing; [`arbiter`] is
//! the event-driven controller that feeds it and converges the radios.

pub mod arbiter;
pub mod decision;

pub use arbiter::{Arbiter, Ports};
pub use decision::{decide, DecisionInput, RoutingDecision};
