//! # Modem Layer
//!
//! Per-slot modem state as the arbiter sees it, plus classification of
//! persistent low-level command faults.

pub mod fault;
pub mod table;

pub use fault::{FaultDetector, FaultKind, FaultStatus, ModemFault};
pub use table::{CallState, ModemSlot, ModemTable};
