//! # Modem Fault Detection
//!
//! Classifies low-level command trouble into persistent faults:
//!
//! - **Repetitive system error**: the same command kind on the same lane
//!   fails with `SystemError` N times in a row.
//! - **Wakelock timeouts**: the dispatcher had to force-release the in-flight
//!   wakelock N times on a lane (completion never arrived).
//!
//! Each fault is reported once when its threshold is crossed. A successful
//! command clears the system-error streak and re-arms its report; wakelock
//! timeouts are cumulative for the life of the lane.

use std::collections::HashMap;

use serde::Serialize;

use crate::dispatch::Lane;
use crate::error::RadioError;
use crate::ports::CommandKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FaultKind {
    RepetitiveSystemError { command: CommandKind, count: u32 },
    WakelockTimeouts { count: u32 },
}

/// A persistent fault on one command lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModemFault {
    pub lane: Lane,
    #[serde(flatten)]
    pub kind: FaultKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    Healthy,
    RepetitiveSystemError,
    WakelockTimeouts,
}

#[derive(Debug, Default)]
struct LaneFaults {
    system_errors: HashMap<CommandKind, u32>,
    wakelock_timeouts: u32,
    wakelock_reported: bool,
}

#[derive(Debug)]
pub struct FaultDetector {
    system_error_threshold: u32,
    wakelock_timeout_threshold: u32,
    lanes: HashMap<Lane, LaneFaults>,
}

impl FaultDetector {
    pub fn new(system_error_threshold: u32, wakelock_timeout_threshold: u32) -> Self {
        Self {
            system_error_threshold: system_error_threshold.max(1),
            wakelock_timeout_threshold: wakelock_timeout_threshold.max(1),
            lanes: HashMap::new(),
        }
    }

    pub fn system_error_threshold(&self) -> u32 {
        self.system_error_threshold
    }

    pub fn wakelock_timeout_threshold(&self) -> u32 {
        self.wakelock_timeout_threshold
    }

    pub fn record_success(&mut self, lane: Lane, command: CommandKind) {
        if let Some(faults) = self.lanes.get_mut(&lane) {
            faults.system_errors.remove(&command);
        }
    }

    /// Records a failed completion. Returns a fault the first time the
    /// system-error streak reaches the threshold.
    pub fn record_error(
        &mut self,
        lane: Lane,
        command: CommandKind,
        error: &RadioError,
    ) -> Option<ModemFault> {
        let faults = self.lanes.entry(lane).or_default();
        if !error.is_system_error() {
            faults.system_errors.remove(&command);
            return None;
        }

        let count = faults.system_errors.entry(command).or_insert(0);
        *count += 1;
        (*count == self.system_error_threshold).then(|| ModemFault {
            lane,
            kind: FaultKind::RepetitiveSystemError {
                command,
                count: *count,
            },
        })
    }

    /// Records a forced wakelock release. Returns a fault once, when the
    /// cumulative count reaches the threshold.
    pub fn record_wakelock_timeout(&mut self, lane: Lane) -> Option<ModemFault> {
        let faults = self.lanes.entry(lane).or_default();
        faults.wakelock_timeouts += 1;
        if faults.wakelock_reported || faults.wakelock_timeouts < self.wakelock_timeout_threshold {
            return None;
        }
        faults.wakelock_reported = true;
        Some(ModemFault {
            lane,
            kind: FaultKind::WakelockTimeouts {
                count: faults.wakelock_timeouts,
            },
        })
    }

    pub fn wakelock_timeout_count(&self, lane: Lane) -> u32 {
        self.lanes.get(&lane).map_or(0, |f| f.wakelock_timeouts)
    }

    pub fn system_error_streak(&self, lane: Lane, command: CommandKind) -> u32 {
        self.lanes
            .get(&lane)
            .and_then(|f| f.system_errors.get(&command).copied())
            .unwrap_or(0)
    }

    pub fn status(&self, lane: Lane) -> FaultStatus {
        let Some(faults) = self.lanes.get(&lane) else {
            return FaultStatus::Healthy;
        };
        if faults
            .system_errors
            .values()
            .any(|&n| n >= self.system_error_threshold)
        {
            FaultStatus::RepetitiveSystemError
        } else if faults.wakelock_reported {
            FaultStatus::WakelockTimeouts
        } else {
            FaultStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SlotId;

    const LANE: Lane = Lane::Slot(SlotId(0));

    #[test]
    fn system_errors_fault_at_threshold_once() {
        let mut det = FaultDetector::new(3, 10);
        let kind = CommandKind::SetDataAllowed;
        assert!(det.record_error(LANE, kind, &RadioError::SystemError).is_none());
        assert!(det.record_error(LANE, kind, &RadioError::SystemError).is_none());
        let fault = det
            .record_error(LANE, kind, &RadioError::SystemError)
            .expect("third system error is a fault");
        assert_eq!(
            fault.kind,
            FaultKind::RepetitiveSystemError {
                command: kind,
                count: 3
            }
        );
        assert_eq!(det.status(LANE), FaultStatus::RepetitiveSystemError);
        // Past the threshold: no duplicate report.
        assert!(det.record_error(LANE, kind, &RadioError::SystemError).is_none());
    }

    #[test]
    fn success_resets_streak() {
        let mut det = FaultDetector::new(2, 10);
        let kind = CommandKind::SetPreferredDataModem;
        det.record_error(LANE, kind, &RadioError::SystemError);
        det.record_success(LANE, kind);
        assert_eq!(det.system_error_streak(LANE, kind), 0);
        assert!(det.record_error(LANE, kind, &RadioError::SystemError).is_none());
        assert_eq!(det.status(LANE), FaultStatus::Healthy);
    }

    #[test]
    fn other_errors_break_the_streak() {
        let mut det = FaultDetector::new(2, 10);
        let kind = CommandKind::SetDataAllowed;
        det.record_error(LANE, kind, &RadioError::SystemError);
        det.record_error(LANE, kind, &RadioError::RadioNotAvailable);
        assert!(det.record_error(LANE, kind, &RadioError::SystemError).is_none());
    }

    #[test]
    fn streaks_are_per_lane() {
        let mut det = FaultDetector::new(2, 10);
        let kind = CommandKind::SetDataAllowed;
        let other = Lane::Slot(SlotId(1));
        det.record_error(LANE, kind, &RadioError::SystemError);
        assert!(det.record_error(other, kind, &RadioError::SystemError).is_none());
        assert!(det.record_error(LANE, kind, &RadioError::SystemError).is_some());
    }

    #[test]
    fn wakelock_timeouts_accumulate() {
        let mut det = FaultDetector::new(10, 2);
        assert!(det.record_wakelock_timeout(LANE).is_none());
        let fault = det.record_wakelock_timeout(LANE).unwrap();
        assert_eq!(fault.kind, FaultKind::WakelockTimeouts { count: 2 });
        assert!(det.record_wakelock_timeout(LANE).is_none());
        assert_eq!(det.wakelock_timeout_count(LANE), 3);
        assert_eq!(det.status(LANE), FaultStatus::WakelockTimeouts);
    }
}
