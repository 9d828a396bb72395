use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const CONFIG_VERSION: u32 = 1;

/// How routing decisions are realised on the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandMode {
    /// One `set_data_allowed(bool)` per slot.
    #[default]
    DataAllowed,
    /// A single device-wide `set_preferred_data_modem(slot)`.
    PreferredDataModem,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArbiterConfigInput {
    pub version: u32,
    pub arbiter: ArbiterSectionInput,
    pub emergency: EmergencyConfigInput,
    pub commands: CommandConfigInput,
    pub validation: ValidationConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArbiterSectionInput {
    pub slot_count: Option<usize>,
    pub max_active_modems: Option<usize>,
    pub command_mode: Option<CommandMode>,
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmergencyConfigInput {
    pub call_start_timeout_ms: Option<u64>,
    pub ecbm_settle_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommandConfigInput {
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub wakelock_timeout_ms: Option<u64>,
    pub system_error_threshold: Option<u32>,
    pub wakelock_timeout_threshold: Option<u32>,
    pub degraded_cooldown_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ValidationConfigInput {
    pub timeout_ms: Option<u64>,
    pub grace_ms: Option<u64>,
}

/// Two-phase emergency override timing.
#[derive(Debug, Clone)]
pub struct EmergencyConfig {
    /// T1: how long an activated override waits for the call to start.
    pub call_start_timeout: Duration,
    /// T2: settle window after the call ends or ECBM exits.
    pub ecbm_settle: Duration,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            call_start_timeout: Duration::from_millis(5_000),
            ecbm_settle: Duration::from_millis(5_000),
        }
    }
}

/// Retry, liveness and fault-classification knobs for the dispatcher.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Retries after the first attempt before a command is declared failed.
    pub max_retries: u32,
    /// Base retry delay; doubled on every further attempt.
    pub retry_backoff: Duration,
    /// How long the in-flight wakelock may be held before forced release.
    pub wakelock_timeout: Duration,
    /// Consecutive `SystemError`s on one command kind that mark a fault.
    pub system_error_threshold: u32,
    /// Forced wakelock releases on one lane that mark a fault.
    pub wakelock_timeout_threshold: u32,
    /// How long a slot stays degraded after its retries are exhausted.
    pub degraded_cooldown: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            wakelock_timeout: Duration::from_millis(60_000),
            system_error_threshold: 10,
            wakelock_timeout_threshold: 10,
            degraded_cooldown: Duration::from_millis(30_000),
        }
    }
}

impl CommandConfig {
    /// Backoff before retry number `attempt` (1-based), capped at 2^6 × base.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(6);
        self.retry_backoff.saturating_mul(1u32 << shift)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Timeout handed to the validation service.
    pub timeout: Duration,
    /// Extra slack before the coordinator gives up on a silent validator.
    pub grace: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2_000),
            grace: Duration::from_millis(1_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub version: u32,
    pub slot_count: usize,
    pub max_active_modems: usize,
    pub command_mode: CommandMode,
    pub queue_capacity: usize,
    pub emergency: EmergencyConfig,
    pub commands: CommandConfig,
    pub validation: ValidationConfig,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            slot_count: 2,
            max_active_modems: 1,
            command_mode: CommandMode::DataAllowed,
            queue_capacity: 256,
            emergency: EmergencyConfig::default(),
            commands: CommandConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl ArbiterConfigInput {
    pub fn resolve(self) -> Result<ArbiterConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = ArbiterConfig::default();
        let slot_count = self.arbiter.slot_count.unwrap_or(defaults.slot_count);
        let max_active_modems = self
            .arbiter
            .max_active_modems
            .unwrap_or(defaults.max_active_modems);
        let command_mode = self.arbiter.command_mode.unwrap_or_default();

        let config = ArbiterConfig {
            version,
            slot_count,
            max_active_modems,
            command_mode,
            queue_capacity: self
                .arbiter
                .queue_capacity
                .unwrap_or(defaults.queue_capacity)
                .max(16),
            emergency: EmergencyConfig {
                call_start_timeout: ms_or(
                    self.emergency.call_start_timeout_ms,
                    defaults.emergency.call_start_timeout,
                ),
                ecbm_settle: ms_or(self.emergency.ecbm_settle_ms, defaults.emergency.ecbm_settle),
            },
            commands: CommandConfig {
                max_retries: self
                    .commands
                    .max_retries
                    .unwrap_or(defaults.commands.max_retries),
                retry_backoff: ms_or(
                    self.commands.retry_backoff_ms,
                    defaults.commands.retry_backoff,
                ),
                wakelock_timeout: ms_or(
                    self.commands.wakelock_timeout_ms,
                    defaults.commands.wakelock_timeout,
                ),
                system_error_threshold: self
                    .commands
                    .system_error_threshold
                    .unwrap_or(defaults.commands.system_error_threshold)
                    .max(1),
                wakelock_timeout_threshold: self
                    .commands
                    .wakelock_timeout_threshold
                    .unwrap_or(defaults.commands.wakelock_timeout_threshold)
                    .max(1),
                degraded_cooldown: ms_or(
                    self.commands.degraded_cooldown_ms,
                    defaults.commands.degraded_cooldown,
                ),
            },
            validation: ValidationConfig {
                timeout: ms_or(self.validation.timeout_ms, defaults.validation.timeout),
                grace: ms_or(self.validation.grace_ms, defaults.validation.grace),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl ArbiterConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(ArbiterConfig::default());
        }
        let parsed: ArbiterConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.resolve()
    }

    /// Checks the cross-field constraints. Called by `resolve`, and by the
    /// arbiter for configs built in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_count == 0 {
            return Err(ConfigError::NoSlots);
        }
        if self.max_active_modems == 0 || self.max_active_modems > self.slot_count {
            return Err(ConfigError::ActiveCapOutOfRange {
                max_active: self.max_active_modems,
                slots: self.slot_count,
            });
        }
        if self.command_mode == CommandMode::PreferredDataModem && self.max_active_modems != 1 {
            return Err(ConfigError::PreferredModeNeedsSingleActive(
                self.max_active_modems,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [arbiter]
            slot_count = 3
            max_active_modems = 2
            command_mode = "data-allowed"

            [emergency]
            call_start_timeout_ms = 500
            ecbm_settle_ms = 750

            [commands]
            max_retries = 1
            retry_backoff_ms = 50
            system_error_threshold = 4

            [validation]
            timeout_ms = 1500
        "#;

        let cfg = ArbiterConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.slot_count, 3);
        assert_eq!(cfg.max_active_modems, 2);
        assert_eq!(cfg.command_mode, CommandMode::DataAllowed);
        assert_eq!(cfg.emergency.call_start_timeout, Duration::from_millis(500));
        assert_eq!(cfg.emergency.ecbm_settle, Duration::from_millis(750));
        assert_eq!(cfg.commands.max_retries, 1);
        assert_eq!(cfg.commands.retry_backoff, Duration::from_millis(50));
        assert_eq!(cfg.commands.system_error_threshold, 4);
        assert_eq!(cfg.commands.wakelock_timeout, Duration::from_millis(60_000));
        assert_eq!(cfg.validation.timeout, Duration::from_millis(1500));
        assert_eq!(cfg.validation.grace, Duration::from_millis(1000));
    }

    #[test]
    fn empty_input_is_default() {
        let cfg = ArbiterConfig::from_toml_str("  ").unwrap();
        assert_eq!(cfg.slot_count, 2);
        assert_eq!(cfg.max_active_modems, 1);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = ArbiterConfig::from_toml_str("version = 7").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(7)));
    }

    #[test]
    fn rejects_cap_above_slot_count() {
        let toml = r#"
            [arbiter]
            slot_count = 2
            max_active_modems = 3
        "#;
        let err = ArbiterConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::ActiveCapOutOfRange { .. }));
    }

    #[test]
    fn preferred_mode_requires_single_active() {
        let toml = r#"
            [arbiter]
            slot_count = 2
            max_active_modems = 2
            command_mode = "preferred-data-modem"
        "#;
        let err = ArbiterConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::PreferredModeNeedsSingleActive(2)));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let cfg = CommandConfig {
            retry_backoff: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_for(3), Duration::from_millis(400));
        assert_eq!(cfg.backoff_for(40), Duration::from_millis(6_400));
    }
}
