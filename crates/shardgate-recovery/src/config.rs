use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, RecoveryResult};

/// Configuration for a placement group's recovery backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Capacity of the backend's command queue. Callers suspend while it is
    /// full.
    pub command_queue_depth: usize,
    /// Upper bound on a single recovery, in milliseconds.
    ///
    /// `None` waits for the protocol indefinitely; only an epoch change or
    /// teardown releases the waiters of a stuck recovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_timeout_ms: Option<u64>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            command_queue_depth: 1024,
            recovery_timeout_ms: None,
        }
    }
}

impl RecoveryConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(s: &str) -> RecoveryResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> RecoveryResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> RecoveryResult<()> {
        if self.command_queue_depth == 0 {
            return Err(RecoveryError::Config(
                "command_queue_depth must be at least 1".into(),
            ));
        }
        if self.recovery_timeout_ms == Some(0) {
            return Err(RecoveryError::Config(
                "recovery_timeout_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn recovery_timeout(&self) -> Option<Duration> {
        self.recovery_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = RecoveryConfig::default();
        assert_eq!(c.command_queue_depth, 1024);
        assert!(c.recovery_timeout().is_none());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn parse_partial_toml() {
        let c = RecoveryConfig::from_toml_str("recovery_timeout_ms = 2500\n").unwrap();
        assert_eq!(c.recovery_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(c.command_queue_depth, 1024);
    }

    #[test]
    fn rejects_zero_queue_depth() {
        let err = RecoveryConfig::from_toml_str("command_queue_depth = 0\n").unwrap_err();
        assert!(err.to_string().contains("command_queue_depth"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let c = RecoveryConfig {
            recovery_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_keeps_timeout() {
        let c = RecoveryConfig {
            command_queue_depth: 64,
            recovery_timeout_ms: Some(30_000),
        };
        let text = c.to_toml_string().unwrap();
        assert_eq!(RecoveryConfig::from_toml_str(&text).unwrap(), c);
    }

    #[test]
    fn default_renders_without_timeout() {
        let text = RecoveryConfig::default().to_toml_string().unwrap();
        assert!(text.contains("command_queue_depth = 1024"));
        assert!(!text.contains("recovery_timeout_ms"));
    }

    #[test]
    fn malformed_toml_is_reported() {
        assert!(matches!(
            RecoveryConfig::from_toml_str("command_queue_depth = \"many\""),
            Err(RecoveryError::ConfigParse(_))
        ));
    }
}
