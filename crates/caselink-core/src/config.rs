use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::LinkageError;

pub const DEFAULT_IGNORE_TOKEN: &str = "BLACKLISTED";
const MAX_LOOKUP_TIMEOUT_MS: u64 = 600_000;
const MAX_LOOKUP_WORKERS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub config_version: u32,
    /// Literal token that turns a skip marker into an ignore-listed result.
    pub ignore_token: String,
    pub lookup_timeout_ms: u64,
    /// Error codes left out of blocking errors when a caller passes none.
    pub default_blocking_exclude: Vec<String>,
    pub consistency_depth: u32,
    pub refresh_lookup_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_version: 1,
            ignore_token: DEFAULT_IGNORE_TOKEN.to_string(),
            lookup_timeout_ms: 5_000,
            default_blocking_exclude: vec!["missing".to_string()],
            consistency_depth: 1,
            refresh_lookup_workers: 4,
        }
    }
}

impl EngineConfig {
    /// Validates configuration bounds.
    ///
    /// # Errors
    /// Returns [`LinkageError::Configuration`] when any value is out of range.
    pub fn validate(&self) -> Result<(), LinkageError> {
        if self.config_version == 0 {
            return Err(LinkageError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        if self.ignore_token.trim().is_empty() {
            return Err(LinkageError::Configuration(
                "ignore_token MUST be non-empty".to_string(),
            ));
        }

        if !(1..=MAX_LOOKUP_TIMEOUT_MS).contains(&self.lookup_timeout_ms) {
            return Err(LinkageError::Configuration(format!(
                "lookup_timeout_ms MUST be in [1, {MAX_LOOKUP_TIMEOUT_MS}]"
            )));
        }

        if !(1..=MAX_LOOKUP_WORKERS).contains(&self.refresh_lookup_workers) {
            return Err(LinkageError::Configuration(format!(
                "refresh_lookup_workers MUST be in [1, {MAX_LOOKUP_WORKERS}]"
            )));
        }

        if self
            .default_blocking_exclude
            .iter()
            .any(|code| code.trim().is_empty())
        {
            return Err(LinkageError::Configuration(
                "default_blocking_exclude MUST NOT contain blank codes".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON. Absent keys take
    /// their defaults.
    ///
    /// # Errors
    /// Returns [`LinkageError::Configuration`] when JSON decoding fails
    /// or decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, LinkageError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LinkageError::Configuration(format!("invalid engine config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    #[must_use]
    pub fn blocking_exclude(&self) -> BTreeSet<String> {
        self.default_blocking_exclude.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(&json!({"lookup_timeout_ms": 250}));
        match config {
            Ok(config) => {
                assert_eq!(config.lookup_timeout(), Duration::from_millis(250));
                assert_eq!(config.ignore_token, DEFAULT_IGNORE_TOKEN);
                assert_eq!(config.blocking_exclude(), BTreeSet::from(["missing".to_string()]));
            }
            Err(err) => panic!("expected config, got {err}"),
        }
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for payload in [
            json!({"config_version": 0}),
            json!({"ignore_token": "  "}),
            json!({"lookup_timeout_ms": 0}),
            json!({"lookup_timeout_ms": 600_001}),
            json!({"refresh_lookup_workers": 65}),
            json!({"default_blocking_exclude": [""]}),
        ] {
            assert!(
                matches!(
                    EngineConfig::from_json(&payload),
                    Err(LinkageError::Configuration(_))
                ),
                "{payload}"
            );
        }
    }

    #[test]
    fn unknown_types_are_configuration_errors() {
        let result = EngineConfig::from_json(&json!({"consistency_depth": "deep"}));
        assert!(matches!(result, Err(LinkageError::Configuration(message)) if message.contains("invalid engine config")));
    }
}
