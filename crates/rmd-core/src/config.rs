//! Merge engine configuration.

use serde::Deserialize;

/// Default tombstone horizon: one day of logical time.
pub const DEFAULT_TOMBSTONE_HORIZON_MS: i64 = 24 * 60 * 60 * 1000;

/// Configuration consumed by the merge engine and the RMD codec.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// RMD schema generation rules in effect for the store
    pub rmd_version_id: i32,

    /// Tombstone pruning policy for collection fields
    pub tombstones: TombstonePolicy,
}

/// Bounds on the tombstone lists kept per collection field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TombstonePolicy {
    /// Drop tombstones older than the newest timestamp of the field minus this
    pub horizon_ms: Option<i64>,

    /// Keep at most this many tombstones, newest first
    pub max_tombstones: Option<usize>,
}

impl Default for TombstonePolicy {
    fn default() -> Self {
        Self {
            horizon_ms: Some(DEFAULT_TOMBSTONE_HORIZON_MS),
            max_tombstones: None,
        }
    }
}

impl TombstonePolicy {
    /// A policy that never prunes beyond put supersession.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            horizon_ms: None,
            max_tombstones: None,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            rmd_version_id: 1,
            tombstones: TombstonePolicy::default(),
        }
    }
}

impl MergeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RMD_CONFIG_JSON`: full configuration as JSON, applied first
    /// - `RMD_VERSION_ID`: RMD version id
    /// - `RMD_TOMBSTONE_HORIZON_MS`: pruning horizon, `none` disables it
    /// - `RMD_MAX_TOMBSTONES`: maximum tombstones per field, `none` disables it
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("RMD_CONFIG_JSON") {
            Some(json) => Self::from_json(&json)?,
            None => Self::default(),
        };

        if let Some(raw) = lookup("RMD_VERSION_ID") {
            config.rmd_version_id = parse_var("RMD_VERSION_ID", &raw)?;
        }

        if let Some(raw) = lookup("RMD_TOMBSTONE_HORIZON_MS") {
            config.tombstones.horizon_ms = parse_optional("RMD_TOMBSTONE_HORIZON_MS", &raw)?;
        }

        if let Some(raw) = lookup("RMD_MAX_TOMBSTONES") {
            config.tombstones.max_tombstones = parse_optional("RMD_MAX_TOMBSTONES", &raw)?;
        }

        Ok(config)
    }

    /// Parse configuration from JSON; absent keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

fn parse_optional<T: std::str::FromStr>(
    key: &'static str,
    raw: &str,
) -> Result<Option<T>, ConfigError> {
    if raw.trim().eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        parse_var(key, raw).map(Some)
    }
}

/// Configuration loading errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// Raw value
        value: String,
    },
    /// JSON configuration could not be parsed
    #[error("invalid configuration JSON: {0}")]
    Json(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = MergeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, MergeConfig::default());
        assert_eq!(config.rmd_version_id, 1);
    }

    #[test]
    fn variables_override_json() {
        let config = MergeConfig::from_lookup(lookup(&[
            ("RMD_CONFIG_JSON", r#"{"rmd_version_id": 3, "tombstones": {"max_tombstones": 10}}"#),
            ("RMD_TOMBSTONE_HORIZON_MS", "none"),
            ("RMD_VERSION_ID", "2"),
        ]))
        .unwrap();
        assert_eq!(config.rmd_version_id, 2);
        assert_eq!(config.tombstones.horizon_ms, None);
        assert_eq!(config.tombstones.max_tombstones, Some(10));
    }

    #[test]
    fn malformed_variable_is_reported() {
        let err = MergeConfig::from_lookup(lookup(&[("RMD_MAX_TOMBSTONES", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "RMD_MAX_TOMBSTONES",
                value: "lots".to_string()
            }
        );
    }
}
