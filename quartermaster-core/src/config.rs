//! Configuration types

use crate::{ConfigError, QuartermasterError, QuartermasterResult};
use serde::{Deserialize, Serialize};

/// Default nesting bound for re-entrant resolution passes.
pub const DEFAULT_MAX_RESOLUTION_DEPTH: u32 = 64;

/// Upper bound accepted by [`ManagerConfig::validate`].
pub const MAX_RESOLUTION_DEPTH_LIMIT: u32 = 4096;

/// Request manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Emit lifecycle chatter (state changes, child linking) at debug level
    pub debug_logging: bool,
    /// How deep resolvers may nest resolution passes by spawning children
    /// synchronously. Deeper passes are skipped and picked up later.
    pub max_resolution_depth: u32,
    /// Re-run resolution for every `Created` request on each tick
    pub retry_unresolved_on_tick: bool,
    /// Cancel requests whose requester is no longer registered on each tick
    pub cancel_orphaned_on_tick: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            debug_logging: false,
            max_resolution_depth: DEFAULT_MAX_RESOLUTION_DEPTH,
            retry_unresolved_on_tick: true,
            cancel_orphaned_on_tick: false,
        }
    }
}

impl ManagerConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `QUARTERMASTER_DEBUG_LOGGING`: Lifecycle debug logging (default: false)
    /// - `QUARTERMASTER_MAX_RESOLUTION_DEPTH`: Resolution nesting bound (default: 64)
    /// - `QUARTERMASTER_RETRY_UNRESOLVED_ON_TICK`: Retry unresolved requests on tick (default: true)
    /// - `QUARTERMASTER_CANCEL_ORPHANED_ON_TICK`: Cancel orphaned requests on tick (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            debug_logging: std::env::var("QUARTERMASTER_DEBUG_LOGGING")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.debug_logging),
            max_resolution_depth: std::env::var("QUARTERMASTER_MAX_RESOLUTION_DEPTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_resolution_depth),
            retry_unresolved_on_tick: std::env::var("QUARTERMASTER_RETRY_UNRESOLVED_ON_TICK")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry_unresolved_on_tick),
            cancel_orphaned_on_tick: std::env::var("QUARTERMASTER_CANCEL_ORPHANED_ON_TICK")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cancel_orphaned_on_tick),
        }
    }

    /// Parse from a TOML table. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> QuartermasterResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> QuartermasterResult<()> {
        if self.max_resolution_depth == 0 {
            return Err(QuartermasterError::Config(ConfigError::InvalidValue {
                field: "max_resolution_depth".to_string(),
                value: self.max_resolution_depth.to_string(),
                reason: "max_resolution_depth must be greater than 0".to_string(),
            }));
        }

        if self.max_resolution_depth > MAX_RESOLUTION_DEPTH_LIMIT {
            return Err(QuartermasterError::Config(ConfigError::InvalidValue {
                field: "max_resolution_depth".to_string(),
                value: self.max_resolution_depth.to_string(),
                reason: format!(
                    "max_resolution_depth must be at most {}",
                    MAX_RESOLUTION_DEPTH_LIMIT
                ),
            }));
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_reads_overrides() {
        std::env::set_var("QUARTERMASTER_MAX_RESOLUTION_DEPTH", "12");
        std::env::set_var("QUARTERMASTER_CANCEL_ORPHANED_ON_TICK", "true");
        std::env::set_var("QUARTERMASTER_DEBUG_LOGGING", "not-a-bool");

        let config = ManagerConfig::from_env();
        assert_eq!(config.max_resolution_depth, 12);
        assert!(config.cancel_orphaned_on_tick);
        assert!(!config.debug_logging);
        assert!(config.retry_unresolved_on_tick);

        std::env::remove_var("QUARTERMASTER_MAX_RESOLUTION_DEPTH");
        std::env::remove_var("QUARTERMASTER_CANCEL_ORPHANED_ON_TICK");
        std::env::remove_var("QUARTERMASTER_DEBUG_LOGGING");
    }

    #[test]
    fn test_default_is_valid() {
        assert!(ManagerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_depth_rejected() {
        let config = ManagerConfig {
            max_resolution_depth: 0,
            ..ManagerConfig::default()
        };
        match config.validate() {
            Err(QuartermasterError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "max_resolution_depth");
            }
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_excessive_depth_rejected() {
        let config = ManagerConfig {
            max_resolution_depth: MAX_RESOLUTION_DEPTH_LIMIT + 1,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ManagerConfig::from_toml_str(
            r#"
            debug_logging = true
            max_resolution_depth = 8
            "#,
        )
        .unwrap();
        assert!(config.debug_logging);
        assert_eq!(config.max_resolution_depth, 8);
        assert_eq!(
            config.retry_unresolved_on_tick,
            ManagerConfig::default().retry_unresolved_on_tick
        );
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        let result = ManagerConfig::from_toml_str("max_resolution_depth = \"deep\"");
        assert!(matches!(
            result,
            Err(QuartermasterError::Config(ConfigError::ParseFailed { .. }))
        ));
    }

    #[test]
    fn test_from_toml_validates() {
        let result = ManagerConfig::from_toml_str("max_resolution_depth = 0");
        assert!(matches!(
            result,
            Err(QuartermasterError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
