//! Configuration management for HomeMesh.
//!
//! Loaded from TOML; every section has defaults so a partial file works.

use crate::error::Error;
use crate::types::{ExclusionStrategy, NodeId, SecurityClass};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub controller: ControllerSection,
    pub security: SecuritySection,
    pub healing: HealingSection,
    pub lifeline: LifelineSection,
    pub exclusion: ExclusionSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub own_node_id: NodeId,
    pub supports_smart_start: bool,
    pub high_power: bool,
    pub network_wide: bool,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            own_node_id: 1,
            supports_smart_start: true,
            high_power: true,
            network_wide: true,
        }
    }
}

/// Network keys (hex, 16 bytes) and handshake deadlines in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub s0_legacy: Option<String>,
    pub s2_unauthenticated: Option<String>,
    pub s2_authenticated: Option<String>,
    pub s2_access_control: Option<String>,
    pub s0_timeout: u64,
    pub ta1: u64,
    pub ta2: u64,
    pub ta3: u64,
    pub ta4: u64,
    pub ta5: u64,
    pub tai1: u64,
    pub tai2: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            s0_legacy: None,
            s2_unauthenticated: None,
            s2_authenticated: None,
            s2_access_control: None,
            s0_timeout: 10_000,
            ta1: 10_000,
            ta2: 10_000,
            ta3: 10_000,
            ta4: 10_000,
            ta5: 10_000,
            tai1: 240_000,
            tai2: 240_000,
        }
    }
}

impl SecuritySection {
    /// Configured hex key for a class, if any.
    pub fn key_hex(&self, class: SecurityClass) -> Option<&str> {
        match class {
            SecurityClass::S0Legacy => self.s0_legacy.as_deref(),
            SecurityClass::S2Unauthenticated => self.s2_unauthenticated.as_deref(),
            SecurityClass::S2Authenticated => self.s2_authenticated.as_deref(),
            SecurityClass::S2AccessControl => self.s2_access_control.as_deref(),
            SecurityClass::None | SecurityClass::Temporary => None,
        }
    }

    /// Decode the configured key for a class.
    pub fn key_bytes(&self, class: SecurityClass) -> Result<Option<[u8; 16]>, Error> {
        let Some(text) = self.key_hex(class) else {
            return Ok(None);
        };
        let bytes = hex::decode(text.trim())
            .map_err(|e| Error::Config(format!("{} key is not valid hex: {}", class, e)))?;
        let key: [u8; 16] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            Error::Config(format!(
                "{} key must be 16 bytes, got {}",
                class,
                bytes.len()
            ))
        })?;
        Ok(Some(key))
    }

    pub fn s0_timeout(&self) -> Duration {
        Duration::from_millis(self.s0_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingSection {
    pub include_sleeping: bool,
    /// Attempts per heal step before the node is declared failed
    pub max_attempts: u8,
}

impl Default for HealingSection {
    fn default() -> Self {
        Self {
            include_sleeping: true,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifelineSection {
    /// Wake-up interval (seconds) used when the node does not report one
    pub wake_up_interval: u32,
}

impl Default for LifelineSection {
    fn default() -> Self {
        Self {
            wake_up_interval: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionSection {
    pub strategy: ExclusionStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot enforce.
    pub fn validate(&self) -> Result<(), Error> {
        if !crate::types::is_valid_node_id(self.controller.own_node_id) {
            return Err(Error::InvalidNodeId(self.controller.own_node_id));
        }
        if self.healing.max_attempts == 0 {
            return Err(Error::Config("healing.max_attempts must be at least 1".into()));
        }
        for class in SecurityClass::GRANTABLE {
            self.security.key_bytes(class)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.controller.own_node_id, 1);
        assert_eq!(config.security.ta1, 10_000);
        assert_eq!(config.security.tai2, 240_000);
        assert_eq!(config.healing.max_attempts, 5);
        assert_eq!(
            config.exclusion.strategy,
            ExclusionStrategy::DisableProvisioningEntry
        );
    }

    #[test]
    fn test_partial_toml() {
        let config = ControllerConfig::from_toml(
            r#"
            [security]
            s0_legacy = "0102030405060708090a0b0c0d0e0f10"
            ta1 = 500

            [healing]
            include_sleeping = false

            [exclusion]
            strategy = "unprovision"
            "#,
        )
        .unwrap();

        assert_eq!(config.security.ta1, 500);
        assert_eq!(config.security.ta2, 10_000);
        assert!(!config.healing.include_sleeping);
        assert_eq!(config.exclusion.strategy, ExclusionStrategy::Unprovision);
        let key = config.security.key_bytes(SecurityClass::S0Legacy).unwrap();
        assert_eq!(key.map(|k| k[15]), Some(0x10));
    }

    #[test]
    fn test_rejects_short_key() {
        let result = ControllerConfig::from_toml(
            r#"
            [security]
            s2_authenticated = "0102"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_broadcast_controller_id() {
        let result = ControllerConfig::from_toml(
            r#"
            [controller]
            own_node_id = 255
            "#,
        );
        assert!(result.is_err());
    }
}
