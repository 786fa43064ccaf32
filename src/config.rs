//! Runtime configuration.
//!
//! Configuration lives in the `[rdmabridge]` table of a TOML file:
//!
//! ```toml
//! [rdmabridge]
//! provider = "soft"
//! dependency_policy = "registry"
//!
//! [[rdmabridge.soft.devices]]
//! name = "softrdma_0"
//! max_cqe = 1024
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::driver::soft::{SoftConfig, SoftDriver};
use crate::driver::Driver;
use crate::error::ConfigError;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "RDMABRIDGE_CONFIG";

/// Environment variable overriding the configured provider.
pub const PROVIDER_ENV: &str = "RDMABRIDGE_PROVIDER";

/// Which driver backs the handles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// The in-process software fabric.
    #[default]
    Soft,
    /// The system's `libibverbs`. Requires the `ibverbs` feature.
    Ibverbs,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soft" => Ok(ProviderKind::Soft),
            "ibverbs" => Ok(ProviderKind::Ibverbs),
            _ => Err(ConfigError::UnknownProvider(s.to_owned())),
        }
    }
}

/// Who refuses out-of-order teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyPolicy {
    /// Dependents are counted in the handle registry and teardown of a
    /// resource with live dependents is rejected before the driver is called.
    #[default]
    Registry,
    /// The driver is always called and its own refusal is reported.
    Driver,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderKind,
    pub dependency_policy: DependencyPolicy,
    pub soft: SoftConfig,
}

impl Config {
    /// Load the `[rdmabridge]` table of a TOML file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_str = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_str)
    }

    /// Parse the `[rdmabridge]` table of a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let mut toml: toml::Table = toml::from_str(toml_str)?;
        let table = toml.remove("rdmabridge").ok_or(ConfigError::MissingTable)?;
        Ok(table.try_into()?)
    }

    /// Configuration from the file named by `RDMABRIDGE_CONFIG` (defaults
    /// when unset), with the provider overridden by `RDMABRIDGE_PROVIDER`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var_os(CONFIG_ENV) {
            Some(path) => {
                log::debug!("loading configuration from {:?}", path);
                Self::load_toml(path)?
            }
            None => Self::default(),
        };
        if let Ok(provider) = env::var(PROVIDER_ENV) {
            config.provider = provider.parse()?;
        }
        Ok(config)
    }

    /// Instantiate the configured driver.
    pub fn build_driver(&self) -> Result<Box<dyn Driver>, ConfigError> {
        match self.provider {
            ProviderKind::Soft => Ok(Box::new(SoftDriver::new(&self.soft))),
            #[cfg(feature = "ibverbs")]
            ProviderKind::Ibverbs => Ok(Box::new(crate::driver::ibverbs::IbvDriver::new())),
            #[cfg(not(feature = "ibverbs"))]
            ProviderKind::Ibverbs => Err(ConfigError::ProviderUnavailable("ibverbs")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::soft::SoftLinkLayer;

    #[test]
    fn test_parse() {
        let config = Config::from_toml_str(
            r#"
            [rdmabridge]
            provider = "soft"
            dependency_policy = "driver"

            [[rdmabridge.soft.devices]]
            name = "roce0"
            link_layer = "ethernet"
            max_cqe = 1024

            [[rdmabridge.soft.devices]]
            name = ""
            "#,
        )
        .unwrap();
        assert_eq!(config.provider, ProviderKind::Soft);
        assert_eq!(config.dependency_policy, DependencyPolicy::Driver);
        assert_eq!(config.soft.devices.len(), 2);
        assert_eq!(config.soft.devices[0].link_layer, SoftLinkLayer::Ethernet);
        assert_eq!(config.soft.devices[0].max_cqe, 1024);
        // Unspecified limits keep their defaults.
        assert_eq!(config.soft.devices[0].max_qp, 1024);
        assert!(config.soft.devices[1].name.is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("[rdmabridge]\n").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.soft.devices.len(), 2);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            Config::from_toml_str("[other]\nx = 1\n"),
            Err(ConfigError::MissingTable)
        ));
        assert!(matches!(
            Config::from_toml_str("[rdmabridge]\nprovider = \"verbs\"\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            "rxe".parse::<ProviderKind>(),
            Err(ConfigError::UnknownProvider(_))
        ));
        assert_eq!(" IBVERBS ".parse::<ProviderKind>().unwrap(), ProviderKind::Ibverbs);
    }

    #[cfg(not(feature = "ibverbs"))]
    #[test]
    fn test_unavailable_provider() {
        let config = Config {
            provider: ProviderKind::Ibverbs,
            ..Default::default()
        };
        assert!(matches!(
            config.build_driver(),
            Err(ConfigError::ProviderUnavailable("ibverbs"))
        ));
    }
}
