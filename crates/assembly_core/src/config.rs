//! Runtime configuration for the assembly core.
//!
//! # Responsibility
//! - Define tunables (quorum threshold, code cooldown/TTL, sweep grace).
//! - Load them from TOML with per-field defaults.
//!
//! # Invariants
//! - A `CoreConfig` handed to services has passed `validate()`.
//! - Missing sections or fields fall back to defaults.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Parse(toml::de::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed to read config `{path}`: {source}"),
            Self::Parse(err) => write!(f, "invalid config syntax: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuorumConfig {
    /// Quorum is reached when the present fraction is strictly above this.
    pub threshold: f64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerificationConfig {
    /// Minimum delay before a new code may be requested.
    pub resend_cooldown_secs: u64,
    /// Lifetime of an issued code.
    pub code_ttl_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            resend_cooldown_secs: 60,
            code_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Proxies younger than this are never treated as broken.
    pub grace_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { grace_secs: 120 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of `trace|debug|info|warn|error`.
    pub level: String,
    /// Absolute directory for rolling files; stderr when unset.
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: crate::logging::default_log_level().to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub quorum: QuorumConfig,
    pub verification: VerificationConfig,
    pub reconcile: ReconcileConfig,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.quorum.threshold;
        if !(threshold.is_finite() && (0.0..1.0).contains(&threshold)) {
            return Err(ConfigError::Invalid(format!(
                "quorum.threshold must be within [0, 1), got {threshold}"
            )));
        }
        if self.verification.code_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "verification.code_ttl_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resend_cooldown(&self) -> Duration {
        Duration::from_secs(self.verification.resend_cooldown_secs)
    }

    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.verification.code_ttl_secs)
    }

    pub fn sweep_grace(&self) -> Duration {
        Duration::from_secs(self.reconcile.grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, CoreConfig};

    #[test]
    fn empty_document_uses_defaults() {
        let config = CoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.quorum.threshold, 0.5);
        assert_eq!(config.resend_cooldown().as_secs(), 60);
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config = CoreConfig::from_toml_str(
            "[quorum]\nthreshold = 0.6\n\n[reconcile]\ngrace_secs = 30\n",
        )
        .unwrap();
        assert_eq!(config.quorum.threshold, 0.6);
        assert_eq!(config.reconcile.grace_secs, 30);
        assert_eq!(config.verification.code_ttl_secs, 300);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let err = CoreConfig::from_toml_str("[quorum]\nthreshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_keys_are_syntax_errors() {
        let err = CoreConfig::from_toml_str("[quorum]\nthreshhold = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
