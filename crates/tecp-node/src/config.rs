//! Top-level configuration for tecp-node.
//!
//! Loaded from `tecp.toml` in the working directory or a user-specified
//! path, then overridden by `TECP_*` environment variables (the issuer
//! surface is conventionally environment-driven in deployments).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::verify::profile::Profile;

/// Environment variable names recognized by [`Config::apply_env`].
pub const ENV_PROFILE: &str = "TECP_PROFILE";
pub const ENV_SIGNING_KEY: &str = "TECP_SIGNING_KEY";
pub const ENV_KID: &str = "TECP_KID";
pub const ENV_LOG_URL: &str = "TECP_LOG_URL";
pub const ENV_DATA_DIR: &str = "TECP_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admission profile: lite or strict.
    pub profile: Profile,

    /// Receipt issuance settings.
    pub issuer: IssuerConfig,

    /// Transparency ledger settings.
    pub ledger: LedgerConfig,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::for_profile(Profile::Lite)
    }
}

impl Config {
    /// Configuration with profile-appropriate defaults.
    #[must_use]
    pub fn for_profile(profile: Profile) -> Self {
        Self {
            profile,
            issuer: IssuerConfig::default(),
            ledger: LedgerConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(path.into(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(path.into(), e))
    }

    /// Discover and load configuration.
    ///
    /// Search order: explicit path, then `./tecp.toml`; defaults otherwise.
    /// Environment overrides apply in every case.
    pub fn discover(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = explicit_path {
            Self::load(path)?
        } else {
            let candidate = PathBuf::from("tecp.toml");
            if candidate.exists() {
                Self::load(&candidate)?
            } else {
                Self::default()
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `TECP_*` environment overrides in place.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(profile) = std::env::var(ENV_PROFILE) {
            self.profile = profile
                .parse()
                .map_err(|_| ConfigError::InvalidProfile(profile))?;
        }
        if let Ok(path) = std::env::var(ENV_SIGNING_KEY) {
            self.issuer.signing_key_path = Some(PathBuf::from(path));
        }
        if let Ok(kid) = std::env::var(ENV_KID) {
            self.issuer.kid = Some(kid);
        }
        if let Ok(url) = std::env::var(ENV_LOG_URL) {
            self.issuer.log_url = Some(url);
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            self.ledger.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Serialize this configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)
    }
}

// -- Issuer --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// Path to the hex-encoded Ed25519 seed used for signing receipts.
    pub signing_key_path: Option<PathBuf>,

    /// Key id advertised for the issuer key. Derived from the public key
    /// when unset.
    pub kid: Option<String>,

    /// Transparency log endpoint receipts are submitted to, when any.
    pub log_url: Option<String>,

    /// Default code reference stamped into receipts.
    pub code_ref: Option<String>,
}

// -- Ledger --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory holding `entries.jsonl`, `sth.jsonl`, and the log key.
    pub data_dir: PathBuf,

    /// Path to the ledger's hex-encoded signing seed. Defaults to
    /// `<data_dir>/log.key`.
    pub signing_key_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tecp-ledger"),
            signing_key_path: None,
        }
    }
}

impl LedgerConfig {
    #[must_use]
    pub fn signing_key_path(&self) -> PathBuf {
        self.signing_key_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("log.key"))
    }
}

// -- Observability --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
        }
    }
}

// -- Errors --

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),

    #[error("failed to serialize config: {0}")]
    SerializeFailed(toml::ser::Error),

    #[error("invalid profile: {0} (expected: lite, strict)")]
    InvalidProfile(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_lite() {
        let config = Config::default();
        assert_eq!(config.profile, Profile::Lite);
        assert_eq!(config.ledger.data_dir, PathBuf::from("tecp-ledger"));
        assert_eq!(config.observability.log_filter, "info");
    }

    #[test]
    fn ledger_key_path_defaults_under_data_dir() {
        let config = Config::default();
        assert_eq!(
            config.ledger.signing_key_path(),
            PathBuf::from("tecp-ledger/log.key")
        );
    }

    #[test]
    fn roundtrip_toml_serialization() {
        let config = Config::for_profile(Profile::Strict);
        let toml_str = config.to_toml().expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.profile, Profile::Strict);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: Config = toml::from_str("profile = \"strict\"").expect("parse");
        assert_eq!(parsed.profile, Profile::Strict);
        assert_eq!(parsed.ledger.data_dir, PathBuf::from("tecp-ledger"));
    }

    #[test]
    fn load_nonexistent_file_returns_error() {
        assert!(Config::load(Path::new("/nonexistent/tecp.toml")).is_err());
    }

    #[test]
    fn load_from_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tecp.toml");
        std::fs::write(&path, "profile = \"strict\"\n[ledger]\ndata_dir = \"/var/tecp\"\n")
            .expect("write");
        let config = Config::load(&path).expect("load");
        assert_eq!(config.profile, Profile::Strict);
        assert_eq!(config.ledger.data_dir, PathBuf::from("/var/tecp"));
    }
}
