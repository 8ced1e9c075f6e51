use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::webauthn::{UserVerificationRequirement, WebAuthnSettings};

/// Directory holding an overriding `Settings.toml`
pub const CONFIG_DIR_ENV: &str = "WEBAUTHN_RP_CONFIG_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub webauthn: WebAuthnSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from configuration files and environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A settings file cannot be read or parsed
    /// - The resulting `WebAuthn` settings are invalid
    pub fn load() -> anyhow::Result<Self> {
        // Initialize environment and logging
        Self::initialize_environment();

        let config_dir = std::env::var(CONFIG_DIR_ENV).ok();
        let mut settings =
            Self::load_base_settings(Path::new("Settings.toml"), config_dir.as_deref())?;

        Self::apply_env_overrides(&mut settings);

        settings
            .webauthn
            .validate()
            .context("Invalid WebAuthn settings")?;
        Ok(settings)
    }

    /// Read `.env` and initialize logging
    fn initialize_environment() {
        Self::load_env_file(Path::new(".env"));
        if env_logger::try_init().is_err() {
            log::debug!("Logger already initialized");
        }
    }

    /// Load base settings from TOML file(s) or use defaults
    /// Settings are loaded with the following priority (highest to lowest):
    /// 1. Environment variables (applied separately after loading base settings)
    /// 2. Settings.toml in `WEBAUTHN_RP_CONFIG_DIR` (if specified and exists)
    /// 3. Settings.toml in current directory (if exists)
    /// 4. Default settings
    fn load_base_settings(default_path: &Path, config_dir: Option<&str>) -> anyhow::Result<Self> {
        let mut settings = Self::default();

        if default_path.exists() {
            settings = Self::read_file(default_path)?;
            log::info!("Loaded base settings from {}", default_path.display());
        }

        if let Some(dir) = config_dir {
            let override_path = Path::new(dir).join("Settings.toml");
            if override_path.exists() {
                settings = Self::read_file(&override_path)?;
                log::info!("Overriding settings from {}", override_path.display());
            } else {
                log::info!(
                    "{CONFIG_DIR_ENV} set but no Settings.toml found at: {}",
                    override_path.display()
                );
            }
        }

        Ok(settings)
    }

    fn read_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        basic_toml::from_str(&content).with_context(|| format!("Cannot parse {}", path.display()))
    }

    /// Apply environment variable overrides to settings
    fn apply_env_overrides(settings: &mut Self) {
        Self::apply_webauthn_env_overrides(&mut settings.webauthn);
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            settings.logging.level = log_level;
        }
    }

    /// Apply environment overrides for relying-party settings
    pub fn apply_webauthn_env_overrides(webauthn: &mut WebAuthnSettings) {
        if let Ok(rp_id) = std::env::var("RP_ID") {
            webauthn.rp_id = rp_id;
        }
        if let Ok(rp_name) = std::env::var("RP_NAME") {
            webauthn.rp_name = rp_name;
        }
        if let Ok(origins) = std::env::var("RP_ORIGINS") {
            let origins: Vec<String> = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect();
            if !origins.is_empty() {
                webauthn.rp_origins = origins;
            }
        }
        Self::apply_numeric_env_override(
            "CHALLENGE_TIMEOUT_SECONDS",
            &mut webauthn.challenge_timeout_seconds,
        );
        if let Ok(value) = std::env::var("USER_VERIFICATION") {
            match value.trim().to_ascii_lowercase().as_str() {
                "required" => webauthn.user_verification = UserVerificationRequirement::Required,
                "preferred" => webauthn.user_verification = UserVerificationRequirement::Preferred,
                "discouraged" => {
                    webauthn.user_verification = UserVerificationRequirement::Discouraged;
                }
                other => log::warn!("Ignoring unknown USER_VERIFICATION value {other}"),
            }
        }
    }

    /// Helper function to apply numeric environment variable overrides
    fn apply_numeric_env_override(env_var: &str, target: &mut u64) {
        if let Ok(value_str) = std::env::var(env_var) {
            if let Ok(value) = value_str.parse::<u64>() {
                *target = value;
            }
        }
    }

    /// Load environment variables from a .env file without replacing set ones
    fn load_env_file(path: &Path) {
        if let Ok(contents) = fs::read_to_string(path) {
            for line in contents.lines() {
                let line = line.trim();
                if line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let key = key.trim();
                    if std::env::var_os(key).is_none() {
                        std::env::set_var(key, value.trim().trim_matches('"'));
                    }
                }
            }
        }
    }
}
