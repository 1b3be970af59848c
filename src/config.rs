use crate::engine::EngineSettings;
use chrono::Duration;
use std::env;
use std::path::PathBuf;

/// Upper bound on the resolution claim lease (one week).
pub const MAX_CLAIM_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Configuration for the guarantee-engine CLI tool
///
/// Single-process config: one data directory holding the journal, the state
/// snapshot and the sandbox gateway ledger.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path (default: `.guarantee-engine/` in current directory)
    pub data_dir: PathBuf,

    /// Output format: "human" (default) or "json"
    pub output_format: String,

    /// Log level: "info", "debug", "warn", "error" (default: "info")
    pub log_level: String,

    /// How long a payout resolution claim stays live before it counts as abandoned
    pub claim_ttl_secs: i64,

    /// Currency passed to the payment gateway
    pub currency: String,
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        let data_dir = env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".guarantee-engine");

        Config {
            data_dir,
            output_format: "human".to_string(),
            log_level: "info".to_string(),
            claim_ttl_secs: 300,
            currency: "usd".to_string(),
        }
    }

    /// Create config with custom data directory
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Config {
            data_dir,
            ..Config::new()
        }
    }

    pub fn get_data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }

    pub fn get_output_format(&self) -> &str {
        &self.output_format
    }

    /// Set output format ("human" or "json")
    pub fn set_output_format(&mut self, format: String) {
        self.output_format = format;
    }

    pub fn get_log_level(&self) -> &str {
        &self.log_level
    }

    pub fn set_log_level(&mut self, level: String) {
        self.log_level = level;
    }

    /// Append-only journal of every persisted row change
    pub fn get_journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.log")
    }

    /// Get state snapshot path
    pub fn get_state_path(&self) -> PathBuf {
        self.data_dir.join("state.bin")
    }

    /// Sandbox payment gateway ledger (JSON)
    pub fn get_gateway_path(&self) -> PathBuf {
        self.data_dir.join("gateway.json")
    }

    /// Settings handed to the engine.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            claim_ttl: Duration::seconds(self.claim_ttl_secs.clamp(1, MAX_CLAIM_TTL_SECS)),
            currency: self.currency.clone(),
            ..EngineSettings::default()
        }
    }

    /// Load config from environment variables
    ///
    /// Environment variables:
    /// - `GUARANTEE_ENGINE_DATA_DIR`: override data directory
    /// - `GUARANTEE_ENGINE_OUTPUT_FORMAT`: "human" or "json"
    /// - `GUARANTEE_ENGINE_LOG_LEVEL`: log level
    /// - `GUARANTEE_ENGINE_CLAIM_TTL_SECS`: resolution claim lease in seconds
    /// - `GUARANTEE_ENGINE_CURRENCY`: gateway currency code
    pub fn from_env() -> Self {
        let mut config = Config::new();

        if let Ok(dir) = env::var("GUARANTEE_ENGINE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(format) = env::var("GUARANTEE_ENGINE_OUTPUT_FORMAT") {
            config.output_format = format;
        }

        if let Ok(level) = env::var("GUARANTEE_ENGINE_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Ok(ttl) = env::var("GUARANTEE_ENGINE_CLAIM_TTL_SECS") {
            if let Ok(secs) = ttl.trim().parse::<i64>() {
                config.claim_ttl_secs = secs;
            }
        }

        if let Ok(currency) = env::var("GUARANTEE_ENGINE_CURRENCY") {
            config.currency = currency.to_lowercase();
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::new();
        assert_eq!(config.output_format, "human");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.claim_ttl_secs, 300);
        assert!(config.data_dir.ends_with(".guarantee-engine"));
    }

    #[test]
    fn test_config_paths() {
        let config = Config::with_data_dir(PathBuf::from("/tmp/ge"));
        assert!(config.get_journal_path().ends_with("journal.log"));
        assert!(config.get_state_path().ends_with("state.bin"));
        assert!(config.get_gateway_path().ends_with("gateway.json"));
    }

    #[test]
    fn test_engine_settings_clamps_ttl() {
        let mut config = Config::new();
        config.claim_ttl_secs = 0;
        let settings = config.engine_settings();
        assert_eq!(settings.claim_ttl, Duration::seconds(1));
        assert_eq!(settings.currency, "usd");

        config.claim_ttl_secs = i64::MAX;
        let settings = config.engine_settings();
        assert_eq!(settings.claim_ttl, Duration::seconds(MAX_CLAIM_TTL_SECS));
    }

    #[test]
    fn test_config_setters() {
        let mut config = Config::new();
        config.set_output_format("json".to_string());
        assert_eq!(config.get_output_format(), "json");

        config.set_log_level("debug".to_string());
        assert_eq!(config.get_log_level(), "debug");
    }
}
