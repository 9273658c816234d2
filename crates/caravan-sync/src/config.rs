//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CARAVAN_DEVICE_ID=abc-123                                          │
//! │     CARAVAN_DEVICE_ROLE=instructor                                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/caravan/sync.toml (Linux)                                │
//! │     ~/Library/Application Support/com.caravan.sync/sync.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, empty window table                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Classroom Tablet 3"
//! role = "learner"            # default origin role for enqueued operations
//!
//! [sync]
//! max_batch = 50
//! max_concurrency = 2
//! poll_interval_secs = 300
//! max_attempts = 5
//!
//! [policy]
//! critical_battery_percent = 15
//! utc_offset_minutes = 300
//!
//! [[policy.blackout_windows]]
//! name = "quiet-hours"
//! start = "22:00:00"
//! end = "06:00:00"
//!
//! [resolver]
//! protected_kinds = ["update-assessment"]
//! sensitive_kinds = ["edit-content"]
//!
//! [resolver.role_ranks]
//! instructor = 10
//! learner = 1
//!
//! [cache]
//! max_bytes = 67108864
//! encrypted_kinds = ["update-assessment"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

use caravan_core::policy::PolicyConfig;
use caravan_core::resolver::ResolverRules;
use caravan_store::cache::CacheConfig;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name.
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Default origin role stamped on operations enqueued without one.
    /// Consulted by the role-precedence conflict rule.
    #[serde(default)]
    pub role: Option<String>,
}

fn default_device_name() -> String {
    "Caravan Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
            role: None,
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Session and retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Maximum operations selected per session.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Bounded worker pool size for the push phase.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Interval between background sessions (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Debounce after an offline→connected transition (milliseconds).
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Maximum transmission attempts per operation before terminal failure.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff duration (milliseconds) between attempts.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) between attempts.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Timeout for one pull call (seconds).
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,

    /// Timeout for one push call (seconds).
    #[serde(default = "default_push_timeout")]
    pub push_timeout_secs: u64,

    /// Consecutive terminal push failures that trip the circuit breaker.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// Cool-down while the breaker is open (seconds). Pulls continue.
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,

    /// Checkpoint the operation log every N sessions.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every_sessions: u32,
}

fn default_max_batch() -> usize {
    50
}

fn default_max_concurrency() -> usize {
    2
}

fn default_poll_interval() -> u64 {
    300
}

fn default_debounce() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    60
}

fn default_pull_timeout() -> u64 {
    30
}

fn default_push_timeout() -> u64 {
    30
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    120
}

fn default_checkpoint_every() -> u32 {
    8
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_batch: default_max_batch(),
            max_concurrency: default_max_concurrency(),
            poll_interval_secs: default_poll_interval(),
            debounce_ms: default_debounce(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            pull_timeout_secs: default_pull_timeout(),
            push_timeout_secs: default_push_timeout(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            checkpoint_every_sessions: default_checkpoint_every(),
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Cache Store tuning, translated into [`CacheConfig`] at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Byte budget `compact()` shrinks towards.
    #[serde(default = "default_cache_bytes")]
    pub max_bytes: u64,

    /// Default TTL (seconds) for entries written without one.
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,

    /// Kinds stored as sealed blobs.
    #[serde(default)]
    pub encrypted_kinds: Vec<String>,
}

fn default_cache_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            max_bytes: default_cache_bytes(),
            default_ttl_secs: None,
            encrypted_kinds: Vec::new(),
        }
    }
}

impl CacheSettings {
    /// Builds the store-level configuration.
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_bytes: self.max_bytes,
            default_ttl: self
                .default_ttl_secs
                .map(std::time::Duration::from_secs),
            encrypted_kinds: self.encrypted_kinds.iter().cloned().collect(),
        }
    }
}

// =============================================================================
// Sync Config
// =============================================================================

/// Complete configuration for the sync engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device identity.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Session/retry tuning.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Policy Gate configuration (blackout windows, battery thresholds).
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Conflict Resolver ruleset (protected/sensitive kinds, role ranks).
    #[serde(default)]
    pub resolver: ResolverRules,

    /// Cache Store tuning.
    #[serde(default)]
    pub cache: CacheSettings,
}

impl SyncConfig {
    /// Default config file location for this platform.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "caravan", "sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Loads configuration: file if present, defaults otherwise,
    /// environment overrides on top.
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        let path = path.or_else(Self::default_path);

        let mut config = match &path {
            Some(p) if p.exists() => match Self::load(p) {
                Ok(config) => {
                    info!(path = %p.display(), "Loaded sync configuration");
                    config
                }
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "Failed to load config, using defaults");
                    SyncConfig::default()
                }
            },
            _ => SyncConfig::default(),
        };

        config.apply_env_overrides();
        config
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &std::path::Path) -> SyncResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Saves configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &std::path::Path) -> SyncResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("CARAVAN_DEVICE_ID") {
            if !id.trim().is_empty() {
                self.device.id = id;
            }
        }
        if let Ok(role) = std::env::var("CARAVAN_DEVICE_ROLE") {
            if !role.trim().is_empty() {
                self.device.role = Some(role);
            }
        }
    }

    /// Validates the configuration before the agent starts.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }
        if self.sync.max_batch == 0 {
            return Err(SyncError::InvalidConfig("sync.max_batch must be >= 1".into()));
        }
        if self.sync.max_concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.max_concurrency must be >= 1".into(),
            ));
        }
        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.max_attempts must be >= 1".into(),
            ));
        }
        if self.policy.critical_battery_percent > 100 {
            return Err(SyncError::InvalidConfig(
                "policy.critical_battery_percent must be 0-100".into(),
            ));
        }
        for window in &self.policy.blackout_windows {
            if window.name.trim().is_empty() {
                return Err(SyncError::InvalidConfig(
                    "policy.blackout_windows entries need a name".into(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = SyncConfig::default();
        config.sync.max_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unnamed_window() {
        let mut config = SyncConfig::default();
        config.policy.blackout_windows.push(caravan_core::BlackoutWindow {
            name: "  ".into(),
            start: chrono::NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: chrono::NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
            [device]
            id = "device-1"
            role = "instructor"

            [sync]
            max_batch = 10
            max_concurrency = 4

            [policy]
            critical_battery_percent = 20
            utc_offset_minutes = 300

            [[policy.blackout_windows]]
            name = "quiet-hours"
            start = "22:00:00"
            end = "06:00:00"

            [resolver]
            protected_kinds = ["update-assessment"]
            sensitive_kinds = ["edit-content"]

            [resolver.role_ranks]
            instructor = 10
            learner = 1

            [cache]
            max_bytes = 1024
            encrypted_kinds = ["update-assessment"]
        "#;

        let config: SyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.id, "device-1");
        assert_eq!(config.sync.max_batch, 10);
        assert_eq!(config.sync.max_concurrency, 4);
        // Omitted fields fall back to defaults.
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.policy.blackout_windows.len(), 1);
        assert_eq!(config.policy.blackout_windows[0].name, "quiet-hours");
        assert!(config.resolver.is_protected("update-assessment"));
        assert_eq!(config.resolver.rank(Some("instructor")), Some(10));
        assert_eq!(config.cache.to_cache_config().max_bytes, 1024);

        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed: SyncConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed.device.id, "device-1");
        assert_eq!(reparsed.policy.blackout_windows.len(), 1);
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.device.id = "device-42".into();
        config.save(&path).unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded.device.id, "device-42");
    }
}
