//! Configuration for Lifeline
//!
//! Two layers, mirroring how the daemon is deployed:
//! - [`Args`]: CLI flags with environment fallbacks (clap), `.env` aware
//! - [`LifelineConfig`]: TOML policy file, every section optional
//!
//! CLI values override the file.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::dispatch::DispatchConfig;
use crate::evidence::{AccessConfig, ChunkStoreConfig};
use crate::incident::OrchestratorConfig;
use crate::responders::DirectoryConfig;
use crate::topics::TopicsConfig;

/// Lifeline - incident fan-out and evidence custody daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "lifeline")]
#[command(about = "Emergency incident fan-out and evidence custody service")]
pub struct Args {
    /// Path to TOML config file
    #[arg(short, long, env = "LIFELINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on (overrides config file)
    #[arg(long, env = "LIFELINE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Storage directory for evidence blobs (overrides config file)
    #[arg(long, env = "LIFELINE_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Keep evidence in memory instead of on disk (development only)
    #[arg(long, env = "LIFELINE_MEMORY_STORAGE", default_value = "false")]
    pub memory_storage: bool,

    /// JSON file with users, emergency contacts and guardian links
    #[arg(long, env = "LIFELINE_IDENTITY_FILE")]
    pub identity_file: Option<PathBuf>,

    /// Secret for signing evidence access references
    #[arg(long, env = "LIFELINE_SIGNING_SECRET", hide_env_values = true)]
    pub signing_secret: Option<String>,

    /// Log level for the lifeline target
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

/// Where finalized evidence streams are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Filesystem,
}

/// Object storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub storage_dir: PathBuf,
}

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lifeline")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Filesystem,
            storage_dir: default_storage_dir(),
        }
    }
}

/// Webhook endpoints for notification providers
///
/// A missing endpoint disables that channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelEndpoints {
    pub push_url: Option<String>,
    pub sms_url: Option<String>,
    pub mesh_url: Option<String>,
    pub authority_url: Option<String>,
}

/// Full daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifelineConfig {
    pub listen: SocketAddr,
    pub storage: StorageConfig,
    pub evidence: ChunkStoreConfig,
    pub access: AccessConfig,
    pub dispatch: DispatchConfig,
    pub directory: DirectoryConfig,
    pub incident: OrchestratorConfig,
    pub topics: TopicsConfig,
    pub channels: ChannelEndpoints,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8088))
}

impl Default for LifelineConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            storage: StorageConfig::default(),
            evidence: ChunkStoreConfig::default(),
            access: AccessConfig::default(),
            dispatch: DispatchConfig::default(),
            directory: DirectoryConfig::default(),
            incident: OrchestratorConfig::default(),
            topics: TopicsConfig::default(),
            channels: ChannelEndpoints::default(),
        }
    }
}

impl LifelineConfig {
    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Apply CLI overrides on top of the file values
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = args.listen {
            self.listen = listen;
        }
        if let Some(dir) = &args.storage_dir {
            self.storage.storage_dir = dir.clone();
        }
        if args.memory_storage {
            self.storage.backend = StorageBackend::Memory;
        }
        if let Some(secret) = &args.signing_secret {
            self.access.signing_secret = Some(secret.clone());
        }
    }

    /// Check cross-field constraints the type system cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.dispatch.fanout_size == 0 {
            return Err("dispatch.fanout_size must be at least 1".into());
        }
        if self.dispatch.max_tier == 0 {
            return Err("dispatch.max_tier must be at least 1".into());
        }
        if self.dispatch.tier_deadline_ms == 0 {
            return Err("dispatch.tier_deadline_ms must be positive".into());
        }
        if self.evidence.max_chunk_bytes == 0 {
            return Err("evidence.max_chunk_bytes must be positive".into());
        }
        if self.evidence.session_ttl_secs == 0 {
            return Err("evidence.session_ttl_secs must be positive".into());
        }
        if self.access.ttl_secs <= 0 {
            return Err("access.ttl_secs must be positive".into());
        }
        if self.directory.max_clock_skew_secs < 0 {
            return Err("directory.max_clock_skew_secs must not be negative".into());
        }
        if !(0.0..=1.0).contains(&self.incident.authority_escalation_threshold) {
            return Err("incident.authority_escalation_threshold must be within [0, 1]".into());
        }
        if self.directory.default_radius_meters <= 0.0 {
            return Err("directory.default_radius_meters must be positive".into());
        }
        Ok(())
    }

    /// Directory for filesystem evidence blobs
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage.storage_dir.join("evidence")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = LifelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.fanout_size, 5);
        assert_eq!(config.dispatch.tier_deadline_ms, 45_000);
        assert_eq!(config.evidence.session_ttl_secs, 3600);
        assert_eq!(config.access.ttl_secs, 3600);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let config: LifelineConfig = toml::from_str(
            r#"
            [dispatch]
            fanout_size = 2
            max_tier = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatch.fanout_size, 2);
        assert_eq!(config.dispatch.max_tier, 4);
        assert_eq!(config.dispatch.tier_deadline_ms, 45_000);
        assert_eq!(config.storage.backend, StorageBackend::Filesystem);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lifeline.toml");

        let mut config = LifelineConfig::default();
        config.dispatch.fanout_size = 3;
        config.channels.sms_url = Some("http://sms.local/send".into());
        config.save(&path).unwrap();

        let loaded = LifelineConfig::load(&path).unwrap();
        assert_eq!(loaded.dispatch.fanout_size, 3);
        assert_eq!(loaded.channels.sms_url.as_deref(), Some("http://sms.local/send"));
    }

    #[test]
    fn test_validate_rejects_zero_fanout() {
        let mut config = LifelineConfig::default();
        config.dispatch.fanout_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dead_on_arrival_lifetimes() {
        let mut config = LifelineConfig::default();
        config.access.ttl_secs = 0;
        assert!(config.validate().unwrap_err().contains("access.ttl_secs"));

        let mut config = LifelineConfig::default();
        config.access.ttl_secs = -60;
        assert!(config.validate().is_err());

        let mut config = LifelineConfig::default();
        config.evidence.session_ttl_secs = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .contains("evidence.session_ttl_secs"));
    }
}
