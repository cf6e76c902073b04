//! TOML configuration.
//!
//! Everything except secrets lives in the config file. Secrets (chat token,
//! storage keys, embedding API key, trigger shared secret) are read from the
//! environment, optionally seeded from a `.env` file by the binary.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::pipeline::FailurePolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Human-readable status ledger, newest entry first.
    pub ledger_path: PathBuf,
    /// Rendered HTML exports land here; JSON transcripts go to `raw/` below it.
    pub archives_dir: PathBuf,
}

impl ArchiveConfig {
    pub fn raw_dir(&self) -> PathBuf {
        self.archives_dir.join("raw")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExporterConfig {
    #[serde(default = "default_exporter_bin")]
    pub bin: PathBuf,
    #[serde(default = "default_success_marker")]
    pub success_marker: String,
    #[serde(default = "default_exporter_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            bin: default_exporter_bin(),
            success_marker: default_success_marker(),
            timeout_secs: default_exporter_timeout_secs(),
        }
    }
}

fn default_exporter_bin() -> PathBuf {
    PathBuf::from("/opt/app/DiscordChatExporter.Cli")
}
fn default_success_marker() -> String {
    "Successfully exported".to_string()
}
fn default_exporter_timeout_secs() -> u64 {
    600
}

/// Which record answers "may a new job start?".
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    /// The persisted job record in SQLite.
    #[default]
    Jobs,
    /// The first record of the text ledger.
    Ledger,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_local_policy")]
    pub local_policy: FailurePolicy,
    #[serde(default = "default_remote_policy")]
    pub remote_policy: FailurePolicy,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default)]
    pub status_source: StatusSource,
    /// Optional webhook notified with the job outcome of the remote pipeline.
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            local_policy: default_local_policy(),
            remote_policy: default_remote_policy(),
            stage_timeout_secs: default_stage_timeout_secs(),
            status_source: StatusSource::default(),
            callback_url: None,
        }
    }
}

fn default_local_policy() -> FailurePolicy {
    FailurePolicy::Continue
}
fn default_remote_policy() -> FailurePolicy {
    FailurePolicy::Abort
}
fn default_stage_timeout_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// S3-compatible endpoint (e.g. `https://nyc3.digitaloceanspaces.com`).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default = "default_acl")]
    pub acl: String,
    /// Base URL under which uploaded keys are reachable.
    pub public_base_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_acl() -> String {
    "private".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    /// Category that archived channels are moved into.
    #[serde(default)]
    pub archive_category_id: Option<String>,
    /// Link shown to members once a channel has been archived.
    #[serde(default)]
    pub archive_site_url: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base: default_chat_api_base(),
            guild_id: None,
            archive_category_id: None,
            archive_site_url: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_chat_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}
fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for OpenAI-compatible or Ollama endpoints.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `sqlite` keeps vectors next to the message store; `qdrant` pushes them
    /// to a Qdrant collection over REST.
    #[serde(default = "default_index_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            url: None,
            collection: default_collection(),
        }
    }
}

fn default_index_backend() -> String {
    "sqlite".to_string()
}
fn default_collection() -> String {
    "channel_messages".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.exporter.success_marker.trim().is_empty() {
        bail!("exporter.success_marker must not be empty");
    }
    if config.exporter.timeout_secs == 0 || config.pipeline.stage_timeout_secs == 0 {
        bail!("exporter.timeout_secs and pipeline.stage_timeout_secs must be > 0");
    }

    if let Some(storage) = &config.storage {
        match storage.acl.as_str() {
            "private" | "public-read" => {}
            other => bail!(
                "Unknown storage.acl: '{}'. Must be private or public-read.",
                other
            ),
        }
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.index.backend.as_str() {
        "sqlite" => {}
        "qdrant" => {
            if config.index.url.is_none() {
                bail!("index.url must be set when index.backend is 'qdrant'");
            }
        }
        other => bail!(
            "Unknown index backend: '{}'. Must be sqlite or qdrant.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/archive.sqlite"

[archive]
ledger_path = "/tmp/log.txt"
archives_dir = "/tmp/archives"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.exporter.success_marker, "Successfully exported");
        assert_eq!(config.pipeline.local_policy, FailurePolicy::Continue);
        assert_eq!(config.pipeline.remote_policy, FailurePolicy::Abort);
        assert_eq!(config.pipeline.status_source, StatusSource::Jobs);
        assert_eq!(config.index.backend, "sqlite");
        assert!(config.storage.is_none());
        assert_eq!(
            config.archive.raw_dir(),
            PathBuf::from("/tmp/archives/raw")
        );
    }

    #[test]
    fn rejects_unknown_acl() {
        let raw = format!(
            "{}\n[storage]\nbucket = \"b\"\nacl = \"world-writable\"\npublic_base_url = \"https://b\"\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn qdrant_requires_url() {
        let raw = format!("{}\n[index]\nbackend = \"qdrant\"\n", MINIMAL);
        let config: Config = toml::from_str(&raw).unwrap();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("index.url"));
    }

    #[test]
    fn policies_are_configurable() {
        let raw = format!(
            "{}\n[pipeline]\nlocal_policy = \"abort\"\nremote_policy = \"continue\"\nstatus_source = \"ledger\"\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&raw).unwrap();
        assert_eq!(config.pipeline.local_policy, FailurePolicy::Abort);
        assert_eq!(config.pipeline.remote_policy, FailurePolicy::Continue);
        assert_eq!(config.pipeline.status_source, StatusSource::Ledger);
    }
}
