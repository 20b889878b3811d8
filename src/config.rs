//! Configuration management.
//!
//! A `Config` is read from a file (TOML, YAML or JSON by extension) and
//! applied on top of `Settings::default()`. Every field in the file is
//! optional; relative paths resolve against the file's directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Stage;
use crate::policy::{RetryPolicy, SeedConfig};
use crate::repository::{DbContext, DieselError};
use crate::services::ExtractorConfig;
use crate::stages::triage::routing::RoutingSettings;
use crate::stages::{DownloadSettings, TomadosSettings, TriageSettings};

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "osflow.db";

const DOWNLOADS_SUBDIR: &str = "baixados";
const WORK_SUBDIR: &str = "separados";
const INBOX_SUBDIR: &str = "inbox";
const BUCKET_SUBDIR: &str = "bucket";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {format} config {path}: {message}")]
    Parse {
        path: PathBuf,
        format: &'static str,
        message: String,
    },
}

/// Retry and cadence knobs shared by every stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageTuning {
    pub max_attempts: u32,
    pub cooldown_minutes: u64,
    pub poll_interval_secs: u64,
    pub claim_batch: usize,
}

impl StageTuning {
    fn defaults_for(stage: Stage) -> Self {
        let poll_interval_secs = match stage {
            Stage::Download => 200,
            Stage::Triage => 10,
            Stage::Tomados => 30,
        };
        Self {
            max_attempts: 3,
            cooldown_minutes: 15,
            poll_interval_secs,
            claim_batch: 20,
        }
    }
}

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename inside `data_dir`.
    pub database_filename: String,
    /// Database URL (overrides data_dir/database_filename if set).
    pub database_url: Option<String>,
    /// Pristine copy of downloaded OS folders.
    pub downloads_dir: PathBuf,
    /// Folders triage reorganizes and tomados reads.
    pub work_dir: PathBuf,
    /// Where the portal drops OS exports.
    pub inbox_dir: PathBuf,
    /// Root of the local object store.
    pub bucket_dir: PathBuf,
    /// Claims older than this are returned to pending.
    pub claim_timeout_minutes: u64,
    pub download: StageTuning,
    pub triage: StageTuning,
    pub tomados: StageTuning,
    pub seed_window: u32,
    pub seed_min_id: Option<i64>,
    pub max_attachments: usize,
    pub max_files: usize,
    pub max_pages: u32,
    pub confidence_threshold: f32,
    pub extractor_endpoint: String,
    pub extractor_timeout_secs: u64,
    pub extractor_delay_ms: u64,
    /// Object key prefix for uploaded ledgers.
    pub results_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("osflow");
        Self::with_data_dir(data_dir)
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            downloads_dir: data_dir.join(DOWNLOADS_SUBDIR),
            work_dir: data_dir.join(WORK_SUBDIR),
            inbox_dir: data_dir.join(INBOX_SUBDIR),
            bucket_dir: data_dir.join(BUCKET_SUBDIR),
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            database_url: None,
            claim_timeout_minutes: 90,
            download: StageTuning::defaults_for(Stage::Download),
            triage: StageTuning::defaults_for(Stage::Triage),
            tomados: StageTuning::defaults_for(Stage::Tomados),
            seed_window: 10,
            seed_min_id: None,
            max_attachments: 50,
            max_files: 500,
            max_pages: 299,
            confidence_threshold: 0.99,
            extractor_endpoint: "http://127.0.0.1:8080/extract".to_string(),
            extractor_timeout_secs: 120,
            extractor_delay_ms: 1000,
            results_prefix: "tomados_saida".to_string(),
        }
    }

    /// Move `data_dir` and every directory derived from it.
    pub fn set_data_dir(&mut self, data_dir: PathBuf) {
        self.downloads_dir = data_dir.join(DOWNLOADS_SUBDIR);
        self.work_dir = data_dir.join(WORK_SUBDIR);
        self.inbox_dir = data_dir.join(INBOX_SUBDIR);
        self.bucket_dir = data_dir.join(BUCKET_SUBDIR);
        self.data_dir = data_dir;
    }

    /// Get the database URL, constructing from path if not explicitly set.
    pub fn database_url(&self) -> String {
        match self.database_url {
            Some(ref url) => url.clone(),
            None => format!("sqlite:{}", self.database_path().display()),
        }
    }

    /// Get the full path to the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        match self.database_url {
            Some(ref url) => PathBuf::from(url.strip_prefix("sqlite:").unwrap_or(url)),
            None => self.data_dir.join(&self.database_filename),
        }
    }

    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }

    /// Ensure all directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.data_dir,
            &self.downloads_dir,
            &self.work_dir,
            &self.inbox_dir,
            &self.bucket_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!("Failed to create {}: {}", dir.display(), e),
                )
            })?;
        }
        if let Some(parent) = self.database_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Create a database context from these settings.
    pub fn create_db_context(&self) -> Result<DbContext, DieselError> {
        DbContext::from_url(&self.database_url())
    }

    pub fn tuning(&self, stage: Stage) -> StageTuning {
        match stage {
            Stage::Download => self.download,
            Stage::Triage => self.triage,
            Stage::Tomados => self.tomados,
        }
    }

    pub fn retry_policy(&self, stage: Stage) -> RetryPolicy {
        let tuning = self.tuning(stage);
        RetryPolicy::new(
            tuning.max_attempts,
            chrono::Duration::minutes(tuning.cooldown_minutes as i64),
        )
    }

    pub fn poll_interval(&self, stage: Stage) -> Duration {
        Duration::from_secs(self.tuning(stage).poll_interval_secs)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.claim_timeout_minutes as i64)
    }

    pub fn download_settings(&self) -> DownloadSettings {
        DownloadSettings {
            downloads_dir: self.downloads_dir.clone(),
            work_dir: self.work_dir.clone(),
            max_attachments: self.max_attachments,
            claim_batch: self.download.claim_batch,
            seed: SeedConfig {
                window: self.seed_window,
                min_id: self.seed_min_id,
            },
        }
    }

    pub fn triage_settings(&self) -> TriageSettings {
        TriageSettings {
            work_dir: self.work_dir.clone(),
            claim_batch: self.triage.claim_batch,
            max_files: self.max_files,
            routing: RoutingSettings {
                max_pages: self.max_pages,
                confidence_threshold: self.confidence_threshold,
            },
        }
    }

    pub fn tomados_settings(&self) -> TomadosSettings {
        TomadosSettings {
            work_dir: self.work_dir.clone(),
            claim_batch: self.tomados.claim_batch,
            results_prefix: self.results_prefix.clone(),
            delay: Duration::from_millis(self.extractor_delay_ms),
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            endpoint: self.extractor_endpoint.clone(),
            timeout: Duration::from_secs(self.extractor_timeout_secs),
        }
    }
}

/// Per-stage overrides in the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_batch: Option<usize>,
}

impl StageConfig {
    fn apply(&self, tuning: &mut StageTuning) {
        if let Some(v) = self.max_attempts {
            tuning.max_attempts = v;
        }
        if let Some(v) = self.cooldown_minutes {
            tuning.cooldown_minutes = v;
        }
        if let Some(v) = self.poll_interval_secs {
            tuning.poll_interval_secs = v;
        }
        if let Some(v) = self.claim_batch {
            tuning.claim_batch = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(flatten)]
    pub stage: StageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attachments: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_window: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_min_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(flatten)]
    pub stage: StageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomadosConfig {
    #[serde(flatten)]
    pub stage: StageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor_delay_ms: Option<u64>,
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database filename or path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloads_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_timeout_minutes: Option<u64>,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub tomados: TomadosConfig,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer for discovery.
    ///
    /// Falls back to defaults when nothing is found or the file is invalid.
    pub async fn load() -> Self {
        let Ok(discovered) = prefer::load("osflow").await else {
            return Self::default();
        };
        let Some(path) = discovered.source_path() else {
            return Self::default();
        };
        match Self::load_from_path(path).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}; using defaults", e);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file path.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let parse_error = |format: &'static str, message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            format,
            message,
        };

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents).map_err(|e| parse_error("TOML", e.to_string()))?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&contents).map_err(|e| parse_error("YAML", e.to_string()))?
            }
            _ => serde_json::from_str(&contents).map_err(|e| parse_error("JSON", e.to_string()))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Directory of the config file, if it came from one.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    ///
    /// Directories not named explicitly follow `data_dir`.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.set_data_dir(self.resolve_path(data_dir, base_dir));
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(ref dir) = self.downloads_dir {
            settings.downloads_dir = self.resolve_path(dir, base_dir);
        }
        if let Some(ref dir) = self.work_dir {
            settings.work_dir = self.resolve_path(dir, base_dir);
        }
        if let Some(ref dir) = self.inbox_dir {
            settings.inbox_dir = self.resolve_path(dir, base_dir);
        }
        if let Some(ref dir) = self.bucket_dir {
            settings.bucket_dir = self.resolve_path(dir, base_dir);
        }
        if let Some(minutes) = self.claim_timeout_minutes {
            settings.claim_timeout_minutes = minutes;
        }

        self.download.stage.apply(&mut settings.download);
        if let Some(v) = self.download.max_attachments {
            settings.max_attachments = v;
        }
        if let Some(v) = self.download.seed_window {
            settings.seed_window = v;
        }
        if let Some(v) = self.download.seed_min_id {
            settings.seed_min_id = Some(v);
        }

        self.triage.stage.apply(&mut settings.triage);
        if let Some(v) = self.triage.max_files {
            settings.max_files = v;
        }
        if let Some(v) = self.triage.max_pages {
            settings.max_pages = v;
        }
        if let Some(v) = self.triage.confidence_threshold {
            settings.confidence_threshold = v;
        }

        self.tomados.stage.apply(&mut settings.tomados);
        if let Some(ref v) = self.tomados.results_prefix {
            settings.results_prefix = v.clone();
        }
        if let Some(ref v) = self.tomados.extractor_endpoint {
            settings.extractor_endpoint = v.clone();
        }
        if let Some(v) = self.tomados.extractor_timeout_secs {
            settings.extractor_timeout_secs = v;
        }
        if let Some(v) = self.tomados.extractor_delay_ms {
            settings.extractor_delay_ms = v;
        }
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Use CWD for relative paths instead of config file directory.
    pub use_cwd: bool,
    /// Data directory (--data flag).
    pub data: Option<PathBuf>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

/// Load settings with explicit options.
///
/// Precedence, lowest first: defaults, config file, `OSFLOW_DATA_DIR`,
/// `--data`, `DATABASE_URL`.
pub async fn load_settings_with_options(
    options: LoadOptions,
) -> Result<(Settings, Config), ConfigError> {
    let mut config = match options.config_path {
        Some(ref path) => Config::load_from_path(path).await?,
        None => Config::load().await,
    };

    let base_dir = if options.use_cwd {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    } else {
        config
            .base_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    };

    let data_override = options
        .data
        .clone()
        .or_else(|| env_var("OSFLOW_DATA_DIR").map(PathBuf::from));
    if let Some(data_dir) = data_override {
        tracing::debug!("Using data directory override: {}", data_dir.display());
        config.data_dir = Some(absolute(&data_dir).display().to_string());
    }

    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings, &base_dir);

    if let Some(database_url) = env_var("DATABASE_URL") {
        tracing::debug!("Using DATABASE_URL from environment: {}", database_url);
        settings.database_url = Some(database_url);
    }

    Ok((settings, config))
}
