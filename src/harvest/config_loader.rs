use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Config structs for config.toml
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Paths {
    pub asset_root: String,
    pub log_directory: String,
}

/// Which of the generated combinations become tasks.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// One task per label, using the base plus every tag
    #[default]
    FullCombination,
    /// One task per element of the tag power-set
    EveryCombination,
}

/// How the orchestrator hands tasks to the pool.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// Await each label before submitting the next one
    #[default]
    Sequential,
    /// Submit every task up front, then await them all
    Parallel,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Query {
    pub tags: Vec<String>,
    pub mode: QueryMode,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Pool {
    pub size: usize,
    pub submission: SubmissionMode,
    /// 0 disables the per-task timeout
    pub task_timeout_secs: u64,
    pub show_progress: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Rate {
    pub download_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Search {
    pub endpoint: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadBackend {
    #[default]
    Http,
    Curl,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Download {
    pub backend: DownloadBackend,
    pub timeout_secs: u64,
    pub curl_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Dedup {
    pub enabled: bool,
    pub remove_empty: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Line,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Logging {
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    pub paths: Paths,
    pub query: Query,
    pub pool: Pool,
    pub rate: Rate,
    pub search: Search,
    pub download: Download,
    pub dedup: Dedup,
    pub logging: Logging,
}

// Default implementation for AppConfig
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: Paths {
                asset_root: "./assets".to_string(),
                log_directory: "./logs".to_string(),
            },
            query: Query {
                tags: vec!["neko".to_string()],
                mode: QueryMode::FullCombination,
            },
            pool: Pool {
                size: num_cpus::get().max(1),
                submission: SubmissionMode::Sequential,
                task_timeout_secs: 900,
                show_progress: true,
            },
            rate: Rate {
                download_interval_ms: 1000,
            },
            search: Search {
                endpoint: "https://www.google.com/search".to_string(),
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string(),
                timeout_secs: 30,
            },
            download: Download {
                backend: DownloadBackend::Http,
                timeout_secs: 60,
                curl_path: "curl".to_string(),
            },
            dedup: Dedup {
                enabled: true,
                remove_empty: true,
            },
            logging: Logging {
                log_level: "info".to_string(),
                log_format: LogFormat::Line,
                log_to_file: true,
            },
        }
    }
}

impl AppConfig {
    /// Rejects values that would leave the batch unable to run.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.pool.size == 0 {
            return Err(ConfigError::Invalid("pool.size must be at least 1".to_string()));
        }
        if self.paths.asset_root.trim().is_empty() {
            return Err(ConfigError::Invalid("paths.asset_root must not be empty".to_string()));
        }
        if let Some(tag) = self.query.tags.iter().find(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("query.tags contains an empty tag: {:?}", tag)));
        }
        if self.query.tags.len() >= usize::BITS as usize {
            return Err(ConfigError::Invalid(format!(
                "query.tags has {} entries, the combination count would overflow",
                self.query.tags.len()
            )));
        }
        Ok(())
    }

    pub fn asset_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.asset_root)
    }

    pub fn download_interval(&self) -> Duration {
        Duration::from_millis(self.rate.download_interval_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        match self.pool.task_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Something that happened while loading the config. Loading runs before the
/// logger exists, so these are kept and logged once it is up.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigLoadEvent {
    CreatedDirectory(PathBuf),
    FileMissing(PathBuf),
    /// The file did not parse and was replaced with defaults
    Recovered {
        path: PathBuf,
        backup: Option<PathBuf>,
        error: String,
    },
    BackupFailed(String),
    WriteFailed(String),
    WroteDefaults(PathBuf),
}

impl ConfigLoadEvent {
    fn log(&self) {
        match self {
            ConfigLoadEvent::CreatedDirectory(dir) => info!("Created config directory: {}", dir.display()),
            ConfigLoadEvent::FileMissing(path) => warn!("Config file not found: {}", path.display()),
            ConfigLoadEvent::Recovered { path, backup, error } => {
                error!("Failed to parse {}: {}", path.display(), error);
                match backup {
                    Some(backup) => info!("Old config backed up to {}, using default values", backup.display()),
                    None => info!("Using default values"),
                }
            }
            ConfigLoadEvent::BackupFailed(e) => warn!("Failed to backup old config: {}", e),
            ConfigLoadEvent::WriteFailed(e) => error!("Failed to write new config file: {}", e),
            ConfigLoadEvent::WroteDefaults(path) => info!("Wrote default config to {}", path.display()),
        }
    }
}

// Config manager to handle the configuration file
pub struct ConfigManager {
    app_config: AppConfig,
    config_dir: PathBuf,
    load_events: Vec<ConfigLoadEvent>,
}

impl ConfigManager {
    // Create a new ConfigManager instance
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let mut load_events = Vec::new();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
            load_events.push(ConfigLoadEvent::CreatedDirectory(config_dir.clone()));
        }

        let app_config = Self::load_app_config(&config_dir, &mut load_events)?;
        app_config.validate()?;

        let mut manager = Self {
            app_config,
            config_dir,
            load_events,
        };

        manager.create_default_configs()?;

        Ok(manager)
    }

    // Load app config from config.toml
    fn load_app_config(config_dir: &Path, events: &mut Vec<ConfigLoadEvent>) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join("config.toml");

        if !config_path.exists() {
            events.push(ConfigLoadEvent::FileMissing(config_path));
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                let backup_path = config_path.with_extension("toml.backup");
                let backup = match fs::rename(&config_path, &backup_path) {
                    Ok(()) => Some(backup_path),
                    Err(backup_err) => {
                        events.push(ConfigLoadEvent::BackupFailed(backup_err.to_string()));
                        None
                    }
                };
                events.push(ConfigLoadEvent::Recovered {
                    path: config_path.clone(),
                    backup,
                    error: e.to_string(),
                });

                let default_config = AppConfig::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(toml_string) => {
                        if let Err(write_err) = fs::write(&config_path, toml_string) {
                            events.push(ConfigLoadEvent::WriteFailed(write_err.to_string()));
                        }
                    }
                    Err(ser_err) => events.push(ConfigLoadEvent::WriteFailed(ser_err.to_string())),
                }

                Ok(default_config)
            }
        }
    }

    // Get app config
    pub fn get_app_config(&self) -> AppConfig {
        self.app_config.clone()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    #[cfg(test)]
    pub fn load_events(&self) -> &[ConfigLoadEvent] {
        &self.load_events
    }

    /// Replay what happened during loading into the installed subscriber.
    pub fn log_load_events(&self) {
        for event in &self.load_events {
            event.log();
        }
    }

    // Create the default config file if it doesn't exist
    fn create_default_configs(&mut self) -> ConfigResult<()> {
        let config_path = self.config_dir.join("config.toml");
        if !config_path.exists() {
            let toml_string = toml::to_string_pretty(&self.app_config)
                .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
            fs::write(&config_path, toml_string)?;
            self.load_events.push(ConfigLoadEvent::WroteDefaults(config_path));
        }

        Ok(())
    }
}

// Helper function to create a ConfigManager instance
pub fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<ConfigManager> {
    ConfigManager::new(config_dir)
}
