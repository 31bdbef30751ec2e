use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::danbooru::backoff::BackoffSettings;
use crate::danbooru::identifier::Identifier;
use crate::danbooru::listing::ListingOptions;
use crate::danbooru::orchestrator::OrchestratorConfig;
use crate::danbooru::record::ImageSize;
use crate::danbooru::scheduler::TierTable;
use crate::danbooru::sender::{Credential, SenderConfig};

const APP_CONFIG_FILE: &str = "config.toml";
const DANBOORU_CONFIG_FILE: &str = "danbooru.toml";
const PLACEHOLDER_USERNAME: &str = "your_username";
const PLACEHOLDER_API_KEY: &str = "your_api_key_here";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Failed to acquire lock: {0}")]
    LockError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// config.toml
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Paths {
    pub download_directory: String,
    pub log_directory: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            download_directory: "./downloads".to_string(),
            log_directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Fetch {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Ceiling for one post request, retries excluded.
    pub item_timeout_secs: u64,
    pub max_idle_per_host: usize,
}

impl Default for Fetch {
    fn default() -> Self {
        let sender = SenderConfig::default();
        Self {
            base_url: sender.base_url,
            user_agent: sender.user_agent,
            timeout_secs: sender.timeout_secs,
            connect_timeout_secs: sender.connect_timeout_secs,
            item_timeout_secs: 45,
            max_idle_per_host: sender.max_idle_per_host,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    /// `json` or `line`.
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            log_to_terminal: true,
            log_to_file: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub fetch: Fetch,
    pub backoff: BackoffSettings,
    pub listing: ListingOptions,
    pub logging: Logging,
}

impl AppConfig {
    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            base_url: self.fetch.base_url.clone(),
            user_agent: self.fetch.user_agent.clone(),
            timeout_secs: self.fetch.timeout_secs,
            connect_timeout_secs: self.fetch.connect_timeout_secs,
            max_idle_per_host: self.fetch.max_idle_per_host,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            item_timeout: Duration::from_secs(self.fetch.item_timeout_secs.max(1)),
            max_group_retries: self.backoff.max_group_retries,
            listing: self.listing.clone(),
            tiers: TierTable::default(),
        }
    }
}

// danbooru.toml
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Auth {
    pub username: String,
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Options {
    /// `large` keeps the original file, `small` the resized sample.
    pub image_size: ImageSize,
    pub download_media: bool,
    pub verify_hashes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            image_size: ImageSize::Large,
            download_media: true,
            verify_hashes: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Query {
    pub posts: Vec<u64>,
    pub pools: Vec<u64>,
    pub artists: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DanbooruConfig {
    pub auth: Auth,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub query: Query,
}

impl Default for DanbooruConfig {
    fn default() -> Self {
        Self {
            auth: Auth {
                username: PLACEHOLDER_USERNAME.to_string(),
                api_key: PLACEHOLDER_API_KEY.to_string(),
            },
            options: Options::default(),
            query: Query::default(),
        }
    }
}

impl DanbooruConfig {
    /// Empty or placeholder credentials mean anonymous access.
    pub fn credential(&self) -> Credential {
        let username = self.auth.username.trim();
        let api_key = self.auth.api_key.trim();
        if username.is_empty()
            || api_key.is_empty()
            || username == PLACEHOLDER_USERNAME
            || api_key == PLACEHOLDER_API_KEY
        {
            return Credential::Anonymous;
        }
        Credential::ApiKey {
            username: username.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Posts first, then pools, then artists; each list in file order.
    pub fn identifiers(&self) -> Vec<Identifier> {
        let posts = self.query.posts.iter().copied().map(Identifier::Post);
        let pools = self.query.pools.iter().copied().map(Identifier::Pool);
        let artists = self
            .query
            .artists
            .iter()
            .map(|artist| artist.trim())
            .filter(|artist| !artist.is_empty())
            .map(|artist| Identifier::Artist(artist.to_string()));
        posts.chain(pools).chain(artists).collect()
    }
}

/// A message raised while loading, held until logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigNotice {
    pub level: log::Level,
    pub message: String,
}

fn note(notices: &mut Vec<ConfigNotice>, level: log::Level, message: impl Into<String>) {
    notices.push(ConfigNotice {
        level,
        message: message.into(),
    });
}

/// Owns both configuration files of a config directory.
pub struct ConfigManager {
    app_config: Arc<RwLock<AppConfig>>,
    danbooru_config: Arc<RwLock<DanbooruConfig>>,
    config_dir: PathBuf,
    notices: Vec<ConfigNotice>,
}

impl ConfigManager {
    pub async fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let mut notices = Vec::new();

        if !config_dir.exists() {
            note(&mut notices, log::Level::Info, format!("Creating config directory: {}", config_dir.display()));
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir, &mut notices)?;
        let danbooru_config = Self::load_danbooru_config(&config_dir, &mut notices)?;

        let manager = Self {
            app_config: Arc::new(RwLock::new(app_config)),
            danbooru_config: Arc::new(RwLock::new(danbooru_config)),
            config_dir,
            notices,
        };
        manager.create_default_configs()?;

        Ok(manager)
    }

    fn load_app_config(config_dir: &Path, notices: &mut Vec<ConfigNotice>) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(APP_CONFIG_FILE);

        if !config_path.exists() {
            note(notices, log::Level::Warn, format!("Config file not found: {}", config_path.display()));
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                note(notices, log::Level::Error, format!("Failed to parse {}: {}", APP_CONFIG_FILE, e));
                note(notices, log::Level::Info, "Backing up old config and creating new one with default values");

                if let Err(backup_err) = fs::rename(&config_path, config_path.with_extension("toml.backup")) {
                    note(notices, log::Level::Warn, format!("Failed to backup old config: {}", backup_err));
                }

                let default_config = AppConfig::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(toml_string) => match fs::write(&config_path, toml_string) {
                        Ok(()) => note(notices, log::Level::Info, format!("Created new {} with default values", APP_CONFIG_FILE)),
                        Err(write_err) => note(notices, log::Level::Error, format!("Failed to write new config file: {}", write_err)),
                    },
                    Err(ser_err) => note(notices, log::Level::Error, format!("Failed to serialize default config: {}", ser_err)),
                }

                Ok(default_config)
            }
        }
    }

    fn load_danbooru_config(config_dir: &Path, notices: &mut Vec<ConfigNotice>) -> ConfigResult<DanbooruConfig> {
        let config_path = config_dir.join(DANBOORU_CONFIG_FILE);

        if !config_path.exists() {
            note(notices, log::Level::Warn, format!("Danbooru config file not found: {}", config_path.display()));
            return Ok(DanbooruConfig::default());
        }

        // Credentials live here, so a broken file is reported instead of overwritten.
        let content = fs::read_to_string(&config_path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Emits the held messages through `log`. Call once a subscriber is installed.
    pub fn replay_notices(&self) {
        for notice in &self.notices {
            log::log!(notice.level, "{}", notice.message);
        }
    }

    pub fn get_app_config(&self) -> ConfigResult<AppConfig> {
        self.app_config
            .read()
            .map_err(|e| ConfigError::LockError(e.to_string()))
            .map(|config| config.clone())
    }

    pub fn get_danbooru_config(&self) -> ConfigResult<DanbooruConfig> {
        self.danbooru_config
            .read()
            .map_err(|e| ConfigError::LockError(e.to_string()))
            .map(|config| config.clone())
    }

    /// Writes default files for whichever of the two is missing.
    pub fn create_default_configs(&self) -> ConfigResult<()> {
        let config_path = self.config_dir.join(APP_CONFIG_FILE);
        if !config_path.exists() {
            let default_config = AppConfig::default();
            Self::write_toml(&config_path, &default_config)?;
            let mut app_config = self
                .app_config
                .write()
                .map_err(|e| ConfigError::LockError(e.to_string()))?;
            *app_config = default_config;
        }

        let danbooru_path = self.config_dir.join(DANBOORU_CONFIG_FILE);
        if !danbooru_path.exists() {
            let default_config = DanbooruConfig::default();
            Self::write_toml(&danbooru_path, &default_config)?;
            let mut danbooru_config = self
                .danbooru_config
                .write()
                .map_err(|e| ConfigError::LockError(e.to_string()))?;
            *danbooru_config = default_config;
        }

        Ok(())
    }

    fn write_toml<T: Serialize>(path: &Path, value: &T) -> ConfigResult<()> {
        let toml_string = toml::to_string_pretty(value).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(path, toml_string)?;
        Ok(())
    }
}

pub async fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<ConfigManager> {
    ConfigManager::new(config_dir).await
}
