//! Application configuration: data directory layout and environment overrides.
//!
//! Data lives in the platform config directory unless `LMNGEN_DATA_DIR` says
//! otherwise:
//!   macOS:   ~/Library/Application Support/lmngen/
//!   Linux:   ~/.config/lmngen/
//!   Windows: %APPDATA%/lmngen/

use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "LMNGEN_DATA_DIR";
pub const SERVER_BIN_ENV: &str = "LMNGEN_SERVER_BIN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No config directory on this platform; set {DATA_DIR_ENV}")]
    NoDataDir,

    #[error("Failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// Server executable forced from the environment; beats the profile's
    /// `server_path`.
    pub server_bin: Option<PathBuf>,
}

impl AppConfig {
    /// Read `.env` (if any) and the environment, then create the data layout.
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => log::info!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("Ignoring .env: {}", e),
        }

        let data_dir = match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::config_dir().ok_or(ConfigError::NoDataDir)?.join("lmngen"),
        };
        let server_bin = std::env::var_os(SERVER_BIN_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Self::at(&data_dir, server_bin)
    }

    /// Config rooted at `data_dir`, creating its directories.
    pub fn at(data_dir: &Path, server_bin: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = Self {
            data_dir: data_dir.to_path_buf(),
            server_bin,
        };
        for dir in [config.data_dir.clone(), config.profiles_dir(), config.chats_dir()] {
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::CreateDir { path: dir, source })?;
        }
        log::info!("Data directory: {}", config.data_dir.display());
        Ok(config)
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.data_dir.join("models.json")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }

    pub fn active_profile_file(&self) -> PathBuf {
        self.data_dir.join("active_profile.json")
    }

    pub fn chats_dir(&self) -> PathBuf {
        self.data_dir.join("chats")
    }
}
