//! Hotpatch Configuration Module
//! Handles loading and validating hotpatch.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "hotpatch.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub package: PackageConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub build: BuildConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    #[serde(default = "default_package_name")]
    pub name: String,
    #[serde(default)]
    pub game: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Info endpoint; the updater skips the request when empty
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_component_version")]
    pub core_version: String,
    #[serde(default = "default_component_version")]
    pub cpp_version: String,
    #[serde(default = "default_component_version")]
    pub client_version: String,
    #[serde(default = "default_component_version")]
    pub channel_code: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_info_timeout")]
    pub info_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Runtime base directory; platform data dir when unset
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default = "default_builtin_root")]
    pub builtin_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_true")]
    pub system_proxy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    #[serde(default = "default_modules")]
    pub entries: Vec<String>,
    #[serde(default)]
    pub strict_manifest_reload: bool,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    #[serde(default = "default_diff_root")]
    pub diff_root: PathBuf,
    #[serde(default = "default_version_file")]
    pub version_file: PathBuf,
}

fn default_package_name() -> String {
    "DefaultPackage".to_string()
}

fn default_component_version() -> String {
    "1".to_string()
}

fn default_info_timeout() -> u64 {
    10
}

fn default_builtin_root() -> PathBuf {
    PathBuf::from("./StreamingAssets")
}

fn default_download_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("Hotpatch-Updater/{}", env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}

fn default_modules() -> Vec<String> {
    vec!["HotUpdate.dll".to_string()]
}

fn default_tick_interval() -> u64 {
    16
}

fn default_output_root() -> PathBuf {
    PathBuf::from("./Bundles")
}

fn default_diff_root() -> PathBuf {
    PathBuf::from("./DiffBundles")
}

fn default_version_file() -> PathBuf {
    PathBuf::from("version.txt")
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            core_version: default_component_version(),
            cpp_version: default_component_version(),
            client_version: default_component_version(),
            channel_code: default_component_version(),
            device_id: None,
            info_timeout_secs: default_info_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            builtin_root: default_builtin_root(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_download_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            user_agent: default_user_agent(),
            system_proxy: true,
        }
    }
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            entries: default_modules(),
            strict_manifest_reload: false,
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            diff_root: default_diff_root(),
            version_file: default_version_file(),
        }
    }
}

impl EndpointConfig {
    pub fn info_timeout(&self) -> Duration {
        Duration::from_secs(self.info_timeout_secs)
    }
}

impl ModulesConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl Config {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE_NAME);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_project(package: &str) -> Self {
        Self {
            package: PackageConfig {
                name: package.to_string(),
                game: String::new(),
            },
            endpoint: EndpointConfig::default(),
            storage: StorageConfig::default(),
            download: DownloadConfig::default(),
            modules: ModulesConfig::default(),
            build: BuildConfig::default(),
        }
    }

    /// Resolve a configured path against the project directory
    pub fn resolve(project_dir: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            project_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut config = Config::default_for_project("Tennis");
        config.endpoint.url = "http://updates.example.test/resource2.php".to_string();
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.package.name, "Tennis");
        assert_eq!(loaded.endpoint.url, config.endpoint.url);
        assert_eq!(loaded.modules.entries, vec!["HotUpdate.dll"]);
    }

    #[test]
    fn test_missing_sections_take_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{"package": {}}"#).unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.package.name, "DefaultPackage");
        assert_eq!(config.endpoint.info_timeout(), Duration::from_secs(10));
        assert_eq!(config.download.timeout_secs, 60);
        assert!(!config.modules.strict_manifest_reload);
        assert_eq!(config.build.version_file, PathBuf::from("version.txt"));
        assert_eq!(config.storage.builtin_root, PathBuf::from("./StreamingAssets"));
        assert!(config.storage.base_dir.is_none());
    }

    #[test]
    fn test_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(Config::load(dir.path()), Err(ConfigError::NotFound(_))));
    }
}
