use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, UpdateError};

pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_BUNDLE_NAME: &str = "main.jsbundle";
pub const DEFAULT_PLATFORM: &str = "android";

/// Updater settings. Every field has a default, so an empty TOML file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URI patches are served from.
    pub server_uri: Option<String>,
    /// Version of the bundle shipped inside the host application.
    pub bundled_version: u32,
    /// Path segment between the base URI and the version.
    pub platform: String,
    /// Directory holding the generation slots.
    pub storage_root: PathBuf,
    /// Overrides the host install time used to key generation directories.
    pub install_stamp: Option<String>,
    /// File whose modification time is the host install time when no stamp is given.
    pub host_binary: Option<PathBuf>,
    pub bundle_name: String,
    pub timeout_secs: u64,
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_uri: None,
            bundled_version: 0,
            platform: DEFAULT_PLATFORM.to_string(),
            storage_root: PathBuf::from("airpatch"),
            install_stamp: None,
            host_binary: None,
            bundle_name: DEFAULT_BUNDLE_NAME.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| UpdateError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| UpdateError::storage(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(UpdateError::Config("chunk_size must be greater than zero".into()));
        }
        if self.timeout_secs == 0 {
            return Err(UpdateError::Config("timeout_secs must be greater than zero".into()));
        }
        if self.bundle_name.is_empty() || self.bundle_name.contains(['/', '\\']) {
            return Err(UpdateError::Config(format!(
                "bundle_name {:?} must be a plain file name",
                self.bundle_name
            )));
        }
        if self.platform.is_empty() || self.platform.contains('/') {
            return Err(UpdateError::Config(format!("invalid platform {:?}", self.platform)));
        }
        if let Some(uri) = &self.server_uri {
            reqwest::Url::parse(uri)
                .map_err(|e| UpdateError::Config(format!("server_uri {uri:?}: {e}")))?;
        }
        Ok(())
    }

    /// The host install time, read once: explicit stamp, else the mtime of the host
    /// binary (the running executable by default) in milliseconds, else `"0"`.
    pub fn resolve_install_stamp(&self) -> String {
        if let Some(stamp) = &self.install_stamp {
            return stamp.clone();
        }
        let binary = self
            .host_binary
            .clone()
            .or_else(|| std::env::current_exe().ok());
        binary
            .and_then(|path| std::fs::metadata(path).ok())
            .and_then(|meta| meta.modified().ok())
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|age| age.as_millis().to_string())
            .unwrap_or_else(|| {
                tracing::warn!("host install time unavailable, using stamp 0");
                "0".to_string()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.platform, "android");
        assert_eq!(config.bundle_name, "main.jsbundle");
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_overrides() {
        let config = Config::from_toml_str(
            r#"
            server_uri = "https://updates.example.com/app"
            bundled_version = 4
            storage_root = "/data/app/airpatch"
            install_stamp = "1699999999"
            chunk_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.bundled_version, 4);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.resolve_install_stamp(), "1699999999");
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            Config::from_toml_str("chunk = 1"),
            Err(UpdateError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.chunk_size = 1;
        config.server_uri = Some("not a uri".into());
        assert!(config.validate().is_err());

        config.server_uri = None;
        config.bundle_name = "dir/main.jsbundle".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stamp_from_host_binary_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host.bin");
        std::fs::write(&host, b"elf").unwrap();
        let config = Config {
            host_binary: Some(host),
            ..Config::default()
        };
        let stamp = config.resolve_install_stamp();
        assert!(stamp.parse::<u128>().unwrap() > 0);
    }
}
