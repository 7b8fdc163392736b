//! Uploader configuration.
//!
//! Read from the TOML file given as the first argument, or from
//! `~/.config/pagesync/pagesync.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use pagesync_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_PAGE_SIZE, EstimatorConfig, ReconcileOptions};
use pagesync_upload::UploadOptions;
use serde::{Deserialize, Serialize};

const IMAGE_SUFFIX: &str = ".img";

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Local image to upload.
    #[serde(default)]
    pub source: PathBuf,

    /// Directory holding the destination object.
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// Destination object name (source file name by default).
    #[serde(default)]
    pub object_name: Option<String>,

    /// Concurrent upload workers (8 per CPU by default).
    #[serde(default)]
    pub parallelism: Option<usize>,

    /// Replace an existing destination object instead of resuming.
    #[serde(default)]
    pub overwrite: bool,

    /// Write granularity of the destination in bytes.
    #[serde(default = "default_page_size")]
    pub page_size: u64,

    /// Bytes per upload request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Attempts per range before giving up (0 = retry forever).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Progress refresh interval in milliseconds.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
}

fn default_destination() -> PathBuf {
    PathBuf::from(".")
}

fn default_page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_attempts() -> u32 {
    5
}

fn default_progress_interval() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            destination: default_destination(),
            object_name: None,
            parallelism: None,
            overwrite: false,
            page_size: default_page_size(),
            chunk_size: default_chunk_size(),
            max_attempts: default_max_attempts(),
            progress_interval_ms: default_progress_interval(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when `path` is `None`.
    ///
    /// A missing default file is created from [`Config::default`] so it can be
    /// edited; the load then fails because no source is set.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => Self::read(path)?,
            None => {
                let path = config_path();
                if path.exists() {
                    Self::read(&path)?
                } else {
                    let config = Config::default();
                    config.save(&path)?;
                    config
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Writes the configuration as TOML.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.source.as_os_str().is_empty() {
            bail!("no source image configured");
        }
        if self.page_size == 0 {
            bail!("page_size must be greater than zero");
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        Ok(())
    }

    /// Destination object name, always ending in `.img`.
    pub fn object_name(&self) -> String {
        let name = self.object_name.clone().unwrap_or_else(|| {
            self.source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        if name.ends_with(IMAGE_SUFFIX) {
            name
        } else {
            format!("{name}{IMAGE_SUFFIX}")
        }
    }

    pub fn upload_options(&self) -> UploadOptions {
        let mut options = UploadOptions {
            reconcile: ReconcileOptions {
                page_size: self.page_size,
                chunk_size: self.chunk_size,
            },
            estimator: EstimatorConfig {
                interval: Duration::from_millis(self.progress_interval_ms.max(1)),
                ..EstimatorConfig::default()
            },
            ..UploadOptions::default()
        };
        if let Some(parallelism) = self.parallelism {
            options.parallelism = parallelism.max(1);
        }
        options.retry.max_attempts = (self.max_attempts > 0).then_some(self.max_attempts);
        options
    }
}

fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("pagesync")
        .join("pagesync.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.destination, PathBuf::from("."));
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.page_size, 512);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.progress_interval_ms, 500);
        assert!(!config.overwrite);
        assert!(config.validate().is_err(), "source is required");
    }

    #[test]
    fn config_partial_toml() {
        let config: Config = toml::from_str(r#"source = "/images/disk.raw""#).unwrap();
        assert_eq!(config.source, PathBuf::from("/images/disk.raw"));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.parallelism, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn object_name_gets_image_suffix() {
        let mut config = Config {
            source: PathBuf::from("/images/disk.raw"),
            ..Config::default()
        };
        assert_eq!(config.object_name(), "disk.raw.img");

        config.object_name = Some("backup.img".into());
        assert_eq!(config.object_name(), "backup.img");
    }

    #[test]
    fn upload_options_follow_config() {
        let config = Config {
            source: PathBuf::from("disk.img"),
            parallelism: Some(3),
            page_size: 4096,
            chunk_size: 1024 * 1024,
            max_attempts: 0,
            progress_interval_ms: 250,
            ..Config::default()
        };
        let options = config.upload_options();
        assert_eq!(options.parallelism, 3);
        assert_eq!(options.reconcile.chunk_size, 1024 * 1024);
        assert_eq!(options.reconcile.page_size, 4096);
        assert_eq!(options.retry.max_attempts, None);
        assert_eq!(options.estimator.interval, Duration::from_millis(250));
    }

    #[test]
    fn config_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pagesync.toml");

        let config = Config {
            source: PathBuf::from("/images/disk.img"),
            overwrite: true,
            parallelism: Some(16),
            ..Config::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&tmp.path().join("absent.toml"))).is_err());
    }
}
