//! Configuration management for the client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use baton_core::{SharedPathSource, UpdateConfig, UpdateSource, WebSource};
use serde::Deserialize;

use crate::cli::Args;

/// Default configuration file, looked up in the working directory
pub const DEFAULT_CONFIG_PATH: &str = "baton.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the feed comes from
    pub feed: FeedConfig,
    /// Update engine settings
    pub update: UpdateConfig,
    /// Executable of the application being updated
    pub app_path: Option<PathBuf>,
}

/// Feed location. Exactly one of `url` and `path` must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: Option<String>,
    pub proxy: Option<String>,
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref url) = args.feed_url {
            self.feed.url = Some(url.clone());
            self.feed.path = None;
        }

        if let Some(ref path) = args.feed_path {
            self.feed.path = Some(path.clone());
            self.feed.url = None;
        }

        if let Some(ref proxy) = args.proxy {
            self.feed.proxy = Some(proxy.clone());
        }

        if let Some(ref app) = args.app {
            self.app_path = Some(app.clone());
        }

        if let Some(ref name) = args.sync_name {
            self.update.update_process_name = name.clone();
        }

        if let Some(ref temp) = args.temp_folder {
            self.update.temp_folder = temp.clone();
        }

        if let Some(ref backup) = args.backup_folder {
            self.update.backup_folder = Some(backup.clone());
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match (&self.feed.url, &self.feed.path) {
            (Some(_), Some(_)) => bail!("Configure either feed.url or feed.path, not both"),
            (None, None) => bail!("No feed configured; set feed.url or feed.path"),
            _ => {}
        }
        self.update
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid update configuration: {}", e))
    }

    /// Build the update source for the configured feed.
    pub fn source(&self) -> Result<Arc<dyn UpdateSource>> {
        if let Some(ref url) = self.feed.url {
            let source = WebSource::with_proxy(url, self.feed.proxy.as_deref())
                .with_context(|| format!("Invalid feed URL: {}", url))?;
            return Ok(Arc::new(source));
        }
        if let Some(ref path) = self.feed.path {
            return Ok(Arc::new(SharedPathSource::new(path.clone())));
        }
        bail!("No feed configured")
    }
}
