use std::path::Path;

use anyhow::{Context, bail};
use serde::Deserialize;

/// Number of assets requested per listing call when the config does not say.
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub icloud: ICloudConfig,
}

/// Credentials and listing options for the iCloud account.
#[derive(Debug, Clone, Deserialize)]
pub struct ICloudConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ICloudConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Error loading config file '{}'", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Config> {
        // An empty document deserializes to unit, not to an empty map.
        let config: Config = if contents.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.icloud.username.trim().is_empty() || self.icloud.password.is_empty() {
            bail!("Username and/or password not provided in the config file.");
        }
        if self.icloud.page_size == 0 {
            bail!("icloud.page_size must be greater than zero.");
        }
        Ok(())
    }
}
