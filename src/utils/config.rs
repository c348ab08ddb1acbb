use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 6.2; Win64; x64; rv:16.0.1) Gecko/20121011 Firefox/16.0.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    pub log_level: String,
    /// Where upload thumbnails are written; thumbnails are skipped when unset.
    pub thumb_folder: Option<PathBuf>,
    pub fetch: FetchConfig,
    pub tags: TagConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Extra attempts the orchestrator makes after a timeout or transport error.
    pub retries: u32,
    pub retry_backoff_ms: u64,
    /// Headless browser binary used when a bot-block page is served.
    pub browser_command: Option<String>,
    pub browser_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagConfig {
    /// `(namespace, value)` pairs dropped as scraper noise.
    pub noise: Vec<(String, String)>,
    pub hidden_namespaces: Vec<String>,
    pub namespace_aliases: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("gbooru.db"),
            log_level: "info".to_string(),
            thumb_folder: None,
            fetch: FetchConfig::default(),
            tags: TagConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: 10,
            retries: 1,
            retry_backoff_ms: 500,
            browser_command: None,
            browser_args: vec![
                "--headless".to_string(),
                "--disable-gpu".to_string(),
                "--dump-dom".to_string(),
            ],
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for TagConfig {
    fn default() -> Self {
        let noise = [("s", ""), ("ity", ""), ("sc", "1")]
            .iter()
            .map(|(ns, value)| (ns.to_string(), value.to_string()))
            .collect();
        Self {
            noise,
            hidden_namespaces: vec!["imgres url".into(), "msu".into(), "si".into()],
            namespace_aliases: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads the config at `path`, or writes the defaults there for next time.
    /// Environment overrides are applied either way.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let config = load_from_file(path)?;
            info!(path = %path.display(), "loaded config");
            config
        } else {
            let config = Config::default();
            save_to_file(path, &config)?;
            info!(path = %path.display(), "wrote default config");
            config
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("GBOORU_DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("GBOORU_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Ok(value) = std::env::var("GBOORU_BROWSER") {
            self.fetch.browser_command = Some(value);
        }
    }
}

fn load_from_file(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file: {:?}", path))
}

fn save_to_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let text = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, text).with_context(|| format!("Failed to write config file: {:?}", path))?;
    Ok(())
}
