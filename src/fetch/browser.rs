use std::io::Read;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context};
use url::Url;

use crate::error::{IngestError, Result};
use crate::utils::config::FetchConfig;

/// Renders a page with JavaScript enabled and returns the resulting DOM.
pub trait BrowserRenderer: Send + Sync {
    fn render(&self, url: &Url) -> Result<String>;
}

/// A headless browser binary that prints the rendered DOM to stdout
/// (`chromium --headless --dump-dom <url>` and compatibles).
#[derive(Debug, Clone)]
pub struct HeadlessBrowser {
    command: String,
    args: Vec<String>,
}

impl HeadlessBrowser {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// `None` unless a browser command is configured.
    pub fn from_config(config: &FetchConfig) -> Option<Self> {
        config
            .browser_command
            .as_ref()
            .filter(|command| !command.trim().is_empty())
            .map(|command| Self::new(command.clone(), config.browser_args.clone()))
    }

    fn dump_dom(&self, url: &Url) -> anyhow::Result<String> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(url.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn browser command {:?}", self.command))?;

        let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("Failed to open stdout"))?;
        let mut buffer = Vec::new();
        stdout
            .read_to_end(&mut buffer)
            .context("Failed to read browser output")?;

        let status = child.wait().context("Failed to wait on browser")?;
        if !status.success() {
            return Err(anyhow!("browser exited with {status}"));
        }
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl BrowserRenderer for HeadlessBrowser {
    fn render(&self, url: &Url) -> Result<String> {
        self.dump_dom(url).map_err(|err| IngestError::FetchTransport {
            url: url.to_string(),
            message: format!("{err:#}"),
        })
    }
}
