//! Command line and runtime configuration
//!
//! Arguments are only accepted in the `--name=value` form. Anything else,
//! including unknown names and empty values, is skipped without complaint so
//! wrapper scripts can pass extra flags through.

use crate::error::{CaptureError, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_FILE_PREFIX: &str = "capture";
pub const DEFAULT_OUTPUT_DIR: &str = "./output";

pub const USAGE: &str = "Usage: headless-capture --url=<url> [--file-prefix=<prefix>] \
                         [--ws-browser=<ws://browser>] [--proxy-ip=<proxy>]";

/// What to capture and how to reach the browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Page to navigate to
    pub target_url: String,

    /// Prefix for the three artifact file names
    pub file_prefix: String,

    /// DevTools endpoint of an already running browser (remote mode)
    pub remote_endpoint: Option<String>,

    /// Proxy for locally launched browsers
    pub proxy_address: Option<String>,
}

impl CaptureConfig {
    /// Resolve a config from process arguments (without the program name)
    ///
    /// Fails with [`CaptureError::Usage`] when `--url` is missing.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut target_url = None;
        let mut file_prefix = None;
        let mut remote_endpoint = None;
        let mut proxy_address = None;

        for arg in args {
            let Some((name, value)) = arg.as_ref().split_once('=') else {
                continue;
            };
            if value.is_empty() {
                continue;
            }

            let slot = match name {
                "--url" => &mut target_url,
                "--file-prefix" => &mut file_prefix,
                "--ws-browser" => &mut remote_endpoint,
                "--proxy-ip" => &mut proxy_address,
                _ => continue,
            };
            *slot = Some(value.to_string());
        }

        let target_url = target_url.ok_or_else(|| CaptureError::Usage("--url".to_string()))?;

        Ok(Self {
            target_url,
            file_prefix: file_prefix.unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string()),
            remote_endpoint,
            proxy_address,
        })
    }

    /// Whether this config attaches to an existing browser
    pub fn is_remote(&self) -> bool {
        self.remote_endpoint.is_some()
    }
}

/// Tunables for a capture run that are not exposed on the command line
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Overall budget for navigation, readiness, settling and read-back
    pub deadline: Duration,

    /// Unconditional pause after the DOM is ready
    pub settle_delay: Duration,

    /// Pass `--no-sandbox` to locally launched Chrome
    pub no_sandbox: bool,

    /// Chrome executable to launch instead of the one chromiumoxide finds
    pub chrome_path: Option<PathBuf>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            settle_delay: Duration::from_secs(3),
            no_sandbox: is_ci(),
            chrome_path: chrome_bin_from_env(),
        }
    }
}

/// CI runners typically need Chrome's sandbox disabled
fn is_ci() -> bool {
    ["CI", "GITHUB_ACTIONS", "GITLAB_CI", "JENKINS_HOME", "CIRCLECI"]
        .iter()
        .any(|var| std::env::var_os(var).is_some())
}

fn chrome_bin_from_env() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var_os("CHROME_BIN")?);
    path.exists().then_some(path)
}
