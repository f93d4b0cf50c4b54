// spider_chrome re-exports chromiumoxide API
use crate::config::{CaptureConfig, CaptureOptions};
use crate::error::{CaptureError, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::security::SetIgnoreCertificateErrorsParams;
use chromiumoxide::handler::HandlerConfig;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long to wait for an attached browser to report its existing tabs
const REMOTE_PAGE_DISCOVERY_ATTEMPTS: u32 = 10;
const REMOTE_PAGE_DISCOVERY_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound on waiting for the CDP handler after closing the browser
const HANDLER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection mode for Chrome browser
///
/// `request_timeout` caps each CDP command; it is set to the capture deadline
/// so the handler never gives up on a step before the deadline does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Launch a private headless Chrome process
    Local {
        chrome_path: Option<PathBuf>,
        proxy: Option<String>,
        no_sandbox: bool,
        request_timeout: Duration,
    },
    /// Attach to an existing browser through its DevTools endpoint
    Remote {
        endpoint: String,
        request_timeout: Duration,
    },
}

impl ConnectionMode {
    pub fn from_config(config: &CaptureConfig, options: &CaptureOptions) -> Self {
        match &config.remote_endpoint {
            Some(endpoint) => {
                if let Some(proxy) = &config.proxy_address {
                    log::warn!(
                        "Ignoring proxy {} because the remote browser manages its own network",
                        proxy
                    );
                }
                Self::Remote {
                    endpoint: endpoint.clone(),
                    request_timeout: options.deadline,
                }
            }
            None => Self::Local {
                chrome_path: options.chrome_path.clone(),
                proxy: config.proxy_address.clone(),
                no_sandbox: options.no_sandbox,
                request_timeout: options.deadline,
            },
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    pub fn request_timeout(&self) -> Duration {
        match self {
            Self::Local {
                request_timeout, ..
            }
            | Self::Remote {
                request_timeout, ..
            } => *request_timeout,
        }
    }
}

/// One controllable page plus the browser connection behind it
///
/// A local session owns its Chrome process and closes it in [`finish`];
/// a remote session leaves the browser running for its other users.
///
/// [`finish`]: ChromeSession::finish
pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler: Option<JoinHandle<()>>,
    is_remote: bool,
    request_timeout: Duration,
    temp_dir: Option<PathBuf>,
}

impl ChromeSession {
    /// Launch or attach according to `mode`
    pub async fn establish(mode: ConnectionMode) -> Result<Self> {
        match mode {
            ConnectionMode::Local {
                chrome_path,
                proxy,
                no_sandbox,
                request_timeout,
            } => {
                // Unique profile directory so concurrent captures never share state
                let unique_id = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or_default();
                let profile_dir =
                    std::env::temp_dir().join(format!("headless-capture-{}", unique_id));

                Self::launch(
                    profile_dir,
                    chrome_path,
                    proxy,
                    no_sandbox,
                    request_timeout,
                )
                .await
            }
            ConnectionMode::Remote {
                endpoint,
                request_timeout,
            } => Self::attach(&endpoint, request_timeout).await,
        }
    }

    /// Launch Chrome with `profile_dir` as its user data directory
    ///
    /// The directory is removed again if the launch fails at any point.
    async fn launch(
        profile_dir: PathBuf,
        chrome_path: Option<PathBuf>,
        proxy: Option<String>,
        no_sandbox: bool,
        request_timeout: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(&profile_dir).map_err(|e| {
            CaptureError::LaunchFailed(format!("Failed to create temp directory: {}", e))
        })?;

        match Self::launch_in_profile(&profile_dir, chrome_path, proxy, no_sandbox, request_timeout)
            .await
        {
            Ok((browser, page, handler)) => {
                log::info!("Launched local headless Chrome");
                Ok(Self {
                    browser,
                    page,
                    handler: Some(handler),
                    is_remote: false,
                    request_timeout,
                    temp_dir: Some(profile_dir),
                })
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&profile_dir);
                Err(e)
            }
        }
    }

    async fn launch_in_profile(
        profile_dir: &Path,
        chrome_path: Option<PathBuf>,
        proxy: Option<String>,
        no_sandbox: bool,
        request_timeout: Duration,
    ) -> Result<(Browser, Page, JoinHandle<()>)> {
        // Headless is the builder default
        let mut config = BrowserConfig::builder()
            .user_data_dir(profile_dir)
            .request_timeout(request_timeout)
            .arg("--ignore-certificate-errors");

        if let Some(proxy) = &proxy {
            log::info!("Routing browser traffic through proxy {}", proxy);
            config = config.arg(format!("--proxy-server={}", proxy));
        }

        if no_sandbox {
            config = config.arg("--no-sandbox");
        }

        if let Some(path) = chrome_path {
            log::info!("Using Chrome binary: {}", path.display());
            config = config.chrome_executable(path);
        }

        let config = config.build().map_err(|e| {
            CaptureError::LaunchFailed(format!(
                "{}. Install Chrome or Chromium, or point CHROME_BIN at the executable",
                e
            ))
        })?;

        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|e| CaptureError::LaunchFailed(e.to_string()))?;
        let handler = spawn_handler(handler);

        match browser.new_page("about:blank").await {
            Ok(page) => Ok((browser, page, handler)),
            Err(e) => {
                handler.abort();
                Err(CaptureError::LaunchFailed(format!(
                    "Failed to create page: {}",
                    e
                )))
            }
        }
    }

    async fn attach(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let handler_config = HandlerConfig {
            request_timeout,
            ..Default::default()
        };
        let (mut browser, handler) = Browser::connect_with_config(endpoint, handler_config)
            .await
            .map_err(|e| {
                CaptureError::ConnectionFailed(format!(
                    "Failed to connect to browser at {}: {}",
                    endpoint, e
                ))
            })?;
        let handler = spawn_handler(handler);

        let page = match Self::existing_page(&mut browser).await {
            Ok(page) => page,
            Err(e) => {
                handler.abort();
                return Err(e);
            }
        };

        // The remote endpoint is usually test or proxy infrastructure with
        // self-signed certificates
        if let Err(e) = page
            .execute(SetIgnoreCertificateErrorsParams::new(true))
            .await
        {
            handler.abort();
            return Err(CaptureError::ConnectionFailed(format!(
                "Failed to disable certificate checks: {}",
                e
            )));
        }

        log::info!("Attached to remote browser at {}", endpoint);

        Ok(Self {
            browser,
            page,
            handler: Some(handler),
            is_remote: true,
            request_timeout,
            temp_dir: None,
        })
    }

    /// First existing tab, skipping Chrome's internal pages when possible
    ///
    /// Never creates a page: attaching must not change the remote context.
    async fn existing_page(browser: &mut Browser) -> Result<Page> {
        for attempt in 1..=REMOTE_PAGE_DISCOVERY_ATTEMPTS {
            if let Err(e) = browser.fetch_targets().await {
                log::debug!("Target discovery attempt {} failed: {}", attempt, e);
            }

            let pages = browser.pages().await?;
            for page in pages.iter() {
                if let Ok(Some(url)) = page.url().await {
                    if !url.starts_with("chrome://") {
                        return Ok(page.clone());
                    }
                }
            }
            if let Some(page) = pages.first() {
                return Ok(page.clone());
            }

            tokio::time::sleep(REMOTE_PAGE_DISCOVERY_INTERVAL).await;
        }

        Err(CaptureError::NoPage)
    }

    /// The page every capture step runs against
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// True when the browser belongs to someone else
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    /// Per-command CDP timeout the handler was configured with
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// DevTools websocket endpoint of the underlying browser
    pub fn websocket_address(&self) -> &str {
        self.browser.websocket_address()
    }

    /// Tear the session down according to who owns the browser
    pub async fn finish(mut self) {
        let Some(handler) = self.handler.take() else {
            return;
        };

        if self.is_remote {
            log::info!("Leaving remote browser running");
            handler.abort();
            return;
        }

        if let Err(e) = self.browser.close().await {
            log::warn!("Failed to close browser cleanly: {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            log::debug!("Browser process wait failed: {}", e);
        }

        match tokio::time::timeout(HANDLER_SHUTDOWN_TIMEOUT, handler).await {
            Ok(_) => log::debug!("Browser handler stopped"),
            Err(_) => log::warn!("Browser handler did not stop after close"),
        }
    }
}

/// The CDP handler must be polled continuously for the connection to work
fn spawn_handler(mut handler: chromiumoxide::handler::Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                log::debug!("Browser handler error: {}", e);
            }
        }
    })
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }

        // Clean up temporary directory if it exists
        if let Some(temp_dir) = &self.temp_dir {
            if temp_dir.exists() {
                let _ = std::fs::remove_dir_all(temp_dir);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> CaptureConfig {
        CaptureConfig::from_args(args.iter().copied()).unwrap()
    }

    fn options() -> CaptureOptions {
        CaptureOptions {
            deadline: Duration::from_secs(60),
            no_sandbox: true,
            chrome_path: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_local_mode_carries_proxy() {
        let mode = ConnectionMode::from_config(
            &config(&["--url=https://a.com", "--proxy-ip=127.0.0.1:8080"]),
            &options(),
        );

        assert_eq!(
            mode,
            ConnectionMode::Local {
                chrome_path: None,
                proxy: Some("127.0.0.1:8080".to_string()),
                no_sandbox: true,
                request_timeout: Duration::from_secs(60),
            }
        );
        assert!(!mode.is_remote());
    }

    #[test]
    fn test_remote_mode_drops_proxy() {
        let mode = ConnectionMode::from_config(
            &config(&[
                "--url=https://a.com",
                "--ws-browser=ws://10.0.0.5:9222/devtools/browser/1",
                "--proxy-ip=127.0.0.1:8080",
            ]),
            &options(),
        );

        assert_eq!(
            mode,
            ConnectionMode::Remote {
                endpoint: "ws://10.0.0.5:9222/devtools/browser/1".to_string(),
                request_timeout: Duration::from_secs(60),
            }
        );
        assert!(mode.is_remote());
    }

    #[test]
    fn test_request_timeout_follows_deadline() {
        // Longer than the CDP client's default per-command timeout
        let options = CaptureOptions {
            deadline: Duration::from_secs(90),
            ..options()
        };

        let local = ConnectionMode::from_config(&config(&["--url=https://a.com"]), &options);
        let remote = ConnectionMode::from_config(
            &config(&["--url=https://a.com", "--ws-browser=ws://10.0.0.5:9222"]),
            &options,
        );

        assert_eq!(local.request_timeout(), Duration::from_secs(90));
        assert_eq!(remote.request_timeout(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_unreachable_remote_endpoint() {
        let result = ChromeSession::establish(ConnectionMode::Remote {
            endpoint: "ws://127.0.0.1:1/devtools/browser/missing".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .await;

        assert!(matches!(result, Err(CaptureError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_failed_launch_removes_profile_dir() {
        let profile_dir = std::env::temp_dir().join("headless-capture-failed-launch-test");
        let _ = std::fs::remove_dir_all(&profile_dir);

        let result = ChromeSession::launch(
            profile_dir.clone(),
            Some(PathBuf::from("/nonexistent/headless-capture/chrome")),
            None,
            true,
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(CaptureError::LaunchFailed(_))));
        assert!(!profile_dir.exists());
    }
}
