//! Navigation and read-back
//!
//! Navigates the session page, waits until the DOM is usable and has stopped
//! changing, lets client-side code settle, then reads the final URL, the
//! serialized document and a full-page screenshot. The caller bounds the whole
//! sequence with a single deadline.

use crate::config::CaptureOptions;
use crate::error::{CaptureError, Result};
use chromiumoxide::cdp::browser_protocol::network;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventDomContentEventFired, NavigateParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::time::Duration;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

const STABILITY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pages that keep mutating are captured after this many samples anyway
const STABILITY_MAX_POLLS: u32 = 20;

const READY_SCRIPT: &str = "document.body !== null && document.readyState !== 'loading'";
const DOM_SIZE_SCRIPT: &str =
    "document.readyState === 'loading' ? -1 : document.getElementsByTagName('*').length";
const LOCATION_SCRIPT: &str = "window.location.href";
const OUTER_HTML_SCRIPT: &str = "document.documentElement.outerHTML";

/// What the navigator reads back from a settled page
#[derive(Debug, Clone)]
pub struct LoadedPage {
    /// URL after redirects and client-side history changes
    pub final_url: String,
    pub html: String,
    /// PNG bytes
    pub screenshot: Vec<u8>,
}

/// Navigate `page` to `url` and capture it once settled
pub async fn load_page(page: &Page, url: &str, options: &CaptureOptions) -> Result<LoadedPage> {
    let deadline = options.deadline;

    page.execute(network::EnableParams::default())
        .await
        .map_err(|e| command_failed(deadline, e, CaptureError::Other))?;

    // Subscribe before navigating so the event cannot be missed
    let mut dom_content = page
        .event_listener::<EventDomContentEventFired>()
        .await
        .map_err(|e| command_failed(deadline, e, CaptureError::Other))?;

    log::info!("Navigating to {}", url);
    let params = NavigateParams::builder()
        .url(url)
        .build()
        .map_err(|e| CaptureError::NavigationFailed(format!("Invalid URL {}: {}", url, e)))?;

    let response = page.execute(params).await.map_err(|e| {
        command_failed(deadline, e, |e| {
            CaptureError::NavigationFailed(format!("Failed to navigate to {}: {}", url, e))
        })
    })?;

    let nav_result = response.result;
    if let Some(error_text) = nav_result.error_text {
        return Err(CaptureError::NavigationFailed(format!(
            "Navigation error: {}",
            error_text
        )));
    }

    // Same-document navigations have no loader and fire no DOMContentLoaded
    if nav_result.loader_id.is_some() {
        log::debug!("Waiting for DOMContentLoaded");
        dom_content.next().await;
    }

    wait_for_body(page, deadline).await?;
    wait_for_dom_stable(page, deadline).await?;
    log::debug!("DOM ready, settling for {:?}", options.settle_delay);

    tokio::time::sleep(options.settle_delay).await;

    let final_url: String = evaluate(page, LOCATION_SCRIPT, deadline).await?;
    if final_url != url {
        log::info!("Final URL: {}", final_url);
    }

    let html: String = evaluate(page, OUTER_HTML_SCRIPT, deadline).await?;
    log::debug!("Captured HTML ({} KB)", html.len() / 1024);

    let screenshot = page
        .screenshot(
            ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .full_page(true)
                .build(),
        )
        .await
        .map_err(|e| {
            command_failed(deadline, e, |e| {
                CaptureError::Other(format!("Failed to take screenshot: {}", e))
            })
        })?;
    log::debug!("Captured screenshot ({} KB)", screenshot.len() / 1024);

    Ok(LoadedPage {
        final_url,
        html,
        screenshot,
    })
}

/// Poll until the document has a body and is past the loading state
///
/// Failed evaluations count as "not ready": a client-side redirect destroys
/// the execution context between samples.
async fn wait_for_body(page: &Page, deadline: Duration) -> Result<()> {
    loop {
        match evaluate::<bool>(page, READY_SCRIPT, deadline).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e @ CaptureError::Timeout(_)) => return Err(e),
            Err(e) => log::debug!("Document not ready yet: {}", e),
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Poll the element count until two consecutive samples agree
///
/// A sample of -1 (document still loading) or a failed evaluation never
/// counts towards stability.
async fn wait_for_dom_stable(page: &Page, deadline: Duration) -> Result<()> {
    let mut previous: Option<i64> = None;

    for _ in 0..STABILITY_MAX_POLLS {
        let current = match evaluate::<i64>(page, DOM_SIZE_SCRIPT, deadline).await {
            Ok(count) if count >= 0 => Some(count),
            Ok(_) => None,
            Err(e @ CaptureError::Timeout(_)) => return Err(e),
            Err(e) => {
                log::debug!("DOM sample failed: {}", e);
                None
            }
        };

        if current.is_some() && current == previous {
            return Ok(());
        }
        previous = current;
        tokio::time::sleep(STABILITY_POLL_INTERVAL).await;
    }

    log::debug!(
        "DOM still changing after {} samples, continuing",
        STABILITY_MAX_POLLS
    );
    Ok(())
}

async fn evaluate<T: serde::de::DeserializeOwned>(
    page: &Page,
    script: &str,
    deadline: Duration,
) -> Result<T> {
    let result = page.evaluate(script).await.map_err(|e| {
        command_failed(deadline, e, |e| {
            CaptureError::Other(format!("Script execution failed: {}", e))
        })
    })?;

    result
        .into_value()
        .map_err(|e| CaptureError::Other(format!("Failed to deserialize result: {}", e)))
}

/// A CDP command that times out has used up the capture deadline
fn command_failed(
    deadline: Duration,
    error: CdpError,
    wrap: impl FnOnce(String) -> CaptureError,
) -> CaptureError {
    match error {
        CdpError::Timeout => CaptureError::Timeout(deadline),
        other => wrap(other.to_string()),
    }
}
