//! End-to-end capture of a single page
//!
//! Establishes the browser session, records document responses while the
//! navigator runs under the overall deadline, correlates the final URL with
//! the recorded responses and tears the session down. Nothing is returned
//! unless every step succeeded.

use crate::browser::{ChromeSession, ConnectionMode};
use crate::config::{CaptureConfig, CaptureOptions};
use crate::error::{CaptureError, Result};
use crate::matcher;
use crate::navigator;
use crate::recorder::{ResponseRecord, ResponseRecorder};

/// Everything needed to write the three artifacts
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub final_url: String,
    pub html: String,
    pub screenshot: Vec<u8>,
    pub matched_response: ResponseRecord,
}

/// Capture `config.target_url` in a fresh or attached browser session
pub async fn capture_page(config: &CaptureConfig, options: &CaptureOptions) -> Result<CaptureResult> {
    let mode = ConnectionMode::from_config(config, options);
    let session = ChromeSession::establish(mode).await?;

    let outcome = capture_in_session(&session, &config.target_url, options).await;

    // Teardown runs on every path once the session exists
    session.finish().await;

    outcome
}

/// Run the capture on an already established session
pub async fn capture_in_session(
    session: &ChromeSession,
    target_url: &str,
    options: &CaptureOptions,
) -> Result<CaptureResult> {
    let page = session.page();
    let recorder = ResponseRecorder::attach(page).await?;

    let loaded = tokio::time::timeout(
        options.deadline,
        navigator::load_page(page, target_url, options),
    )
    .await;

    let responses = recorder.finish().await;

    let loaded = match loaded {
        Ok(result) => result?,
        Err(_) => {
            log::debug!(
                "Capture of {} exceeded the {:?} deadline",
                target_url,
                options.deadline
            );
            return Err(CaptureError::Timeout(options.deadline));
        }
    };

    let matched_response = matcher::match_response(&responses, &loaded.final_url);

    Ok(CaptureResult {
        final_url: loaded.final_url,
        html: loaded.html,
        screenshot: loaded.screenshot,
        matched_response,
    })
}
