//! Document response recording
//!
//! The recorder listens to `Network.responseReceived` for the whole session and
//! keeps the most recent response metadata for every top-level document URL.
//! CDP events are pumped into a bounded channel and a single consumer task owns
//! the table, so every upsert is serialized without a lock.

use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, ResourceType};
use chromiumoxide::page::Page;
use chrono::{SecondsFormat, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Capacity of the channel between the CDP listener and the table owner
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Response metadata for one document, as written to `*_headers.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub url: String,

    /// HTTP status, or 0 when no response could be correlated
    #[serde(rename = "status")]
    pub status_code: i64,

    pub headers: BTreeMap<String, String>,

    /// RFC 3339 time the record was created
    #[serde(rename = "timestamp")]
    pub captured_at: String,
}

impl ResponseRecord {
    /// Stand-in used when no document response matched the final URL
    pub fn placeholder(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status_code: 0,
            headers: BTreeMap::new(),
            captured_at: capture_timestamp(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.status_code == 0
    }
}

/// A `Network.responseReceived` event reduced to what the recorder needs
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub url: String,
    pub status: i64,
    pub headers: BTreeMap<String, String>,
    pub resource_type: ResourceType,
}

impl From<&EventResponseReceived> for ResponseEvent {
    fn from(event: &EventResponseReceived) -> Self {
        Self {
            url: event.response.url.clone(),
            status: event.response.status,
            headers: header_strings(event.response.headers.inner()),
            resource_type: event.r#type.clone(),
        }
    }
}

/// Flatten a CDP `Headers` object into string values
///
/// String values are kept verbatim; anything else uses its JSON text.
pub fn header_strings(headers: &serde_json::Value) -> BTreeMap<String, String> {
    let Some(object) = headers.as_object() else {
        return BTreeMap::new();
    };

    object
        .iter()
        .map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (name.clone(), value)
        })
        .collect()
}

/// Current time in the format used for `timestamp` fields
pub fn capture_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Latest document response per URL
#[derive(Debug, Default, Clone)]
pub struct ResponseTable {
    records: HashMap<String, ResponseRecord>,
}

impl ResponseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a document response, replacing any earlier one for the same URL
    ///
    /// Returns false (and leaves the table untouched) for non-document resources.
    pub fn observe(&mut self, event: ResponseEvent) -> bool {
        if event.resource_type != ResourceType::Document {
            return false;
        }

        log::debug!("Document response {} for {}", event.status, event.url);
        let record = ResponseRecord {
            url: event.url.clone(),
            status_code: event.status,
            headers: event.headers,
            captured_at: capture_timestamp(),
        };
        self.records.insert(event.url, record);
        true
    }

    pub fn get(&self, url: &str) -> Option<&ResponseRecord> {
        self.records.get(url)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Single consumer loop; returns once every sender is gone
    async fn consume(mut rx: mpsc::Receiver<ResponseEvent>) -> Self {
        let mut table = Self::new();
        while let Some(event) = rx.recv().await {
            table.observe(event);
        }
        table
    }
}

/// Running recorder tied to one page
///
/// Must be [`finish`](ResponseRecorder::finish)ed to get the table back; the
/// capture pipeline does so before tearing the session down.
pub struct ResponseRecorder {
    shutdown: Option<oneshot::Sender<()>>,
    pump: JoinHandle<()>,
    consumer: JoinHandle<ResponseTable>,
}

impl ResponseRecorder {
    /// Start recording responses on `page`
    ///
    /// The CDP subscription is established before this returns, so a
    /// navigation started afterwards cannot outrun it.
    pub async fn attach(page: &Page) -> Result<Self> {
        let events = page
            .event_listener::<EventResponseReceived>()
            .await?
            .map(|event| ResponseEvent::from(event.as_ref()));

        Ok(Self::spawn(events))
    }

    /// Start recording from an arbitrary event stream
    pub fn spawn<S>(events: S) -> Self
    where
        S: Stream<Item = ResponseEvent> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let pump = tokio::spawn(pump_events(events, tx, shutdown_rx));
        let consumer = tokio::spawn(ResponseTable::consume(rx));

        Self {
            shutdown: Some(shutdown_tx),
            pump,
            consumer,
        }
    }

    /// Stop listening and hand back everything recorded so far
    pub async fn finish(mut self) -> ResponseTable {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        if let Err(e) = (&mut self.pump).await {
            log::warn!("Response listener task failed: {}", e);
        }

        match (&mut self.consumer).await {
            Ok(table) => {
                log::debug!("Recorded {} document response(s)", table.len());
                table
            }
            Err(e) => {
                log::warn!("Response table task failed: {}", e);
                ResponseTable::new()
            }
        }
    }
}

impl Drop for ResponseRecorder {
    fn drop(&mut self) {
        // Only reached without finish() on early return paths
        self.pump.abort();
        self.consumer.abort();
    }
}

async fn pump_events<S>(
    mut events: S,
    tx: mpsc::Sender<ResponseEvent>,
    mut shutdown: oneshot::Receiver<()>,
) where
    S: Stream<Item = ResponseEvent> + Unpin,
{
    loop {
        tokio::select! {
            // Drain whatever is already queued before honoring shutdown
            biased;
            event = events.next() => match event {
                Some(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::wrappers::ReceiverStream;

    fn event(url: &str, status: i64, resource_type: ResourceType) -> ResponseEvent {
        ResponseEvent {
            url: url.to_string(),
            status,
            headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
            resource_type,
        }
    }

    #[test]
    fn test_only_documents_are_recorded() {
        let mut table = ResponseTable::new();

        assert!(table.observe(event("https://a.com/", 200, ResourceType::Document)));
        assert!(!table.observe(event("https://a.com/app.js", 200, ResourceType::Script)));
        assert!(!table.observe(event("https://a.com/logo.png", 200, ResourceType::Image)));
        assert!(!table.observe(event("https://a.com/api", 200, ResourceType::Xhr)));
        assert!(!table.observe(event("https://a.com/", 500, ResourceType::Fetch)));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("https://a.com/").unwrap().status_code, 200);
    }

    #[test]
    fn test_later_response_replaces_earlier() {
        let mut table = ResponseTable::new();

        table.observe(event("https://a.com/", 503, ResourceType::Document));
        table.observe(event("https://a.com/", 200, ResourceType::Document));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("https://a.com/").unwrap().status_code, 200);
    }

    #[test]
    fn test_header_strings_stringifies_non_strings() {
        let headers = header_strings(&json!({
            "Content-Type": "text/html",
            "content-length": 1256,
            "x-flag": true
        }));

        assert_eq!(headers["Content-Type"], "text/html");
        assert_eq!(headers["content-length"], "1256");
        assert_eq!(headers["x-flag"], "true");
    }

    #[test]
    fn test_header_strings_non_object() {
        assert!(header_strings(&serde_json::Value::Null).is_empty());
    }

    #[test]
    fn test_record_serializes_in_output_shape() {
        let record = ResponseRecord {
            url: "https://a.com/".to_string(),
            status_code: 200,
            headers: BTreeMap::from([("server".to_string(), "nginx".to_string())]),
            captured_at: "2024-05-01T10:00:00Z".to_string(),
        };

        let text = serde_json::to_string(&record).unwrap();
        assert_eq!(
            text,
            r#"{"url":"https://a.com/","status":200,"headers":{"server":"nginx"},"timestamp":"2024-05-01T10:00:00Z"}"#
        );
    }

    #[test]
    fn test_placeholder() {
        let record = ResponseRecord::placeholder("about:blank");

        assert_eq!(record.url, "about:blank");
        assert_eq!(record.status_code, 0);
        assert!(record.headers.is_empty());
        assert!(record.is_placeholder());
        assert!(chrono::DateTime::parse_from_rfc3339(&record.captured_at).is_ok());
    }

    #[tokio::test]
    async fn test_recorder_collects_stream_until_finished() {
        let (tx, rx) = mpsc::channel(8);
        let recorder = ResponseRecorder::spawn(ReceiverStream::new(rx));

        tx.send(event("https://a.com/x/", 301, ResourceType::Document))
            .await
            .unwrap();
        tx.send(event("https://a.com/style.css", 200, ResourceType::Stylesheet))
            .await
            .unwrap();
        tx.send(event("https://a.com/x/", 200, ResourceType::Document))
            .await
            .unwrap();

        // Give the pump a chance to forward before shutdown
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let table = recorder.finish().await;
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("https://a.com/x/").unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn test_recorder_finishes_on_ended_stream() {
        let events = futures::stream::iter(vec![
            event("https://a.com/", 200, ResourceType::Document),
            event("https://b.com/", 404, ResourceType::Document),
        ]);
        let recorder = ResponseRecorder::spawn(events);

        let table = recorder.finish().await;
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("https://b.com/").unwrap().status_code, 404);
    }

    #[tokio::test]
    async fn test_recorder_finishes_with_idle_stream() {
        let (_tx, rx) = mpsc::channel::<ResponseEvent>(1);
        let recorder = ResponseRecorder::spawn(ReceiverStream::new(rx));

        let table = recorder.finish().await;
        assert!(table.is_empty());
    }
}
