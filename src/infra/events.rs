//! Push-event listener.
//!
//! Subscribes to the content source's live event stream and forwards every
//! change notification to the invalidation queue.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use reqwest::{
    Client,
    header::{ACCEPT, HeaderValue},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::EventQueue;
use crate::config::{ContentSettings, EventsSettings};

use super::content::{endpoint, user_agent};
use super::error::InfraError;

const METRIC_STREAM_RECONNECT_TOTAL: &str = "quire_events_stream_reconnect_total";
const LAST_EVENT_ID: &str = "last-event-id";
const EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug, Error)]
enum ListenError {
    #[error("event stream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("event stream responded with status {0}")]
    Status(u16),
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed a chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line);
            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
            } else {
                self.field(&line);
            }
        }

        frames
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if event.is_none() && self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseFrame { event, id, data })
    }
}

#[derive(Debug, Deserialize)]
struct LiveEventPayload {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    id: Option<String>,
}

/// Long-running subscriber feeding the [`EventQueue`].
pub struct EventListener {
    client: Client,
    url: Url,
    queue: Arc<EventQueue>,
    reconnect_delay: Duration,
    last_event_id: Option<String>,
}

impl EventListener {
    pub fn new(
        content: &ContentSettings,
        events: &EventsSettings,
        queue: Arc<EventQueue>,
    ) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(user_agent())
            .build()
            .map_err(|err| InfraError::content_client(err.to_string()))?;
        let version = format!("v{}", content.api_version);
        let url = endpoint(
            &content.api_url,
            &[
                version.as_str(),
                "data",
                "live",
                "events",
                content.dataset.as_str(),
            ],
        )?;

        Ok(Self {
            client,
            url,
            queue,
            reconnect_delay: events.reconnect_delay,
            last_event_id: None,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Listen forever, reconnecting after `reconnect_delay` whenever the
    /// stream ends or fails.
    pub async fn run(mut self) {
        info!(url = %self.url, "Starting push-event listener");
        loop {
            match self.listen_once().await {
                Ok(()) => info!("Push-event stream ended"),
                Err(err) => warn!(error = %err, "Push-event stream failed"),
            }
            counter!(METRIC_STREAM_RECONNECT_TOTAL).increment(1);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn listen_once(&mut self) -> Result<(), ListenError> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, HeaderValue::from_static(EVENT_STREAM));
        if let Some(id) = self
            .last_event_id
            .as_deref()
            .and_then(|id| HeaderValue::from_str(id).ok())
        {
            request = request.header(LAST_EVENT_ID, id);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ListenError::Status(response.status().as_u16()));
        }

        let mut parser = SseParser::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for frame in parser.push(&chunk) {
                self.handle(frame);
            }
        }
        Ok(())
    }

    /// Route one frame; change notifications go to the queue.
    pub fn handle(&mut self, frame: SseFrame) {
        if let Some(id) = frame.id.as_ref().filter(|id| !id.is_empty()) {
            self.last_event_id = Some(id.clone());
        }

        match frame.event.as_deref() {
            None | Some("message") => {}
            Some("welcome") => {
                info!("Push-event stream connected");
                return;
            }
            Some("restart") | Some("reconnect") => {
                warn!(
                    event = frame.event.as_deref().unwrap_or_default(),
                    "Push-event stream asked the client to resync"
                );
                return;
            }
            Some(other) => {
                debug!(event = other, "Ignoring push event");
                return;
            }
        }

        let payload: LiveEventPayload = match serde_json::from_str(&frame.data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Discarding malformed push event");
                return;
            }
        };
        if payload.tags.is_empty() {
            debug!("Push event carried no tags");
            return;
        }

        let id = payload.id.or(frame.id);
        self.queue.publish(payload.tags, id);
    }
}
