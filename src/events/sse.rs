//! Server-Sent Events source over a reqwest byte stream.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use log::{debug, warn};
use reqwest::header::ACCEPT;

use super::{EventError, EventSource, QueueEvent};

/// One dispatched SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Chunks may split lines anywhere,
/// including inside a multi-byte character; only complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                // id / retry are not used
                _ => {}
            }
        }
        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

pub struct SseEventSource {
    http: reqwest::Client,
    events_url: String,
}

impl SseEventSource {
    pub fn new(events_url: impl Into<String>) -> Result<Self, EventError> {
        // 长连接，不设置整体超时
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| EventError::Connect(e.to_string()))?;
        Ok(Self {
            http,
            events_url: events_url.into(),
        })
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn subscribe(&self, room: &str) -> Result<BoxStream<'static, QueueEvent>, EventError> {
        let resp = self
            .http
            .get(&self.events_url)
            .query(&[("room", room)])
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| EventError::Connect(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EventError::Status(resp.status().as_u16()));
        }
        debug!("[events] stream open for room {}", room);

        let state = (Box::pin(resp.bytes_stream()), SseParser::default(), VecDeque::new());
        let frames = futures::stream::unfold(state, |(mut body, mut parser, mut pending)| async move {
            loop {
                if let Some(frame) = pending.pop_front() {
                    return Some((frame, (body, parser, pending)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => pending.extend(parser.feed(&chunk)),
                    Some(Err(e)) => {
                        warn!("[events] stream error: {}", e);
                        return None;
                    }
                    None => return None,
                }
            }
        });
        Ok(frames.map(QueueEvent::from_frame).boxed())
    }
}
