//! Envelope sources that feed [`crate::channel::NotificationChannel::connect`].
//!
//! - `json_lines`: one JSON envelope per line from any async reader (stdin, a
//!   recorded session file).
//! - `server_sent_events`: the push service's `text/event-stream` endpoint.

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::SplitStream;
use tracing::{info, warn};

use crate::error::{Result, TrackerError};
use crate::models::RawNotificationEnvelope;

/// Longest line or event field kept while waiting for its terminating newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Read one envelope per non-empty line. Lines that are not valid UTF-8 are
/// decoded lossily (and then classify as irrelevant); the stream ends only at
/// EOF or at the first read error.
pub fn json_lines<R>(reader: R) -> BoxStream<'static, RawNotificationEnvelope>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    SplitStream::new(reader.split(b'\n'))
        .scan((), |_, line| {
            let line = match line {
                Ok(line) => Some(line),
                Err(error) => {
                    warn!(%error, "envelope source read failed");
                    None
                }
            };
            futures_util::future::ready(line)
        })
        .filter_map(|raw| {
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                return futures_util::future::ready(None);
            }
            if std::str::from_utf8(&raw).is_err() {
                warn!(bytes = raw.len(), "non UTF-8 envelope line");
            }
            futures_util::future::ready(Some(RawNotificationEnvelope::from_json(line)))
        })
        .boxed()
}

/// Open a server-sent-events stream at `url` and yield one envelope per event.
pub async fn server_sent_events(
    client: &Client,
    url: &str,
) -> Result<BoxStream<'static, RawNotificationEnvelope>> {
    let response = client
        .get(url)
        .header(header::ACCEPT, "text/event-stream")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TrackerError::Backend {
            status: status.as_u16(),
            body,
        });
    }
    info!(%url, "event stream opened");

    let events = response
        .bytes_stream()
        .scan(SseDecoder::default(), |decoder, chunk| {
            let batch = match chunk {
                Ok(bytes) => Some(decoder.feed(&bytes)),
                Err(error) => {
                    warn!(%error, "event stream interrupted");
                    None
                }
            };
            futures_util::future::ready(batch)
        })
        .flat_map(stream::iter)
        .map(|data| RawNotificationEnvelope::from_json(&data))
        .boxed();
    Ok(events)
}

/// Incremental `text/event-stream` decoder. Only `data` fields matter here;
/// comments (keep-alives) and other fields are skipped.
///
/// A line longer than the limit is discarded up to its newline.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    max_line: usize,
    discarding: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            data: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Consume a chunk and return the data of every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }
        if self.buffer.len() > self.max_line {
            warn!(bytes = self.buffer.len(), "event stream line too long, discarding");
            self.buffer.clear();
            self.discarding = true;
        }
        events
    }
}
