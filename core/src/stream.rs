//! Consumption of a genuinely streamed reply body.
//!
//! Only this path and the complete-body paths produce text that gets persisted.
//! The reveal effect in `reveal.rs` is presentation over an already-known string.

use crate::api::{ByteStream, TransportError};
use crate::render::{RenderChannel, RenderEvent};
use futures::StreamExt;
use std::time::Duration;

/// Incremental UTF-8 decoder. Sequences split across chunks are held back until complete.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match err.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes a truncated trailing sequence as replacement characters.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

pub struct StreamConsumer {
    render: RenderChannel,
    decoder: Utf8Decoder,
    buffer: String,
    idle_timeout: Option<Duration>,
}

impl StreamConsumer {
    pub fn new(render: &RenderChannel) -> Self {
        Self {
            render: render.clone(),
            decoder: Utf8Decoder::default(),
            buffer: String::new(),
            idle_timeout: None,
        }
    }

    /// Fails the read when no chunk arrives within `idle` of the previous one.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    /// Reads until the body ends, pushing one render update per decoded chunk.
    pub async fn consume(mut self, mut stream: ByteStream) -> Result<String, TransportError> {
        self.render.emit(RenderEvent::ResponseStarted);
        let mut chunks = 0usize;
        while let Some(chunk) = self.next_chunk(&mut stream).await? {
            chunks += 1;
            let decoded = self.decoder.decode(&chunk);
            self.push(&decoded);
        }
        let tail = self.decoder.finish();
        self.push(&tail);
        tracing::debug!(chunks, bytes = self.buffer.len(), "stream finished");
        self.render.emit(RenderEvent::ResponseCompleted {
            text: self.buffer.clone(),
        });
        Ok(self.buffer)
    }

    async fn next_chunk(&self, stream: &mut ByteStream) -> Result<Option<Vec<u8>>, TransportError> {
        let next = match self.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, stream.next())
                .await
                .map_err(|_| TransportError::Timeout(idle))?,
            None => stream.next().await,
        };
        next.transpose()
    }

    fn push(&mut self, decoded: &str) {
        if decoded.is_empty() {
            return;
        }
        self.buffer.push_str(decoded);
        self.render.emit(RenderEvent::ResponseUpdated {
            text: self.buffer.clone(),
        });
    }
}
