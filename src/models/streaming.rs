//! Line and server-sent-event framing shared by the streaming adapters.
//! Event framing is delegated to `eventsource-stream`; NDJSON and `data:`-only
//! bodies go through [`LineBuffer`].
//!
//! Reading is cooperative: one network chunk is read, every complete line in it
//! is handed to the caller synchronously, then the next chunk is read. Only the
//! trailing partial line is buffered.

use std::collections::VecDeque;

use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures_util::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Source of raw body chunks.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, String>;
}

#[async_trait]
impl ChunkSource for reqwest::Response {
    async fn next_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, String> {
        self.chunk()
            .await
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .map_err(|e| e.to_string())
    }
}

/// Pre-recorded chunks, used to replay captured streams.
#[derive(Debug, Default)]
pub struct ScriptedChunks {
    chunks: VecDeque<Vec<u8>>,
}

impl ScriptedChunks {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        Self {
            chunks: chunks.into_iter().map(|c| c.as_ref().to_vec()).collect(),
        }
    }
}

#[async_trait]
impl ChunkSource for ScriptedChunks {
    async fn next_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, String> {
        Ok(self.chunks.pop_front())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The body ended or the converter saw its terminal marker.
    Finished,
    /// The caller cancelled between chunks.
    Cancelled,
}

/// Splits a byte stream into lines. Bytes are buffered until a newline so
/// multi-byte characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// The unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// Feed every line of `source` to `on_line` until the body ends, `on_line`
/// asks to stop, or `cancel` fires.
pub async fn read_lines<S, F>(
    source: &mut S,
    provider: &str,
    cancel: &CancellationToken,
    mut on_line: F,
) -> Result<StreamEnd>
where
    S: ChunkSource + ?Sized,
    F: FnMut(&str) -> Result<StreamControl> + Send,
{
    let mut buffer = LineBuffer::default();

    loop {
        if cancel.is_cancelled() {
            debug!("Stream from {} cancelled by caller", provider);
            return Ok(StreamEnd::Cancelled);
        }

        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stream from {} cancelled by caller", provider);
                return Ok(StreamEnd::Cancelled);
            }
            chunk = source.next_chunk() => chunk,
        };

        match chunk.map_err(|e| Error::backend(provider, format!("Stream read error: {}", e)))? {
            Some(bytes) => {
                for line in buffer.push(&bytes) {
                    if on_line(&line)? == StreamControl::Stop {
                        return Ok(StreamEnd::Finished);
                    }
                }
            }
            None => {
                if let Some(line) = buffer.finish() {
                    on_line(&line)?;
                }
                return Ok(StreamEnd::Finished);
            }
        }
    }
}

/// Body chunks as a stream, ending after the first read error.
fn chunk_stream<S>(source: &mut S) -> impl Stream<Item = std::result::Result<Vec<u8>, String>> + Send + '_
where
    S: ChunkSource + ?Sized,
{
    stream::unfold(Some(source), |source| async move {
        let source = match source {
            Some(source) => source,
            None => return None,
        };
        match source.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(source))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Like [`read_lines`] but dispatches complete server-sent events.
pub async fn read_sse<S, F>(
    source: &mut S,
    provider: &str,
    cancel: &CancellationToken,
    mut on_event: F,
) -> Result<StreamEnd>
where
    S: ChunkSource + ?Sized,
    F: FnMut(Event) -> Result<StreamControl> + Send,
{
    let events = chunk_stream(source).eventsource();
    futures_util::pin_mut!(events);

    loop {
        if cancel.is_cancelled() {
            debug!("Stream from {} cancelled by caller", provider);
            return Ok(StreamEnd::Cancelled);
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stream from {} cancelled by caller", provider);
                return Ok(StreamEnd::Cancelled);
            }
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                if on_event(event)? == StreamControl::Stop {
                    return Ok(StreamEnd::Finished);
                }
            }
            Some(Err(e)) => return Err(Error::backend(provider, format!("Stream read error: {}", e))),
            None => return Ok(StreamEnd::Finished),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_handles_split_lines_and_utf8() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: hel").is_empty());

        let snowman = "☃".as_bytes();
        let mut chunk = b"lo\r\ndata: ".to_vec();
        chunk.extend_from_slice(&snowman[..1]);
        assert_eq!(buffer.push(&chunk), vec!["data: hello".to_string()]);

        let mut chunk = snowman[1..].to_vec();
        chunk.extend_from_slice(b"\n\ntail");
        assert_eq!(buffer.push(&chunk), vec!["data: ☃".to_string(), String::new()]);
        assert_eq!(buffer.finish().as_deref(), Some("tail"));
        assert_eq!(buffer.finish(), None);
    }

    #[tokio::test]
    async fn test_read_sse_assembles_events() {
        let mut source = ScriptedChunks::new([
            ": keep-alive\nevent: message_start\ndata: {\"a\"",
            ":1}\n\ndata:line one\ndata: line two\n\n",
        ]);
        let cancel = CancellationToken::new();
        let mut names = Vec::new();
        let mut data = Vec::new();

        read_sse(&mut source, "test", &cancel, |event| {
            names.push(event.event);
            data.push(event.data);
            Ok(StreamControl::Continue)
        })
        .await
        .unwrap();

        assert_eq!(names[0], "message_start");
        assert_eq!(data, vec!["{\"a\":1}", "line one\nline two"]);
    }

    #[tokio::test]
    async fn test_read_sse_stops_on_request() {
        let mut source = ScriptedChunks::new([
            "data: one\n\ndata: two\n\n",
            "data: three\n\n",
        ]);
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();

        let end = read_sse(&mut source, "test", &cancel, |event| {
            seen.push(event.data.clone());
            Ok(if event.data == "two" { StreamControl::Stop } else { StreamControl::Continue })
        })
        .await
        .unwrap();

        assert_eq!(end, StreamEnd::Finished);
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_cancelled_stream_reads_nothing_more() {
        let mut source = ScriptedChunks::new(["line one\n", "line two\n"]);
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();

        let end = read_lines(&mut source, "test", &cancel, |line| {
            seen.push(line.to_string());
            cancel.cancel();
            Ok(StreamControl::Continue)
        })
        .await
        .unwrap();

        assert_eq!(end, StreamEnd::Cancelled);
        assert_eq!(seen, vec!["line one"]);
    }

    struct FailingSource;

    #[async_trait]
    impl ChunkSource for FailingSource {
        async fn next_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, String> {
            Err("connection reset".to_string())
        }
    }

    #[tokio::test]
    async fn test_read_errors_become_backend_errors() {
        let cancel = CancellationToken::new();
        let result = read_lines(&mut FailingSource, "ollama", &cancel, |_| Ok(StreamControl::Continue)).await;
        match result {
            Err(Error::Backend { provider, message }) => {
                assert_eq!(provider, "ollama");
                assert!(message.contains("connection reset"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
