use std::fmt::Display;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

// ============================================================================
// Source Items
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_name: String,
    pub result: serde_json::Value,
}

/// One item of a generation turn. `End` is the explicit end-of-turn signal;
/// a source that simply stops without it has failed.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    Text(String),
    ToolResult(ToolResult),
    End,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid upstream frame: {0}")]
    Protocol(String),

    #[error("upstream reported: {0}")]
    Upstream(String),
}

pub type TokenSource = Pin<Box<dyn Stream<Item = Result<SourceItem, SourceError>> + Send>>;

// ============================================================================
// Channel Source
// ============================================================================

/// Producer half of a channel-backed token source.
#[derive(Clone)]
pub struct SourceSender {
    tx: mpsc::Sender<Result<SourceItem, SourceError>>,
}

impl SourceSender {
    async fn send(&self, item: Result<SourceItem, SourceError>) -> bool {
        self.tx.send(item).await.is_ok()
    }

    pub async fn text(&self, text: impl Into<String>) -> bool {
        self.send(Ok(SourceItem::Text(text.into()))).await
    }

    pub async fn tool_result(&self, tool_name: impl Into<String>, result: serde_json::Value) -> bool {
        self.send(Ok(SourceItem::ToolResult(ToolResult {
            tool_name: tool_name.into(),
            result,
        })))
        .await
    }

    pub async fn end(&self) -> bool {
        self.send(Ok(SourceItem::End)).await
    }

    pub async fn fail(&self, error: SourceError) -> bool {
        self.send(Err(error)).await
    }
}

pub fn channel_source(buffer: usize) -> (SourceSender, TokenSource) {
    let (tx, rx) = mpsc::channel(buffer);
    (SourceSender { tx }, ReceiverStream::new(rx).boxed())
}

/// A finished list of items, mostly for replaying canned turns.
pub fn scripted_source(items: Vec<SourceItem>) -> TokenSource {
    futures::stream::iter(items.into_iter().map(Ok)).boxed()
}

// ============================================================================
// Ollama Source
// ============================================================================

/// Anything that can open a generation turn for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, model: Option<&str>) -> Result<TokenSource, SourceError>;
}

#[derive(Clone)]
pub struct OllamaSource {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaSource {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Generator for OllamaSource {
    fn name(&self) -> &str {
        &self.model
    }

    /// Start a streaming `/api/generate` call.
    async fn generate(&self, prompt: &str, model: Option<&str>) -> Result<TokenSource, SourceError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url.trim_end_matches('/')))
            .json(&serde_json::json!({
                "model": model.unwrap_or(&self.model),
                "prompt": prompt,
                "stream": true
            }))
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Upstream(format!(
                "Ollama returned status {}",
                status
            )));
        }

        Ok(ndjson_items(response.bytes_stream()).boxed())
    }
}

/// Replays the same canned turn for every prompt.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    items: Vec<SourceItem>,
}

impl ScriptedGenerator {
    pub fn new(items: Vec<SourceItem>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _prompt: &str, _model: Option<&str>) -> Result<TokenSource, SourceError> {
        Ok(scripted_source(self.items.clone()))
    }
}

/// Turn a byte stream of newline-delimited Ollama JSON objects into items.
pub fn ndjson_items<S, E>(bytes: S) -> impl Stream<Item = Result<SourceItem, SourceError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut decoder = NdjsonDecoder::default();
        let mut bytes = Box::pin(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for item in decoder.push(&chunk) {
                        let stop = !matches!(item, Ok(SourceItem::Text(_)) | Ok(SourceItem::ToolResult(_)));
                        yield item;
                        if stop {
                            return;
                        }
                    }
                }
                Err(e) => {
                    yield Err(SourceError::Transport(e.to_string()));
                    return;
                }
            }
        }

        for item in decoder.finish() {
            yield item;
        }
    }
}

/// Reassembles lines split across network chunks before decoding, so neither
/// JSON objects nor UTF-8 sequences are cut.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<SourceItem, SourceError>> {
        self.buffer.extend_from_slice(chunk);
        let mut items = Vec::new();

        while let Some(split) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=split).collect();
            items.extend(decode_line(&line[..line.len() - 1]));
        }

        items
    }

    /// Decode a trailing line that had no newline.
    pub fn finish(&mut self) -> Vec<Result<SourceItem, SourceError>> {
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line)
    }
}

fn decode_line(line: &[u8]) -> Vec<Result<SourceItem, SourceError>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return vec![Err(SourceError::Protocol(format!("invalid UTF-8: {}", e)))],
    };
    if text.is_empty() {
        return Vec::new();
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return vec![Err(SourceError::Protocol(format!("invalid JSON line: {}", e)))],
    };

    if let Some(error) = value.get("error").and_then(|v| v.as_str()) {
        return vec![Err(SourceError::Upstream(error.to_string()))];
    }

    let mut items = Vec::new();
    if let Some(fragment) = value.get("response").and_then(|v| v.as_str()) {
        if !fragment.is_empty() {
            items.push(Ok(SourceItem::Text(fragment.to_string())));
        }
    }
    if value.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
        items.push(Ok(SourceItem::End));
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decoder_reassembles_split_lines() {
        let mut decoder = NdjsonDecoder::default();
        let line = r#"{"response":"héllo","done":false}"#.to_string() + "\n";
        let bytes = line.as_bytes();
        // split inside the two-byte 'é'
        let cut = line.find('é').unwrap() + 1;

        assert!(decoder.push(&bytes[..cut]).is_empty());
        let items = decoder.push(&bytes[cut..]);
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Ok(SourceItem::Text(t)) if t == "héllo"));
    }

    #[test]
    fn test_decoder_done_and_error_lines() {
        let mut decoder = NdjsonDecoder::default();
        let items = decoder.push(b"{\"response\":\"!\",\"done\":true}\n{\"error\":\"boom\"}\n");
        assert!(matches!(&items[0], Ok(SourceItem::Text(t)) if t == "!"));
        assert!(matches!(&items[1], Ok(SourceItem::End)));
        assert!(matches!(&items[2], Err(SourceError::Upstream(m)) if m == "boom"));
    }

    #[test]
    fn test_decoder_finish_without_newline() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(b"{\"response\":\"tail\"}").is_empty());
        let items = decoder.finish();
        assert!(matches!(&items[0], Ok(SourceItem::Text(t)) if t == "tail"));
        assert!(decoder.finish().is_empty());
    }

    #[tokio::test]
    async fn test_ndjson_stream_stops_at_done() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"response\":\"a\"}\n{\"resp")),
            Ok(Bytes::from_static(b"onse\":\"b\",\"done\":true}\n")),
            Ok(Bytes::from_static(b"{\"response\":\"ignored\"}\n")),
        ];
        let items: Vec<_> = ndjson_items(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[1], Ok(SourceItem::Text(t)) if t == "b"));
        assert!(matches!(&items[2], Ok(SourceItem::End)));
    }

    #[tokio::test]
    async fn test_ndjson_stream_surfaces_transport_errors() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"response\":\"a\"}\n")),
            Err(std::io::Error::other("reset")),
        ];
        let items: Vec<_> = ndjson_items(futures::stream::iter(chunks)).collect().await;
        assert!(matches!(&items[1], Err(SourceError::Transport(m)) if m.contains("reset")));
    }

    #[tokio::test]
    async fn test_channel_source_delivers_in_order() {
        let (sender, mut source) = channel_source(8);
        sender.text("hi").await;
        sender.tool_result("calc", json!(2)).await;
        sender.end().await;
        drop(sender);

        assert!(matches!(source.next().await, Some(Ok(SourceItem::Text(t))) if t == "hi"));
        assert!(matches!(source.next().await, Some(Ok(SourceItem::ToolResult(r))) if r.tool_name == "calc"));
        assert!(matches!(source.next().await, Some(Ok(SourceItem::End))));
        assert!(source.next().await.is_none());
    }
}
