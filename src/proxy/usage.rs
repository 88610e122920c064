//! Usage accumulator and event-stream decoder.
//!
//! Consumes the observer branch of a tapped response, extracts the content
//! fragments of a chat-completion event stream and reports one usage record
//! per request once the stream ends.

use crate::core::metrics::get_metrics;
use crate::core::TelemetrySink;
use crate::proxy::translate::ProxyRequest;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};

/// Terminal payload OpenAI sends after the last chunk.
const DONE_SENTINEL: &str = "[DONE]";

/// Incremental UTF-8 decoder.
///
/// Bytes of a code point split across chunks are held back until the rest
/// arrives. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    residual: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, returning every complete character seen so far.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.residual);
        input.extend_from_slice(chunk);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end of the input.
                            self.residual = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        if self.residual.is_empty() {
            String::new()
        } else {
            self.residual.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// Splits decoded text into event records on blank lines.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: String,
    /// Bytes of `buffer` already searched for a record boundary
    scanned: usize,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` and return the data payloads of every completed record.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.extend(text.chars().filter(|&c| c != '\r'));

        // A boundary may straddle the previous push.
        let mut from = self.scanned;
        if self.buffer[..from].ends_with('\n') {
            from -= 1;
        }

        let mut payloads = Vec::new();
        while let Some(offset) = self.buffer[from..].find("\n\n") {
            let end = from + offset;
            let record: String = self.buffer.drain(..end + 2).collect();
            if let Some(payload) = data_payload(&record[..end]) {
                payloads.push(payload);
            }
            from = 0;
        }
        self.scanned = self.buffer.len();
        payloads
    }

    /// Treat whatever is left as a final record.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let record = std::mem::take(&mut self.buffer);
        data_payload(&record)
    }
}

/// Joined `data:` lines of one record, `None` when there are none.
fn data_payload(record: &str) -> Option<String> {
    let mut lines = record.lines().filter_map(|line| {
        line.strip_prefix("data:")
            .map(|value| value.strip_prefix(' ').unwrap_or(value))
    });
    let first = lines.next()?;
    let mut payload = first.to_string();
    for line in lines {
        payload.push('\n');
        payload.push_str(line);
    }
    Some(payload)
}

/// `choices[0].delta.content` of a chunk payload.
///
/// Anything that is not a JSON chunk (the `[DONE]` sentinel, a truncated
/// record) yields `None`.
pub fn content_fragment(payload: &str) -> Option<String> {
    let payload = payload.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }
    let chunk: Value = serde_json::from_str(payload).ok()?;
    chunk
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
        .map(str::to_string)
}

/// Total length of the message contents in a chat request body.
///
/// String contents count in full; for multi-part contents the `text` of
/// each part is counted.
pub fn prompt_length(request: &Map<String, Value>) -> usize {
    let Some(messages) = request.get("messages").and_then(Value::as_array) else {
        return 0;
    };
    messages
        .iter()
        .map(|message| match message.get("content") {
            Some(Value::String(text)) => text.chars().count(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .map(|text| text.chars().count())
                .sum(),
            _ => 0,
        })
        .sum()
}

/// Aggregated usage of one proxied request.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub key: Option<String>,
    pub tokens: usize,
    /// Every field of the original request body
    pub request: Map<String, Value>,
    /// Concatenated response content
    pub response: String,
}

impl UsageRecord {
    /// Flat JSON form sent to the sink.
    ///
    /// Request fields win over `key` and `tokens`; `response` always holds
    /// the transcript.
    pub fn into_value(self) -> Value {
        let mut record = Map::new();
        if let Some(key) = self.key {
            record.insert("key".to_string(), Value::String(key));
        }
        record.insert("tokens".to_string(), Value::from(self.tokens));
        record.extend(self.request);
        record.insert("response".to_string(), Value::String(self.response));
        Value::Object(record)
    }
}

/// Running count and transcript for one response stream.
#[derive(Debug)]
pub struct UsageAccumulator {
    key: Option<String>,
    request: Map<String, Value>,
    decoder: Utf8StreamDecoder,
    parser: EventStreamParser,
    tokens: usize,
    transcript: String,
}

impl UsageAccumulator {
    /// Start accumulating, seeded with the prompt length of `request`.
    pub fn new(key: Option<String>, request: Map<String, Value>) -> Self {
        let tokens = prompt_length(&request);
        Self {
            key,
            request,
            decoder: Utf8StreamDecoder::new(),
            parser: EventStreamParser::new(),
            tokens,
            transcript: String::new(),
        }
    }

    /// Accumulator for `request`, when it carried a JSON object body.
    pub fn for_request(request: &ProxyRequest) -> Option<Self> {
        let body = request.json_object()?.clone();
        Some(Self::new(request.credential_key(), body))
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        let text = self.decoder.decode(chunk);
        for payload in self.parser.push(&text) {
            self.apply(&payload);
        }
    }

    /// End of stream. Consumes the accumulator so a record is built once.
    pub fn finish(mut self) -> UsageRecord {
        let tail = self.decoder.finish();
        for payload in self.parser.push(&tail) {
            self.apply(&payload);
        }
        if let Some(payload) = self.parser.finish() {
            self.apply(&payload);
        }

        UsageRecord {
            key: self.key,
            tokens: self.tokens,
            request: self.request,
            response: self.transcript,
        }
    }

    fn apply(&mut self, payload: &str) {
        if let Some(content) = content_fragment(payload) {
            self.tokens += content.chars().count();
            self.transcript.push_str(&content);
        }
    }
}

/// Drive `accumulator` over `branch` to its end and report the record.
///
/// A branch error ends accumulation early; the partial record is still
/// reported.
pub async fn run_usage_accumulator<S>(
    mut branch: S,
    mut accumulator: UsageAccumulator,
    sink: &dyn TelemetrySink,
    dataset: &str,
) -> UsageRecord
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    while let Some(item) = branch.next().await {
        match item {
            Ok(chunk) => accumulator.feed(&chunk),
            Err(e) => {
                tracing::debug!(error = %e, "Response stream ended with error, reporting partial usage");
                break;
            }
        }
    }

    let record = accumulator.finish();
    tracing::debug!(
        tokens = record.tokens,
        response_len = record.response.len(),
        "Usage accumulation complete"
    );
    emit_usage_record(sink, dataset, record.clone()).await;
    record
}

/// Ingest one record and flush. Failures are logged, never returned.
pub async fn emit_usage_record(sink: &dyn TelemetrySink, dataset: &str, record: UsageRecord) {
    let metrics = get_metrics();
    metrics.usage_tokens.inc_by(record.tokens as u64);

    let outcome = match sink.ingest(dataset, vec![record.into_value()]).await {
        Ok(()) => match sink.flush().await {
            Ok(()) => "ingested",
            Err(e) => {
                tracing::warn!(dataset = %dataset, error = %e, "Failed to flush usage record");
                "failed"
            }
        },
        Err(e) => {
            tracing::warn!(dataset = %dataset, error = %e, "Failed to ingest usage record");
            "failed"
        }
    };
    metrics.usage_records.with_label_values(&[outcome]).inc();
}
