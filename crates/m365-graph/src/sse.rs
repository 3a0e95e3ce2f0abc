//! SSE line parsing and the upstream data pump.

use futures_util::{Stream, StreamExt};

use crate::client::GraphError;

#[derive(Debug, PartialEq)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Parse a single SSE line: `event: <type>` or `data: <payload>`.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

/// Stream of `data:` payloads from an upstream SSE response, including the
/// literal `[DONE]` terminator — the consumer decides when to stop.
pub fn data_stream(
    resp: reqwest::Response,
) -> impl Stream<Item = Result<String, GraphError>> {
    async_stream::try_stream! {
        let mut line_buf = String::new();
        let mut bytes = resp.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            let Ok(text) = std::str::from_utf8(&chunk) else {
                continue;
            };
            line_buf.push_str(text);
            while let Some(pos) = line_buf.find('\n') {
                let line = line_buf[..pos].trim().to_string();
                line_buf.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                if let Some(SseParsed::Data(data)) = parse_sse_line(&line) {
                    yield data;
                }
            }
        }
        // a final unterminated line still counts
        let tail = line_buf.trim();
        if !tail.is_empty() {
            if let Some(SseParsed::Data(data)) = parse_sse_line(tail) {
                yield data;
            }
        }
    }
}
