//! SSE reader (C3): a generic, line-oriented server-sent-event parser shared
//! by every adapter, instead of being re-implemented inline per adapter the
//! way `km_tools`'s `chat`/`chat_loop` methods each inline their own
//! `bytes_stream().eventsource()` loop.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SseError {
    #[error("network error while reading event stream: {0}")]
    Io(String),
    #[error("malformed SSE framing: {0}")]
    Decode(String),
}

/// One `data: ...` record from an SSE stream. `event` carries the `event:`
/// line preceding this record, if the server sent one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseRecord {
    pub event: Option<String>,
    pub data: String,
}

/// Consume a byte stream (typically `reqwest::Response::bytes_stream()`) and
/// emit one [`SseRecord`] per `data:` line. Blank lines, bare `event:` lines
/// with no data, and comment lines are not surfaced as records. The stream
/// ends cleanly on `data: [DONE]` or upstream EOF; a malformed line surfaces
/// an `Err` and ends the stream, matching spec section 4.3's "decode errors
/// stop iteration" rule. Scheduling is pull-based: nothing runs until the
/// returned stream is polled.
pub fn events<S>(byte_stream: S) -> impl Stream<Item = Result<SseRecord, SseError>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    async_stream::stream! {
        let source = byte_stream.eventsource();
        futures::pin_mut!(source);
        while let Some(frame) = source.next().await {
            match frame {
                Ok(event) => {
                    let data = event.data;
                    if data == "[DONE]" {
                        return;
                    }
                    // Non-JSON SSE metadata (e.g. keep-alive comments surfaced
                    // as empty data) is skipped rather than surfaced as a
                    // decode error.
                    if data.trim().is_empty() || !data.trim_start().starts_with('{') {
                        continue;
                    }
                    yield Ok(SseRecord {
                        event: if event.event.is_empty() { None } else { Some(event.event) },
                        data,
                    });
                }
                Err(err) => {
                    yield Err(SseError::Decode(err.to_string()));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunk(s: &str) -> Result<Bytes, reqwest::Error> {
        Ok(Bytes::from(s.to_string()))
    }

    #[tokio::test]
    async fn emits_one_record_per_data_line_and_stops_on_done() {
        let raw = stream::iter(vec![
            chunk("data: {\"a\":1}\n\n"),
            chunk("data: {\"a\":2}\n\n"),
            chunk("data: [DONE]\n\n"),
            chunk("data: {\"a\":3}\n\n"),
        ]);
        let records: Vec<_> = events(raw).collect().await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn skips_comments_and_blank_payloads() {
        let raw = stream::iter(vec![chunk(": keep-alive\n\n"), chunk("data: {\"a\":1}\n\n")]);
        let records: Vec<_> = events(raw).collect().await;
        assert_eq!(records.len(), 1);
    }
}
