//! Provider stream frame parsing.
//!
//! Upstream bytes arrive in chunks whose boundaries have nothing to do with
//! frame boundaries. [`FrameBuffer`] accumulates them and only releases text
//! up to the last blank-line delimiter; [`classify_frame`] turns each released
//! frame into a tagged [`ProviderFrame`]; [`ProviderStream`] drives both as a
//! pull-based sequence of [`StreamItem`]s.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use memchr::memmem;

use crate::error::RelayError;
use crate::protocol::ChatCompletionChunk;

/// Terminal sentinel sent by the provider as the last `data:` payload.
pub const DONE_SENTINEL: &str = "[DONE]";

/// A single upstream frame, classified before any field access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderFrame {
    ContentDelta(String),
    Done,
    /// Keep-alives, comments, role-only deltas and undecodable payloads.
    Unrecognized,
}

/// Item of the parsed provider sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Fragment(String),
    Done,
}

// ---------------------------------------------------------------------------
// FrameBuffer: chunk accumulation and blank-line splitting
// ---------------------------------------------------------------------------

/// Accumulates raw chunks and splits complete frames off the front.
///
/// Text after the last delimiter stays buffered and is prefixed onto the next
/// chunk. Splitting happens on bytes, so a UTF-8 sequence cut by a chunk
/// boundary is reassembled before it is decoded.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: BytesMut,
    scan_from: usize,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            scan_from: 0,
        }
    }

    /// Append a chunk and push every frame it completes onto `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut VecDeque<String>) {
        self.buffer.extend_from_slice(chunk);
        while let Some((frame_end, delimiter_len)) =
            find_frame_delimiter_from(&self.buffer, self.scan_from)
        {
            let frame = self.buffer.split_to(frame_end + delimiter_len);
            self.scan_from = 0;
            let text = String::from_utf8_lossy(&frame[..frame_end]);
            if !text.trim().is_empty() {
                out.push_back(text.into_owned());
            }
        }
        // Keep a small overlap so a delimiter spanning two chunks is still found.
        self.scan_from = self.buffer.len().saturating_sub(3);
    }

    /// Release whatever is left once the source has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        self.scan_from = 0;
        let text = String::from_utf8_lossy(&rest);
        if text.trim().is_empty() {
            None
        } else {
            Some(text.into_owned())
        }
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn find_frame_delimiter_from(buffer: &[u8], scan_from: usize) -> Option<(usize, usize)> {
    static LF_LF_FINDER: LazyLock<memmem::Finder<'static>> =
        LazyLock::new(|| memmem::Finder::new(b"\n\n"));
    static CRLF_CRLF_FINDER: LazyLock<memmem::Finder<'static>> =
        LazyLock::new(|| memmem::Finder::new(b"\r\n\r\n"));

    let scan_from = scan_from.min(buffer.len());
    let haystack = &buffer[scan_from..];
    let lf_lf_pos = LF_LF_FINDER.find(haystack).map(|rel| scan_from + rel);
    let crlf_crlf_pos = CRLF_CRLF_FINDER.find(haystack).map(|rel| scan_from + rel);

    match (lf_lf_pos, crlf_crlf_pos) {
        (Some(lf_pos), Some(crlf_pos)) => {
            if lf_pos <= crlf_pos {
                Some((lf_pos, 2))
            } else {
                Some((crlf_pos, 4))
            }
        }
        (Some(lf_pos), None) => Some((lf_pos, 2)),
        (None, Some(crlf_pos)) => Some((crlf_pos, 4)),
        (None, None) => None,
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify one complete frame.
///
/// Any frame carrying the sentinel ends the stream, whatever else it holds.
/// Otherwise `data:` lines are joined with `\n` (one space after the colon is
/// dropped); `event:`, `id:`, `retry:` and `:` comment lines carry nothing for
/// us. A frame with no `data:` line is tried as bare JSON.
#[must_use]
pub fn classify_frame(frame: &str) -> ProviderFrame {
    if frame.contains(DONE_SENTINEL) {
        return ProviderFrame::Done;
    }
    let Some(payload) = frame_payload(frame) else {
        return ProviderFrame::Unrecognized;
    };

    match serde_json::from_str::<ChatCompletionChunk>(payload.trim()) {
        Ok(chunk) => chunk
            .into_fragment()
            .map_or(ProviderFrame::Unrecognized, ProviderFrame::ContentDelta),
        Err(err) => {
            tracing::trace!(error = %err, "dropping undecodable provider frame");
            ProviderFrame::Unrecognized
        }
    }
}

fn frame_payload(frame: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in frame.lines() {
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(buffer) => {
                buffer.push('\n');
                buffer.push_str(value);
            }
            None => data = Some(value.to_owned()),
        }
    }

    if data.is_none() {
        let trimmed = frame.trim_start();
        if trimmed.starts_with('{') {
            return Some(trimmed.to_owned());
        }
    }
    data
}

// ---------------------------------------------------------------------------
// ProviderStream: pull-based sequence over an upstream byte stream
// ---------------------------------------------------------------------------

type ByteSource = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// Lazily parses an upstream byte stream into [`StreamItem`]s.
///
/// The sequence ends after the first [`StreamItem::Done`], after a source
/// error, or when the source ends; frames after the sentinel are never
/// classified and the source is not polled again.
pub struct ProviderStream {
    source: ByteSource,
    buffer: FrameBuffer,
    pending: VecDeque<String>,
    idle_timeout: Option<Duration>,
    source_ended: bool,
    finished: bool,
}

impl ProviderStream {
    pub fn new<S, E>(byte_stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display + 'static,
    {
        let source = byte_stream.map(|chunk| chunk.map_err(|err| err.to_string()));
        Self {
            source: Box::pin(source),
            buffer: FrameBuffer::new(),
            pending: VecDeque::with_capacity(8),
            idle_timeout: None,
            source_ended: false,
            finished: false,
        }
    }

    /// Fail the sequence when the source yields nothing for `timeout`.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Pull the next item.
    ///
    /// Source errors are reported as [`RelayError::UpstreamMidStream`], a
    /// silent source as [`RelayError::IdleTimeout`]; both end the sequence.
    pub async fn next_item(&mut self) -> Option<Result<StreamItem, RelayError>> {
        loop {
            if self.finished {
                return None;
            }

            while let Some(frame) = self.pending.pop_front() {
                match classify_frame(&frame) {
                    ProviderFrame::ContentDelta(text) => {
                        return Some(Ok(StreamItem::Fragment(text)));
                    }
                    ProviderFrame::Done => {
                        self.finish();
                        return Some(Ok(StreamItem::Done));
                    }
                    ProviderFrame::Unrecognized => {}
                }
            }

            if self.source_ended {
                self.finished = true;
                return None;
            }

            match self.next_chunk().await {
                Ok(Some(bytes)) => self.buffer.push(&bytes, &mut self.pending),
                Ok(None) => {
                    self.source_ended = true;
                    if let Some(rest) = self.buffer.finish() {
                        self.pending.push_back(rest);
                    }
                }
                Err(err) => {
                    self.finish();
                    return Some(Err(err));
                }
            }
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, RelayError> {
        let next = match self.idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.source.next())
                .await
                .map_err(|_| RelayError::IdleTimeout(timeout.as_secs()))?,
            None => self.source.next().await,
        };
        match next {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(message)) => Err(RelayError::UpstreamMidStream(message)),
            None => Ok(None),
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.pending.clear();
    }

    /// Adapt into a `futures` stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamItem, RelayError>> + Send {
        futures_util::stream::unfold(self, |mut stream| async move {
            let item = stream.next_item().await?;
            Some((item, stream))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const HI_FRAME: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n";

    fn delta_frame(text: &str) -> String {
        let payload = serde_json::json!({ "choices": [{ "delta": { "content": text } }] });
        format!("data: {payload}\n\n")
    }

    fn frames_of(chunks: &[&[u8]]) -> Vec<String> {
        let mut buffer = FrameBuffer::new();
        let mut out = VecDeque::new();
        for chunk in chunks {
            buffer.push(chunk, &mut out);
        }
        out.extend(buffer.finish());
        out.into_iter().collect()
    }

    async fn collect_items(chunks: Vec<Vec<u8>>) -> Vec<Result<StreamItem, String>> {
        let source = futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<Bytes, std::convert::Infallible>(Bytes::from(chunk))),
        );
        ProviderStream::new(source)
            .into_stream()
            .map(|item| item.map_err(|err| err.to_string()))
            .collect()
            .await
    }

    fn fragments(items: &[Result<StreamItem, String>]) -> Vec<String> {
        items
            .iter()
            .filter_map(|item| match item {
                Ok(StreamItem::Fragment(text)) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    // -- FrameBuffer --

    #[test]
    fn test_whole_frames_in_one_chunk() {
        let frames = frames_of(&[b"data: a\n\ndata: b\n\n".as_slice()]);
        assert_eq!(frames, vec!["data: a", "data: b"]);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut buffer = FrameBuffer::new();
        let mut out = VecDeque::new();
        buffer.push(b"data: {\"choi", &mut out);
        assert!(out.is_empty());
        assert_eq!(buffer.buffered_len(), 12);
        buffer.push(b"ces\":[]}\n\ndata: x", &mut out);
        assert_eq!(out.pop_front().as_deref(), Some("data: {\"choices\":[]}"));
        assert!(out.is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("data: x"));
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let frames = frames_of(&[
            b"data: a\n".as_slice(),
            b"\ndata: b\r\n\r".as_slice(),
            b"\n".as_slice(),
        ]);
        assert_eq!(frames, vec!["data: a", "data: b"]);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let text = "data: caf\u{e9} \u{1f351}\n\n";
        let bytes = text.as_bytes();
        let split = bytes.len() - 4;
        let frames = frames_of(&[&bytes[..split], &bytes[split..]]);
        assert_eq!(frames, vec!["data: caf\u{e9} \u{1f351}"]);
    }

    #[test]
    fn test_blank_frames_are_skipped() {
        let frames = frames_of(&[b"\n\n\n\ndata: a\n\n\n\n".as_slice()]);
        assert_eq!(frames, vec!["data: a"]);
        assert!(frames_of(&[b"  \n".as_slice()]).is_empty());
    }

    // -- classify_frame --

    #[test]
    fn test_classify_content_delta() {
        assert_eq!(
            classify_frame(HI_FRAME.trim_end()),
            ProviderFrame::ContentDelta("Hi".into())
        );
    }

    #[test]
    fn test_classify_done_with_and_without_space() {
        assert_eq!(classify_frame("data: [DONE]"), ProviderFrame::Done);
        assert_eq!(classify_frame("data:[DONE]"), ProviderFrame::Done);
        assert_eq!(classify_frame("data: [DONE]\ndata: tail"), ProviderFrame::Done);
        assert_eq!(classify_frame("[DONE]"), ProviderFrame::Done);
    }

    #[test]
    fn test_classify_ignorable_frames() {
        assert_eq!(classify_frame(": keep-alive"), ProviderFrame::Unrecognized);
        assert_eq!(classify_frame("data: not json"), ProviderFrame::Unrecognized);
        assert_eq!(
            classify_frame("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}"),
            ProviderFrame::Unrecognized
        );
        assert_eq!(
            classify_frame("event: ping\ndata: {}"),
            ProviderFrame::Unrecognized
        );
    }

    #[test]
    fn test_classify_sentinel_anywhere_ends_stream() {
        let frame = delta_frame("[DONE]");
        assert_eq!(classify_frame(frame.trim_end()), ProviderFrame::Done);
        assert_eq!(
            classify_frame("data: {\"choices\":[{\"delta\":{\"content\":\"a [DONE] b\"}}]}"),
            ProviderFrame::Done
        );
        assert_eq!(classify_frame(": comment [DONE]"), ProviderFrame::Done);
    }

    #[test]
    fn test_classify_bare_json_and_named_event() {
        assert_eq!(
            classify_frame("{\"choices\":[{\"delta\":{\"content\":\"x\"}}]}"),
            ProviderFrame::ContentDelta("x".into())
        );
        assert_eq!(
            classify_frame("event: chunk\ndata:{\"choices\":[{\"delta\":{\"content\":\"y\"}}]}"),
            ProviderFrame::ContentDelta("y".into())
        );
    }

    // -- ProviderStream --

    #[tokio::test]
    async fn test_fragments_are_split_invariant() {
        let mut raw = String::new();
        for text in ["Hel", "lo, ", "w\u{f6}rld", " \u{1f351}"] {
            raw.push_str(&delta_frame(text));
        }
        raw.push_str(": keep-alive\n\n");
        raw.push_str(&delta_frame("!"));
        raw.push_str("data: [DONE]\n\n");
        let bytes = raw.as_bytes();

        let whole = fragments(&collect_items(vec![bytes.to_vec()]).await);
        assert_eq!(whole, vec!["Hel", "lo, ", "w\u{f6}rld", " \u{1f351}", "!"]);

        for split in 1..bytes.len() {
            let items =
                collect_items(vec![bytes[..split].to_vec(), bytes[split..].to_vec()]).await;
            assert_eq!(fragments(&items), whole, "split at {split}");
            assert_eq!(items.last(), Some(&Ok(StreamItem::Done)));
        }

        let byte_at_a_time: Vec<Vec<u8>> = bytes.iter().map(|b| vec![*b]).collect();
        assert_eq!(fragments(&collect_items(byte_at_a_time).await), whole);
    }

    #[tokio::test]
    async fn test_frames_after_done_are_ignored() {
        let raw = format!(
            "{}data: [DONE]\n\n{}{}",
            delta_frame("a"),
            delta_frame("late"),
            "data: [DONE]\n\n"
        );
        let items = collect_items(vec![raw.into_bytes()]).await;
        assert_eq!(
            items,
            vec![Ok(StreamItem::Fragment("a".into())), Ok(StreamItem::Done)]
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_disturb_neighbours() {
        let raw = format!(
            "{}data: {{\"choices\":[{{\"delta\":\n\n{}",
            delta_frame("left"),
            delta_frame("right")
        );
        let items = collect_items(vec![raw.into_bytes()]).await;
        assert_eq!(
            items,
            vec![
                Ok(StreamItem::Fragment("left".into())),
                Ok(StreamItem::Fragment("right".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_trailing_frame_without_delimiter_is_flushed() {
        let raw = format!(
            "{}data: {}",
            delta_frame("a"),
            "{\"choices\":[{\"delta\":{\"content\":\"b\"}}]}"
        );
        let items = collect_items(vec![raw.into_bytes()]).await;
        assert_eq!(fragments(&items), vec!["a", "b"]);
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_source_error_ends_sequence() {
        let source = futures_util::stream::iter(vec![
            Ok(Bytes::from(delta_frame("a"))),
            Err("connection reset".to_string()),
            Ok(Bytes::from(delta_frame("never"))),
        ]);
        let items: Vec<_> = ProviderStream::new(source).into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().ok(), Some(&StreamItem::Fragment("a".into())));
        assert!(matches!(
            items[1],
            Err(RelayError::UpstreamMidStream(ref message)) if message == "connection reset"
        ));
    }

    #[tokio::test]
    async fn test_idle_source_times_out() {
        let source = futures_util::stream::iter(vec![Ok::<Bytes, String>(Bytes::from(
            delta_frame("a"),
        ))])
        .chain(futures_util::stream::pending());
        let mut stream =
            ProviderStream::new(source).with_idle_timeout(Duration::from_millis(20));
        assert_eq!(
            stream.next_item().await.map(|item| item.ok()),
            Some(Some(StreamItem::Fragment("a".into())))
        );
        assert!(matches!(
            stream.next_item().await,
            Some(Err(RelayError::IdleTimeout(_)))
        ));
        assert!(stream.next_item().await.is_none());
    }
}
