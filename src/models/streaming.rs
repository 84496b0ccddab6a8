//! Incremental response delivery.
//!
//! A provider pushes chunks through a [`StreamSender`]; the caller pulls them
//! from a [`ChatStream`]. Dropping or cancelling the `ChatStream` cancels the
//! shared token, which stops the producer task and releases its HTTP
//! response.

use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::{
    FinishReason, StreamChunk, TokenUsage, ToolCall, ToolCallDelta,
};

const CHANNEL_CAPACITY: usize = 64;

/// Highest tool-call slot a stream may address. Deltas past it are dropped.
pub const MAX_TOOL_CALLS: usize = 128;

pub struct ChatStream {
    request_id: String,
    rx: mpsc::Receiver<Result<StreamChunk>>,
    cancel: CancellationToken,
    done: bool,
}

impl ChatStream {
    /// Creates a connected sender/stream pair sharing `cancel`.
    pub fn channel(request_id: impl Into<String>, cancel: CancellationToken) -> (StreamSender, ChatStream) {
        let request_id = request_id.into();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let sender = StreamSender {
            request_id: request_id.clone(),
            tx,
            cancel: cancel.clone(),
            next_index: 0,
        };
        let stream = ChatStream {
            request_id,
            rx,
            cancel,
            done: false,
        };
        (sender, stream)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(chunk)) => {
                if chunk.is_last {
                    self.done = true;
                }
                Ok(Some(chunk))
            }
            Some(Err(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                if self.cancel.is_cancelled() {
                    Err(Error::Cancelled(self.request_id.clone()))
                } else {
                    Err(Error::stream("stream ended without a terminal chunk"))
                }
            }
        }
    }

    /// Stops the stream early; the producer is signalled immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drains the stream, concatenating text and tool-call deltas.
    pub async fn collect(mut self) -> Result<StreamSummary> {
        let mut summary = StreamSummary::default();
        while let Some(chunk) = self.next_chunk().await? {
            summary.chunks += 1;
            summary.content.push_str(&chunk.delta);
            if let Some(delta) = &chunk.tool_call_delta {
                summary.apply_tool_delta(delta);
            }
            if chunk.is_last {
                summary.finish_reason = chunk.finish_reason;
                summary.usage = chunk.usage;
            }
        }
        Ok(summary)
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.cancel();
        }
    }
}

impl Stream for ChatStream {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if chunk.is_last {
                    self.done = true;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.done = true;
                if self.cancel.is_cancelled() {
                    Poll::Ready(Some(Err(Error::Cancelled(self.request_id.clone()))))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
    pub chunks: usize,
}

impl StreamSummary {
    fn apply_tool_delta(&mut self, delta: &ToolCallDelta) {
        let index = delta.index as usize;
        if index >= MAX_TOOL_CALLS {
            debug!(index, "ignoring tool call delta past the slot limit");
            return;
        }
        while self.tool_calls.len() <= index {
            self.tool_calls.push(ToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
        }
        let call = &mut self.tool_calls[index];
        if let Some(id) = &delta.id {
            call.id = id.clone();
        }
        if let Some(name) = &delta.name {
            call.name = name.clone();
        }
        call.arguments.push_str(&delta.arguments_delta);
    }
}

/// Producer half of a [`ChatStream`]. Assigns chunk indices and first/last
/// flags so providers only deal with deltas.
pub struct StreamSender {
    request_id: String,
    tx: mpsc::Sender<Result<StreamChunk>>,
    cancel: CancellationToken,
    next_index: u32,
}

impl StreamSender {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub async fn send_delta(&mut self, delta: String, tool_call_delta: Option<ToolCallDelta>) -> bool {
        let chunk = self.next_chunk(delta, tool_call_delta, false, None, None);
        self.send(Ok(chunk)).await
    }

    pub async fn finish(&mut self, finish_reason: FinishReason, usage: Option<TokenUsage>) -> bool {
        let chunk = self.next_chunk(String::new(), None, true, Some(finish_reason), usage);
        self.send(Ok(chunk)).await
    }

    /// Passes through a chunk produced by another stream unchanged.
    pub async fn forward(&mut self, chunk: StreamChunk) -> bool {
        self.next_index = chunk.index + 1;
        self.send(Ok(chunk)).await
    }

    pub async fn fail(&mut self, error: Error) -> bool {
        self.send(Err(error)).await
    }

    fn next_chunk(
        &mut self,
        delta: String,
        tool_call_delta: Option<ToolCallDelta>,
        is_last: bool,
        finish_reason: Option<FinishReason>,
        usage: Option<TokenUsage>,
    ) -> StreamChunk {
        let index = self.next_index;
        self.next_index += 1;
        StreamChunk {
            request_id: self.request_id.clone(),
            index,
            delta,
            tool_call_delta,
            is_first: index == 0,
            is_last,
            finish_reason,
            usage,
        }
    }

    async fn send(&mut self, item: Result<StreamChunk>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}

/// One server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder. Bytes are buffered until a full line is
/// available, so multi-byte characters split across network reads decode
/// correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&self.buffer).trim_end().to_string();
            self.buffer.clear();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(frame)
    }
}

/// Vendor-neutral meaning of one decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    ToolCall(ToolCallDelta),
    Finish(FinishReason),
    Usage {
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    /// Upstream reported an error mid-stream.
    Error(String),
    Done,
}

#[derive(Default)]
struct PumpState {
    finish_reason: Option<FinishReason>,
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    saw_tool_calls: bool,
}

impl PumpState {
    fn usage(&self) -> Option<TokenUsage> {
        if self.prompt_tokens.is_none() && self.completion_tokens.is_none() {
            return None;
        }
        Some(TokenUsage::new(
            self.prompt_tokens.unwrap_or(0),
            self.completion_tokens.unwrap_or(0),
        ))
    }

    fn finish_reason(&self) -> FinishReason {
        self.finish_reason.unwrap_or(if self.saw_tool_calls {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        })
    }
}

enum Flow {
    Continue,
    Finished,
    Stop,
}

/// Reads an SSE body to completion, translating frames with `parse` and
/// pushing chunks to `sender`. Frames `parse` rejects are logged and
/// skipped. Returns the final usage when the stream completed normally.
pub async fn pump_sse<F>(
    provider: &str,
    response: reqwest::Response,
    mut sender: StreamSender,
    mut parse: F,
) -> Option<TokenUsage>
where
    F: FnMut(&SseFrame) -> Result<Vec<StreamEvent>>,
{
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut state = PumpState::default();
    let cancel = sender.cancel_token().clone();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(provider, "stream cancelled by consumer");
                return None;
            }
            next = body.next() => next,
        };

        let frames = match next {
            Some(Ok(bytes)) => decoder.feed(&bytes),
            Some(Err(e)) => {
                warn!(provider, error = %e, "stream read failed");
                sender.fail(Error::stream(format!("{} stream read error: {}", provider, e))).await;
                return None;
            }
            None => {
                let frames: Vec<SseFrame> = decoder.finish().into_iter().collect();
                match apply_frames(provider, &frames, &mut parse, &mut sender, &mut state).await {
                    Flow::Stop => return None,
                    Flow::Continue | Flow::Finished => break,
                }
            }
        };

        match apply_frames(provider, &frames, &mut parse, &mut sender, &mut state).await {
            Flow::Continue => {}
            Flow::Finished => break,
            Flow::Stop => return None,
        }
    }

    let usage = state.usage();
    if sender.finish(state.finish_reason(), usage).await {
        usage
    } else {
        None
    }
}

async fn apply_frames<F>(
    provider: &str,
    frames: &[SseFrame],
    parse: &mut F,
    sender: &mut StreamSender,
    state: &mut PumpState,
) -> Flow
where
    F: FnMut(&SseFrame) -> Result<Vec<StreamEvent>>,
{
    for frame in frames {
        let events = match parse(frame) {
            Ok(events) => events,
            Err(e) => {
                debug!(provider, error = %e, data = %frame.data, "skipping malformed stream frame");
                continue;
            }
        };
        for event in events {
            match event {
                StreamEvent::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    if !sender.send_delta(text, None).await {
                        return Flow::Stop;
                    }
                }
                StreamEvent::ToolCall(delta) => {
                    state.saw_tool_calls = true;
                    if !sender.send_delta(String::new(), Some(delta)).await {
                        return Flow::Stop;
                    }
                }
                StreamEvent::Finish(reason) => state.finish_reason = Some(reason),
                StreamEvent::Usage {
                    prompt_tokens,
                    completion_tokens,
                } => {
                    if prompt_tokens.is_some() {
                        state.prompt_tokens = prompt_tokens;
                    }
                    if completion_tokens.is_some() {
                        state.completion_tokens = completion_tokens;
                    }
                }
                StreamEvent::Error(message) => {
                    warn!(provider, %message, "upstream error mid-stream");
                    sender.fail(Error::stream(format!("{}: {}", provider, message))).await;
                    return Flow::Stop;
                }
                StreamEvent::Done => return Flow::Finished,
            }
        }
    }
    Flow::Continue
}
