//! Stream normalization
//!
//! Each provider exposes its stream differently. A [`StreamSource`] advances
//! the provider-native stream one unit at a time; [`NormalizedStream`] turns
//! any source into a pull-based byte reader with latched usage.
//!
//! Two source shapes exist:
//! - [`SseSource`]: pulls the next SSE event on every advance and decodes it
//!   in place ([`EventDecoder`] per provider).
//! - [`BridgedSource`]: a background task drains a push-style stream into a
//!   bounded channel; the reader pulls from the channel. The task stops when
//!   the source is shut down, dropped, or the caller's token is cancelled.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{GatewayError, ProviderError};
use crate::providers::{Provider, Usage};

/// One advance of a provider stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamUnit {
    pub text: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

impl StreamUnit {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn usage(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Default::default()
        }
    }
}

/// Provider-native stream, advanced one unit at a time
#[async_trait]
pub trait StreamSource: Send {
    /// `Ok(None)` once the source is exhausted
    async fn next_unit(&mut self) -> Result<Option<StreamUnit>, GatewayError>;

    /// Release the underlying connection or task. Must tolerate repeat calls.
    fn shutdown(&mut self);
}

/// Result of decoding one SSE data payload
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Unit(StreamUnit),
    /// Keep-alives and events carrying nothing of interest
    Skip,
    /// Explicit end-of-stream marker
    End,
}

/// Provider-specific decoding of SSE `data:` payloads
pub trait EventDecoder: Send {
    fn decode(&mut self, data: &str) -> Result<Decoded, ProviderError>;
}

type SseEvents = BoxStream<
    'static,
    Result<eventsource_stream::Event, eventsource_stream::EventStreamError<reqwest::Error>>,
>;

/// Pull-style source over a server-sent-event response body
pub struct SseSource<D: EventDecoder> {
    events: Option<SseEvents>,
    decoder: D,
    cancel: CancellationToken,
    provider: Provider,
    model_id: String,
}

impl<D: EventDecoder> SseSource<D> {
    pub fn new(
        response: reqwest::Response,
        decoder: D,
        cancel: &CancellationToken,
        provider: Provider,
        model_id: &str,
    ) -> Self {
        Self {
            events: Some(response.bytes_stream().eventsource().boxed()),
            decoder,
            cancel: cancel.clone(),
            provider,
            model_id: model_id.to_string(),
        }
    }
}

#[async_trait]
impl<D: EventDecoder> StreamSource for SseSource<D> {
    async fn next_unit(&mut self) -> Result<Option<StreamUnit>, GatewayError> {
        loop {
            let Some(events) = self.events.as_mut() else {
                return Ok(None);
            };

            let next = tokio::select! {
                _ = self.cancel.cancelled() => None,
                next = events.next() => Some(next),
            };
            let Some(next) = next else {
                self.shutdown();
                return Err(GatewayError::Cancelled);
            };

            let event = match next {
                None => {
                    self.shutdown();
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.shutdown();
                    return Err(ProviderError::transient(
                        self.provider.as_str(),
                        &self.model_id,
                        format!("stream read failed: {}", e),
                    )
                    .into());
                }
                Some(Ok(event)) => event,
            };

            if event.data.is_empty() {
                continue;
            }

            match self.decoder.decode(&event.data)? {
                Decoded::Unit(unit) => return Ok(Some(unit)),
                Decoded::Skip => continue,
                Decoded::End => {
                    self.shutdown();
                    return Ok(None);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        // Dropping the event stream drops the response body and its connection
        self.events = None;
    }
}

/// Decode SSE payloads into a push-style stream of units.
///
/// The stream ends after an [`Decoded::End`] marker or the first error.
pub fn decode_sse_stream<D: EventDecoder + 'static>(
    response: reqwest::Response,
    mut decoder: D,
    provider: Provider,
    model_id: &str,
) -> impl Stream<Item = Result<StreamUnit, GatewayError>> + Send + 'static {
    let model_id = model_id.to_string();
    let events = response.bytes_stream().eventsource();

    events
        .map(move |event| match event {
            Ok(event) if event.data.is_empty() => Ok(Decoded::Skip),
            Ok(event) => decoder.decode(&event.data).map_err(GatewayError::from),
            Err(e) => Err(ProviderError::transient(
                provider.as_str(),
                &model_id,
                format!("stream read failed: {}", e),
            )
            .into()),
        })
        .scan(false, |finished, item| {
            if *finished {
                return futures::future::ready(None);
            }
            let next = match item {
                Ok(Decoded::End) => None,
                Ok(Decoded::Skip) => Some(None),
                Ok(Decoded::Unit(unit)) => Some(Some(Ok(unit))),
                Err(e) => {
                    *finished = true;
                    Some(Some(Err(e)))
                }
            };
            futures::future::ready(next)
        })
        .filter_map(futures::future::ready)
}

/// Bounded hand-off between a background producer task and a pull reader
pub struct BridgedSource {
    rx: mpsc::Receiver<Result<StreamUnit, GatewayError>>,
    done: CancellationToken,
    parent: CancellationToken,
    _guard: DropGuard,
}

impl BridgedSource {
    /// Capacity of the hand-off channel; producer waits once it is full
    pub const CHANNEL_CAPACITY: usize = 1;

    /// Spawn the bridging task. Must be called within a tokio runtime.
    pub fn spawn<S>(producer: S, cancel: &CancellationToken) -> Self
    where
        S: Stream<Item = Result<StreamUnit, GatewayError>> + Send + 'static,
    {
        let done = cancel.child_token();
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        let task_done = done.clone();

        tokio::spawn(async move {
            let mut producer = Box::pin(producer);
            loop {
                let item = tokio::select! {
                    biased;
                    _ = task_done.cancelled() => break,
                    item = producer.next() => item,
                };
                let Some(item) = item else { break };
                let terminal = item.is_err();

                tokio::select! {
                    biased;
                    _ = task_done.cancelled() => break,
                    sent = tx.send(item) => {
                        if sent.is_err() || terminal {
                            break;
                        }
                    }
                }
            }
            tracing::trace!("Stream bridge task finished");
        });

        Self {
            rx,
            _guard: done.clone().drop_guard(),
            done,
            parent: cancel.clone(),
        }
    }
}

#[async_trait]
impl StreamSource for BridgedSource {
    async fn next_unit(&mut self) -> Result<Option<StreamUnit>, GatewayError> {
        if self.parent.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.parent.cancelled() => Err(GatewayError::Cancelled),
            item = self.rx.recv() => match item {
                Some(Ok(unit)) => Ok(Some(unit)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
        }
    }

    fn shutdown(&mut self) {
        self.done.cancel();
        self.rx.close();
    }
}

/// Latest non-zero usage seen on a stream.
///
/// Each field is latched independently; a report never lowers a field, so
/// the latch is non-decreasing across units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageLatch {
    usage: Usage,
}

impl UsageLatch {
    pub fn observe(&mut self, reported: &Usage) {
        if reported.input_tokens > self.usage.input_tokens {
            self.usage.input_tokens = reported.input_tokens;
        }
        if reported.output_tokens > self.usage.output_tokens {
            self.usage.output_tokens = reported.output_tokens;
        }
    }

    pub fn get(&self) -> Usage {
        self.usage
    }
}

/// Provider stream plus identifying metadata, as returned by an adapter
pub struct StreamHandle {
    pub provider: Provider,
    pub model_id: String,
    source: Box<dyn StreamSource>,
}

impl StreamHandle {
    pub fn new(provider: Provider, model_id: &str, source: impl StreamSource + 'static) -> Self {
        Self {
            provider,
            model_id: model_id.to_string(),
            source: Box::new(source),
        }
    }

    pub fn into_reader(self) -> NormalizedStream {
        NormalizedStream::new(self)
    }
}

#[derive(Debug)]
enum ReadState {
    Open,
    Eof,
    Failed(GatewayError),
    Closed,
}

/// Pull-based byte reader over any provider stream
pub struct NormalizedStream {
    provider: Provider,
    model_id: String,
    source: Box<dyn StreamSource>,
    pending: Vec<u8>,
    offset: usize,
    latch: UsageLatch,
    finish_reason: Option<String>,
    state: ReadState,
}

impl NormalizedStream {
    pub fn new(handle: StreamHandle) -> Self {
        Self {
            provider: handle.provider,
            model_id: handle.model_id,
            source: handle.source,
            pending: Vec::new(),
            offset: 0,
            latch: UsageLatch::default(),
            finish_reason: None,
            state: ReadState::Open,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Fill `buf` with the next bytes of generated text.
    ///
    /// Returns `Ok(0)` at end of stream (and after `close`). An error ends
    /// the stream; every later read returns the same error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, GatewayError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.offset < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.offset);
                buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }

            match &self.state {
                ReadState::Open => {}
                ReadState::Eof | ReadState::Closed => return Ok(0),
                ReadState::Failed(err) => return Err(err.clone()),
            }

            match self.source.next_unit().await {
                Ok(Some(unit)) => self.absorb(unit),
                Ok(None) => {
                    self.state = ReadState::Eof;
                    self.source.shutdown();
                    tracing::debug!(
                        provider = %self.provider,
                        model = %self.model_id,
                        input_tokens = self.latch.get().input_tokens,
                        output_tokens = self.latch.get().output_tokens,
                        "Stream reached end"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        provider = %self.provider,
                        model = %self.model_id,
                        error = %err,
                        "Stream terminated with error"
                    );
                    self.state = ReadState::Failed(err.clone());
                    self.source.shutdown();
                    return Err(err);
                }
            }
        }
    }

    /// Next text fragment as the backend produced it; `None` at end of stream
    pub async fn next_fragment(&mut self) -> Result<Option<String>, GatewayError> {
        let mut buf = [0u8; 4096];
        let mut bytes = Vec::new();
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&buf[..n]);
            if self.offset >= self.pending.len() && std::str::from_utf8(&bytes).is_ok() {
                break;
            }
        }
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Drain the stream into a string
    pub async fn read_to_string(&mut self) -> Result<String, GatewayError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Stop reading and release the provider stream. Idempotent.
    pub fn close(&mut self) {
        if !matches!(self.state, ReadState::Closed) {
            self.source.shutdown();
            self.pending.clear();
            self.offset = 0;
            self.state = ReadState::Closed;
        }
    }

    /// Latched usage; final only once the stream reached end
    pub fn usage(&self) -> Usage {
        self.latch.get()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.state, ReadState::Eof)
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.state, ReadState::Open)
    }

    pub fn error(&self) -> Option<&GatewayError> {
        match &self.state {
            ReadState::Failed(err) => Some(err),
            _ => None,
        }
    }

    fn absorb(&mut self, unit: StreamUnit) {
        if let Some(usage) = unit.usage {
            self.latch.observe(&usage);
        }
        if unit.finish_reason.is_some() {
            self.finish_reason = unit.finish_reason;
        }
        if !unit.text.is_empty() {
            if self.offset >= self.pending.len() {
                self.pending.clear();
                self.offset = 0;
            }
            self.pending.extend_from_slice(unit.text.as_bytes());
        }
    }
}

impl Drop for NormalizedStream {
    fn drop(&mut self) {
        self.source.shutdown();
    }
}

/// Source replaying a fixed list of units; used by tests and fakes
pub struct ScriptedSource {
    units: std::collections::VecDeque<Result<StreamUnit, GatewayError>>,
    shutdowns: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(units: Vec<Result<StreamUnit, GatewayError>>) -> Self {
        Self {
            units: units.into(),
            shutdowns: Default::default(),
        }
    }

    /// Counter incremented on every `shutdown` call
    pub fn shutdown_counter(&self) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
        self.shutdowns.clone()
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    async fn next_unit(&mut self) -> Result<Option<StreamUnit>, GatewayError> {
        self.units.pop_front().transpose()
    }

    fn shutdown(&mut self) {
        self.units.clear();
        self.shutdowns
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
