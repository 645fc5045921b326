//! Background pumps that republish an engine stream to many subscribers.
//!
//! A [`Pump`] owns one task that pulls from an [`Upstream`] (a JSON line
//! stream or a multiplexed log body) and publishes each item into a
//! [`PubSubChannel`]. Whatever ends the task (end of input, a dropped
//! connection, an error, [`Pump::stop`] or an abort) subscribers receive
//! exactly one [`StreamEvent::End`].
//!
//! [`EventBus`] and [`LogPump`] bind a pump to the events and container
//! logs endpoints.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::Method;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncRead};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{PubSubChannel, Subscriber};
use crate::engine::{self, LogOptions};
use crate::error::Result;
use crate::framing::{Frame, StreamType};
use crate::http::{self, BodyReader, HttpClient};
use crate::jsonstream::{JsonLineStream, Termination};
use crate::multiplexed::MultiplexedResult;

/// Item delivered to pump subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Output bytes from a multiplexed or TTY stream.
    Output {
        /// Source stream.
        stream: StreamType,
        /// Payload.
        data: Bytes,
    },
    /// One decoded JSON document.
    Json(Value),
    /// End of the stream. Always the last item a subscriber sees.
    End(EndReason),
}

impl StreamEvent {
    /// Whether this is the end-of-stream marker.
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End(_))
    }
}

impl From<Frame> for StreamEvent {
    fn from(frame: Frame) -> Self {
        Self::Output {
            stream: frame.stream,
            data: frame.payload,
        }
    }
}

impl From<Value> for StreamEvent {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Why a pumped stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The engine closed the stream.
    Eof,
    /// The connection was reset or dropped.
    ConnectionLost,
    /// The pump was stopped or aborted.
    Cancelled,
    /// Opening or decoding the stream failed.
    Failed(String),
}

impl From<Termination> for EndReason {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Eof => Self::Eof,
            Termination::ConnectionLost => Self::ConnectionLost,
            Termination::Closed => Self::Cancelled,
            Termination::Failed => Self::Failed("stream failed".to_string()),
        }
    }
}

/// A source of events a [`Pump`] can drive.
#[async_trait]
pub trait Upstream: Send + 'static {
    /// Next event, or `None` once the source has ended.
    async fn next_event(&mut self) -> Result<Option<StreamEvent>>;

    /// How the source ended.
    fn end_reason(&self) -> EndReason;
}

#[async_trait]
impl<R> Upstream for JsonLineStream<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        Ok(self.next().await?.map(StreamEvent::Json))
    }

    fn end_reason(&self) -> EndReason {
        self.termination().map_or(EndReason::Eof, EndReason::from)
    }
}

#[async_trait]
impl<R> Upstream for MultiplexedResult<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        Ok(self.next_frame().await?.map(StreamEvent::from))
    }

    fn end_reason(&self) -> EndReason {
        self.termination().map_or(EndReason::Eof, EndReason::from)
    }
}

/// Lifecycle of a [`Pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Never started.
    Idle,
    /// Task running.
    Running,
    /// Task finished or stopped. May be started again.
    Stopped,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    running: Option<Running>,
    /// `stop` calls still waiting for their task to exit.
    stopping: usize,
    started: bool,
}

/// One background task feeding a [`PubSubChannel`].
pub struct Pump<S> {
    name: String,
    channel: PubSubChannel<StreamEvent>,
    inner: Mutex<Inner>,
    _upstream: PhantomData<fn() -> S>,
}

impl<S> std::fmt::Debug for Pump<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pump")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("channel", &self.channel)
            .finish()
    }
}

impl<S> Pump<S> {
    /// Create an idle pump publishing into `channel`.
    pub fn new(name: impl Into<String>, channel: PubSubChannel<StreamEvent>) -> Self {
        Self {
            name: name.into(),
            channel,
            inner: Mutex::new(Inner::default()),
            _upstream: PhantomData,
        }
    }

    /// Register a subscriber on the pump's channel.
    pub fn subscribe(&self) -> Subscriber<StreamEvent> {
        self.channel.subscribe()
    }

    /// The channel events are published to.
    pub fn channel(&self) -> &PubSubChannel<StreamEvent> {
        &self.channel
    }

    /// Stop the task and wait for it to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let running = inner.running.take();
            if running.is_some() {
                inner.stopping += 1;
            }
            running
        };
        let Some(running) = running else {
            return;
        };
        let _stopping = scopeguard::guard(&self.inner, |inner| {
            inner.lock().unwrap_or_else(PoisonError::into_inner).stopping -= 1;
        });

        running.token.cancel();
        match running.handle.await {
            Ok(()) => log::debug!("[Pump] {} stopped", self.name),
            Err(e) if e.is_cancelled() => log::debug!("[Pump] {} aborted", self.name),
            Err(e) => log::error!("[Pump] {} task panicked: {e}", self.name),
        }
    }

    /// Abort the task without waiting.
    pub fn abort(&self) {
        let running = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running
            .take();
        if let Some(running) = running {
            running.token.cancel();
            running.handle.abort();
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PumpState {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match &inner.running {
            _ if inner.stopping > 0 => PumpState::Running,
            Some(running) if !running.handle.is_finished() => PumpState::Running,
            _ if inner.started => PumpState::Stopped,
            _ => PumpState::Idle,
        }
    }
}

impl<S: Upstream> Pump<S> {
    /// Spawn the pump task. `open` connects to the upstream.
    ///
    /// Returns `false` (and logs a warning) if the task is already running.
    /// Must be called within a tokio runtime.
    pub fn start<F>(&self, open: F) -> bool
    where
        F: Future<Output = Result<S>> + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.stopping > 0
            || inner
                .running
                .as_ref()
                .is_some_and(|running| !running.handle.is_finished())
        {
            log::warn!("[Pump] {} already running, ignoring start", self.name);
            return false;
        }

        let token = CancellationToken::new();

        // Created before spawning so an abort before the first poll still
        // publishes the end marker.
        let guard = end_guard(self.name.clone(), self.channel.clone(), EndReason::Cancelled);
        let handle = tokio::spawn(run(guard, token.clone(), open));

        log::debug!("[Pump] {} started", self.name);
        inner.running = Some(Running { token, handle });
        inner.started = true;
        true
    }
}

impl<S> Drop for Pump<S> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = inner.running.take() {
            running.token.cancel();
        }
    }
}

type EndState = (String, PubSubChannel<StreamEvent>, EndReason);
type EndGuard = scopeguard::ScopeGuard<EndState, fn(EndState)>;

fn publish_end((name, channel, reason): EndState) {
    log::debug!("[Pump] {name} ended ({reason:?}), closing subscribers");
    channel.try_publish_terminal(StreamEvent::End(reason));
}

/// Guard that publishes `reason` without waiting when dropped.
fn end_guard(name: String, channel: PubSubChannel<StreamEvent>, reason: EndReason) -> EndGuard {
    scopeguard::guard((name, channel, reason), publish_end as fn(EndState))
}

async fn run<S, F>(guard: EndGuard, token: CancellationToken, open: F)
where
    S: Upstream,
    F: Future<Output = Result<S>> + Send,
{
    let reason = tokio::select! {
        () = token.cancelled() => None,
        reason = forward(&guard.0, &guard.1, open) => Some(reason),
    };

    // Cancelled: the guard delivers the marker without blocking on
    // stalled subscribers.
    let Some(reason) = reason else {
        return;
    };

    let (name, channel, _) = scopeguard::ScopeGuard::into_inner(guard);
    let guard = end_guard(name, channel, reason.clone());

    // A stop racing natural completion falls back to the guard's
    // non-blocking delivery for whoever is still registered.
    let delivered = tokio::select! {
        () = token.cancelled() => None,
        delivered = guard.1.publish_terminal(StreamEvent::End(reason)) => Some(delivered),
    };
    let Some(delivered) = delivered else {
        return;
    };
    let (name, _, reason) = scopeguard::ScopeGuard::into_inner(guard);
    log::debug!("[Pump] {name} ended ({reason:?}), {delivered} subscribers notified");
}

async fn forward<S, F>(name: &str, channel: &PubSubChannel<StreamEvent>, open: F) -> EndReason
where
    S: Upstream,
    F: Future<Output = Result<S>>,
{
    let mut upstream = match open.await {
        Ok(upstream) => upstream,
        Err(e) => {
            log::warn!("[Pump] {name} failed to open stream: {e}");
            return EndReason::Failed(e.to_string());
        }
    };

    loop {
        match upstream.next_event().await {
            Ok(Some(event)) => {
                channel.publish(event).await;
            }
            Ok(None) => return upstream.end_reason(),
            Err(e) => {
                log::warn!("[Pump] {name} stream failed: {e}");
                return EndReason::Failed(e.to_string());
            }
        }
    }
}

/// Rewrite an event's unix `time` field as an RFC 3339 string.
pub fn event_time_to_rfc3339(mut event: Value) -> Value {
    let Some(secs) = event.get("time").and_then(Value::as_i64) else {
        return event;
    };
    if let Some(time) = chrono::DateTime::from_timestamp(secs, 0) {
        event["time"] = Value::String(time.to_rfc3339());
    }
    event
}

/// The engine's event stream, shared by any number of subscribers.
pub struct EventBus {
    http: HttpClient,
    filters: Option<Value>,
    pump: Pump<JsonLineStream<BodyReader>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("filters", &self.filters)
            .field("pump", &self.pump)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create an idle bus.
    pub fn new(http: HttpClient, channel: PubSubChannel<StreamEvent>) -> Self {
        Self {
            http,
            filters: None,
            pump: Pump::new("events", channel),
        }
    }

    /// Only receive events matching `filters` (engine filter syntax, e.g.
    /// `{"type": ["container"]}`). Applies from the next start.
    #[must_use]
    pub fn with_filters(mut self, filters: Value) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Subscribe, starting the stream if it is not running yet.
    pub fn subscribe(&self) -> Subscriber<StreamEvent> {
        let subscriber = self.pump.subscribe();
        if self.pump.state() != PumpState::Running {
            self.start();
        }
        subscriber
    }

    /// Start streaming. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let http = self.http.clone();
        let mut query = http::query([("stream", "true")]);
        if let Some(filters) = &self.filters {
            query.push(("filters".to_string(), filters.to_string()));
        }
        self.pump.start(async move {
            let response = http.request(Method::GET, "events", &query, None).await?;
            Ok(JsonLineStream::new(http::body_reader(response)).with_transform(event_time_to_rfc3339))
        })
    }

    /// Stop streaming. Subscribers receive [`EndReason::Cancelled`].
    pub async fn stop(&self) {
        self.pump.stop().await;
    }

    /// Abort the stream task without waiting.
    pub fn abort(&self) {
        self.pump.abort();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PumpState {
        self.pump.state()
    }
}

/// Follows one container's logs for any number of subscribers.
pub struct LogPump {
    http: HttpClient,
    container: String,
    options: LogOptions,
    pump: Pump<MultiplexedResult<BodyReader>>,
}

impl std::fmt::Debug for LogPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPump")
            .field("container", &self.container)
            .field("options", &self.options)
            .field("pump", &self.pump)
            .finish_non_exhaustive()
    }
}

impl LogPump {
    /// Create an idle pump. `follow` is always forced on.
    pub fn new(
        http: HttpClient,
        container: impl Into<String>,
        options: LogOptions,
        channel: PubSubChannel<StreamEvent>,
    ) -> Self {
        let container = container.into();
        Self {
            http,
            pump: Pump::new(format!("logs:{container}"), channel),
            container,
            options: LogOptions {
                follow: true,
                ..options
            },
        }
    }

    /// Register a subscriber. Call [`start`](Self::start) to begin streaming.
    pub fn subscribe(&self) -> Subscriber<StreamEvent> {
        self.pump.subscribe()
    }

    /// Start following. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let http = self.http.clone();
        let container = self.container.clone();
        let options = self.options.clone();
        self.pump
            .start(async move { engine::open_logs(&http, &container, &options).await })
    }

    /// Stop following. Subscribers receive [`EndReason::Cancelled`].
    pub async fn stop(&self) {
        self.pump.stop().await;
    }

    /// Abort the task without waiting.
    pub fn abort(&self) {
        self.pump.abort();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PumpState {
        self.pump.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DeliveryPolicy;
    use crate::error::Error;
    use crate::framing::encode_frame;
    use crate::testing::ScriptedReader;
    use serde_json::json;
    use std::io;
    use std::time::Duration;
    use tokio::io::BufReader;

    type JsonUpstream = JsonLineStream<BufReader<ScriptedReader>>;

    fn json_pump() -> Pump<JsonUpstream> {
        Pump::new("test", PubSubChannel::new(16, DeliveryPolicy::Block))
    }

    fn json_source(reader: ScriptedReader) -> impl Future<Output = Result<JsonUpstream>> {
        async move { Ok(JsonLineStream::new(BufReader::new(reader))) }
    }

    async fn drain(subscriber: &mut Subscriber<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
            .await
            .expect("subscriber stalled")
        {
            events.push(event);
        }
        events
    }

    /// Upstream that never yields.
    struct Pending;

    #[async_trait]
    impl Upstream for Pending {
        async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
            std::future::pending().await
        }

        fn end_reason(&self) -> EndReason {
            EndReason::Eof
        }
    }

    #[tokio::test]
    async fn test_sentinel_after_eof() {
        let pump = json_pump();
        let mut sub = pump.subscribe();
        assert_eq!(pump.state(), PumpState::Idle);
        pump.start(json_source(ScriptedReader::new().chunk(&b"{\"a\":1}\n{\"a\":2}\n"[..])));

        let events = drain(&mut sub).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Json(json!({"a": 1})),
                StreamEvent::Json(json!({"a": 2})),
                StreamEvent::End(EndReason::Eof),
            ]
        );
    }

    #[tokio::test]
    async fn test_sentinel_after_connection_reset() {
        let pump = json_pump();
        let mut a = pump.subscribe();
        let mut b = pump.subscribe();
        pump.start(json_source(
            ScriptedReader::new()
                .chunk(&b"{\"a\":1}\n"[..])
                .error(io::ErrorKind::ConnectionReset),
        ));

        for sub in [&mut a, &mut b] {
            let events = drain(sub).await;
            assert_eq!(events.len(), 2);
            assert_eq!(events[1], StreamEvent::End(EndReason::ConnectionLost));
        }
    }

    #[tokio::test]
    async fn test_sentinel_after_open_failure() {
        let pump: Pump<JsonUpstream> = json_pump();
        let mut sub = pump.subscribe();
        pump.start(async { Err(Error::Http("refused".to_string())) });
        let events = drain(&mut sub).await;
        assert!(matches!(&events[..], [StreamEvent::End(EndReason::Failed(_))]));
    }

    #[tokio::test]
    async fn test_sentinel_after_decode_error() {
        let pump = json_pump();
        let mut sub = pump.subscribe();
        pump.start(json_source(ScriptedReader::new().chunk(&b"garbage\n"[..])));
        let events = drain(&mut sub).await;
        assert!(matches!(&events[..], [StreamEvent::End(EndReason::Failed(_))]));
    }

    #[tokio::test]
    async fn test_stop_publishes_cancelled_once() {
        let pump: Pump<Pending> = Pump::new("pending", PubSubChannel::default());
        let mut sub = pump.subscribe();
        assert!(pump.start(async { Ok(Pending) }));
        assert_eq!(pump.state(), PumpState::Running);

        pump.stop().await;
        pump.stop().await;
        assert_eq!(pump.state(), PumpState::Stopped);

        let events = drain(&mut sub).await;
        assert_eq!(events, vec![StreamEvent::End(EndReason::Cancelled)]);
    }

    #[tokio::test]
    async fn test_abort_publishes_cancelled() {
        let pump: Pump<Pending> = Pump::new("pending", PubSubChannel::default());
        let mut sub = pump.subscribe();
        pump.start(async { Ok(Pending) });
        pump.abort();

        let events = drain(&mut sub).await;
        assert_eq!(events, vec![StreamEvent::End(EndReason::Cancelled)]);
    }

    #[tokio::test]
    async fn test_start_while_running_is_ignored() {
        let pump: Pump<Pending> = Pump::new("pending", PubSubChannel::default());
        assert!(pump.start(async { Ok(Pending) }));
        assert!(!pump.start(async { Ok(Pending) }));
        pump.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let pump = json_pump();
        pump.start(json_source(ScriptedReader::new()));
        pump.stop().await;

        let mut sub = pump.subscribe();
        assert!(pump.start(json_source(ScriptedReader::new().chunk(&b"{\"n\":1}\n"[..]))));
        let events = drain(&mut sub).await;
        assert_eq!(events.last(), Some(&StreamEvent::End(EndReason::Eof)));
    }

    #[tokio::test]
    async fn test_log_frames_become_output_events() {
        let mut body = encode_frame(StreamType::Stdout, b"hello ");
        body.extend(encode_frame(StreamType::Stderr, b"oops"));
        let pump: Pump<MultiplexedResult<ScriptedReader>> =
            Pump::new("logs", PubSubChannel::default());
        let mut sub = pump.subscribe();
        pump.start(async move { Ok(MultiplexedResult::new(ScriptedReader::new().chunk(body), false)) });

        let events = drain(&mut sub).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Output {
                    stream: StreamType::Stdout,
                    data: Bytes::from_static(b"hello "),
                },
                StreamEvent::Output {
                    stream: StreamType::Stderr,
                    data: Bytes::from_static(b"oops"),
                },
                StreamEvent::End(EndReason::Eof),
            ]
        );
    }

    fn numbered_lines(count: usize) -> Vec<u8> {
        let mut lines = Vec::new();
        for i in 0..count {
            lines.extend_from_slice(format!("{{\"i\":{i}}}\n").as_bytes());
        }
        lines
    }

    #[tokio::test]
    async fn test_stop_with_stalled_subscriber_does_not_hang() {
        let pump = Pump::new("stalled", PubSubChannel::new(1, DeliveryPolicy::Block));
        let mut stalled = pump.subscribe();
        pump.start(json_source(ScriptedReader::new().chunk(numbered_lines(10))));
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), pump.stop())
            .await
            .expect("stop hung on a stalled subscriber");
        assert_eq!(pump.channel().subscriber_count(), 0);

        let events = drain(&mut stalled).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Json(json!({"i": 0})),
                StreamEvent::End(EndReason::Cancelled),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_after_eof_with_full_inbox_returns() {
        let pump = Pump::new("full", PubSubChannel::new(2, DeliveryPolicy::Block));
        let mut stalled = pump.subscribe();
        pump.start(json_source(ScriptedReader::new().chunk(numbered_lines(2))));

        // The end marker unregisters the subscriber once delivered.
        tokio::time::timeout(Duration::from_secs(2), async {
            while pump.channel().subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("end marker not delivered to a full inbox");

        tokio::time::timeout(Duration::from_secs(2), pump.stop())
            .await
            .expect("stop hung after the stream ended");
        assert_eq!(pump.state(), PumpState::Stopped);

        let events = drain(&mut stalled).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Json(json!({"i": 0})),
                StreamEvent::Json(json!({"i": 1})),
                StreamEvent::End(EndReason::Eof),
            ]
        );
    }

    #[test]
    fn test_event_time_converted() {
        let event = event_time_to_rfc3339(json!({"Action": "start", "time": 0}));
        assert_eq!(event["time"], json!("1970-01-01T00:00:00+00:00"));
        assert_eq!(event["Action"], json!("start"));

        let untouched = event_time_to_rfc3339(json!({"time": "already"}));
        assert_eq!(untouched["time"], json!("already"));
    }
}
