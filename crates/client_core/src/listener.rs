use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::{SinkExt, Stream, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use shared::protocol::RemoteEvent;

use crate::{
    backoff::{Backoff, BackoffPolicy},
    crypto::KeyMaterial,
    error::ClientError,
    frame::{decode_binary, decode_text, encode_heartbeat, FrameOutcome},
    session::Session,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Service map key holding the websocket endpoints.
    pub realtime_service: String,
    pub reconnect: BackoffPolicy,
    pub heartbeat_interval: Duration,
    pub queue_capacity: usize,
    /// Consecutive undecodable frames that force a reconnect.
    pub decode_failure_threshold: u32,
    pub connect_timeout: Duration,
    /// Recently delivered sequenced events remembered for replay detection.
    pub replay_history: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            realtime_service: "realtime".to_string(),
            reconnect: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: 256,
            decode_failure_threshold: 5,
            connect_timeout: Duration::from_secs(10),
            replay_history: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32, endpoint: String },
    Connected { endpoint: String },
    Reconnecting { attempt: u32, delay: Duration },
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Remote(RemoteEvent),
    State(ConnectionState),
    /// Sequence numbers were skipped between two delivered events.
    SequenceGap { expected: u64, received: u64 },
    /// Numbering went backwards with a new event; the stream restarted.
    SequenceReset { previous: u64, received: u64 },
    /// An exact repeat of an already delivered event was dropped.
    ReplaySuppressed { seq: u64 },
    /// This subscriber fell behind and lost `dropped` events.
    Overflow { dropped: u64 },
    Error(String),
}

/// One subscriber's view of the event stream.
pub struct Subscription {
    rx: broadcast::Receiver<ListenerEvent>,
}

impl Subscription {
    /// `None` once the listener is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<ListenerEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                warn!(dropped, "listener: subscriber lagged, events dropped");
                Some(ListenerEvent::Overflow { dropped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ListenerEvent> {
        BroadcastStream::new(self.rx).map(|item| match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(dropped)) => ListenerEvent::Overflow { dropped },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SequenceVerdict {
    Deliver,
    Gap { expected: u64, received: u64 },
    Reset { previous: u64, received: u64 },
    Replay,
}

/// Tracks sequence markers across connections. Only an exact repeat of a
/// recently delivered event counts as a replay; a new event whose marker goes
/// backwards is a reset and is delivered.
#[derive(Debug)]
pub(crate) struct SequenceTracker {
    last_seen: Option<u64>,
    recent: VecDeque<RemoteEvent>,
    capacity: usize,
}

impl SequenceTracker {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            last_seen: None,
            recent: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Events without a sequence marker are always delivered.
    pub(crate) fn observe(&mut self, event: &RemoteEvent) -> SequenceVerdict {
        let Some(seq) = event.seq() else {
            return SequenceVerdict::Deliver;
        };
        if self
            .recent
            .iter()
            .any(|seen| seen.seq() == Some(seq) && seen == event)
        {
            return SequenceVerdict::Replay;
        }

        let verdict = match self.last_seen {
            Some(last) if seq > last.saturating_add(1) => SequenceVerdict::Gap {
                expected: last + 1,
                received: seq,
            },
            Some(last) if seq < last => SequenceVerdict::Reset {
                previous: last,
                received: seq,
            },
            _ => SequenceVerdict::Deliver,
        };
        self.last_seen = Some(seq);

        if self.capacity > 0 {
            if self.recent.len() == self.capacity {
                self.recent.pop_front();
            }
            self.recent.push_back(event.clone());
        }
        verdict
    }

    pub(crate) fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }
}

enum DriveEnd {
    Shutdown,
    Dropped(String),
}

/// A realtime listener that has not started yet. Subscribe first, then
/// `spawn` so no early state transition is missed.
pub struct Listener {
    session: Arc<Session>,
    config: ListenerConfig,
    endpoints: Vec<Url>,
    events: broadcast::Sender<ListenerEvent>,
    state: watch::Sender<ConnectionState>,
}

impl Listener {
    pub fn new(session: Arc<Session>, config: ListenerConfig) -> Result<Self, ClientError> {
        session.require_key()?;
        let endpoints = session
            .service_endpoints()
            .get(&config.realtime_service)
            .map(<[Url]>::to_vec)
            .ok_or_else(|| {
                ClientError::Protocol(format!(
                    "session has no endpoints for realtime service `{}`",
                    config.realtime_service
                ))
            })?;
        let (events, _) = broadcast::channel(config.queue_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            session,
            config,
            endpoints,
            events,
            state,
        })
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.events.subscribe(),
        }
    }

    pub fn spawn(self) -> ListenerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = self.events.clone();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));

        ListenerHandle {
            events,
            state,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.reconnect);
        let mut tracker = SequenceTracker::new(self.config.replay_history);
        let mut cursor = 0usize;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let endpoint = self.endpoints[cursor % self.endpoints.len()].clone();
            self.publish_state(ConnectionState::Connecting {
                attempt: backoff.attempt() + 1,
                endpoint: endpoint.to_string(),
            });

            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.connect(&endpoint) => result,
            };

            match connected {
                Ok(socket) => {
                    backoff.reset();
                    info!(
                        endpoint = %endpoint,
                        last_seen = ?tracker.last_seen(),
                        "listener: connected"
                    );
                    self.publish_state(ConnectionState::Connected {
                        endpoint: endpoint.to_string(),
                    });

                    match self.drive(socket, &mut tracker, &mut shutdown).await {
                        DriveEnd::Shutdown => break,
                        DriveEnd::Dropped(reason) => {
                            warn!(endpoint = %endpoint, reason = %reason, "listener: connection dropped");
                            self.publish(ListenerEvent::Error(reason));
                        }
                    }
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "listener: connect failed");
                    self.publish(ListenerEvent::Error(err.to_string()));
                    cursor = cursor.wrapping_add(1);
                }
            }

            let delay = backoff.next_delay();
            self.publish_state(ConnectionState::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            });
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(delay) => {}
            }
        }

        info!(identity = %self.session.identity(), "listener: closed");
        self.publish_state(ConnectionState::Closed);
    }

    async fn connect(&self, endpoint: &Url) -> Result<WsStream, ClientError> {
        let url = realtime_url(endpoint, &self.session)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ClientError::Protocol(format!("invalid websocket request for {url}: {err}")))?;
        for (name, value) in self.session.credentials().identity_headers() {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| ClientError::Protocol(format!("invalid header name `{name}`: {err}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|err| ClientError::Protocol(format!("invalid `{name}` header: {err}")))?;
            request.headers_mut().insert(header, value);
        }

        debug!(url = %url, "listener: opening websocket");
        match timeout(self.config.connect_timeout, connect_async(request)).await {
            Ok(Ok((socket, _))) => Ok(socket),
            Ok(Err(err)) => Err(ClientError::Transport(format!(
                "failed to connect websocket {url}: {err}"
            ))),
            Err(_) => Err(ClientError::Transport(format!(
                "websocket connect to {url} timed out after {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    async fn drive(
        &self,
        socket: WsStream,
        tracker: &mut SequenceTracker,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DriveEnd {
        let key = self.session.session_key();
        let (mut writer, mut reader) = socket.split();
        let mut heartbeat = interval(self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = writer.send(Message::Close(None)).await;
                    let _ = writer.close().await;
                    return DriveEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    let frame = match encode_heartbeat(chrono::Utc::now().timestamp_millis()) {
                        Ok(frame) => frame,
                        Err(err) => {
                            error!(error = %err, "listener: cannot encode heartbeat");
                            continue;
                        }
                    };
                    if let Err(err) = writer.send(Message::Binary(frame)).await {
                        return DriveEnd::Dropped(format!("heartbeat send failed: {err}"));
                    }
                }
                message = reader.next() => match message {
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Some(reason) = self.handle_frame(key, &bytes, tracker, &mut failures) {
                            return DriveEnd::Dropped(reason);
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        self.deliver(tracker, decode_text(&text));
                    }
                    Some(Ok(Message::Close(_))) => {
                        return DriveEnd::Dropped("connection closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return DriveEnd::Dropped(format!("websocket receive failed: {err}")),
                    None => return DriveEnd::Dropped("websocket stream ended".to_string()),
                },
            }
        }
    }

    /// Returns a reason when the connection should be abandoned.
    fn handle_frame(
        &self,
        key: &KeyMaterial,
        bytes: &[u8],
        tracker: &mut SequenceTracker,
        failures: &mut u32,
    ) -> Option<String> {
        match decode_binary(key, bytes) {
            FrameOutcome::Events(events) => {
                *failures = 0;
                for event in events {
                    self.deliver(tracker, event);
                }
                None
            }
            FrameOutcome::Heartbeat => {
                *failures = 0;
                debug!("listener: heartbeat acknowledged");
                None
            }
            FrameOutcome::Undecodable { event, reason } => {
                *failures += 1;
                warn!(failures = *failures, reason = %reason, "listener: undecodable frame");
                self.deliver(tracker, event);
                (*failures >= self.config.decode_failure_threshold.max(1))
                    .then(|| format!("{} consecutive undecodable frames", *failures))
            }
        }
    }

    fn deliver(&self, tracker: &mut SequenceTracker, event: RemoteEvent) {
        match tracker.observe(&event) {
            SequenceVerdict::Replay => {
                let seq = event.seq().unwrap_or_default();
                debug!(seq, "listener: suppressing replayed event");
                self.publish(ListenerEvent::ReplaySuppressed { seq });
                return;
            }
            SequenceVerdict::Gap { expected, received } => {
                warn!(expected, received, "listener: sequence gap");
                self.publish(ListenerEvent::SequenceGap { expected, received });
            }
            SequenceVerdict::Reset { previous, received } => {
                warn!(previous, received, "listener: sequence numbering restarted");
                self.publish(ListenerEvent::SequenceReset { previous, received });
            }
            SequenceVerdict::Deliver => {}
        }
        self.publish(ListenerEvent::Remote(event));
    }

    fn publish_state(&self, state: ConnectionState) {
        debug!(state = ?state, "listener: state transition");
        self.state.send_replace(state.clone());
        self.publish(ListenerEvent::State(state));
    }

    fn publish(&self, event: ListenerEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

/// Websocket URL for `endpoint`: http(s) becomes ws(s) and the protocol
/// query fields are appended.
pub fn realtime_url(endpoint: &Url, session: &Session) -> Result<Url, ClientError> {
    let raw = endpoint.as_str();
    let ws_url = if raw.starts_with("https://") {
        raw.replacen("https://", "wss://", 1)
    } else if raw.starts_with("http://") {
        raw.replacen("http://", "ws://", 1)
    } else if raw.starts_with("ws://") || raw.starts_with("wss://") {
        raw.to_string()
    } else {
        return Err(ClientError::Protocol(format!(
            "realtime endpoint must be http(s) or ws(s): {raw}"
        )));
    };
    let mut url = Url::parse(&ws_url)
        .map_err(|err| ClientError::Protocol(format!("invalid realtime endpoint {ws_url}: {err}")))?;
    url.query_pairs_mut()
        .append_pair("protocol_version", &session.protocol_version().to_string())
        .append_pair("client_type", &session.client_type().to_string())
        .append_pair("t", &chrono::Utc::now().timestamp_millis().to_string());
    Ok(url)
}

/// Owner of a running listener. Dropping it stops the task without waiting.
pub struct ListenerHandle {
    events: broadcast::Sender<ListenerEvent>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.events.subscribe(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Stops the loop, closes the socket and waits for the task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(error = %err, "listener: task ended abnormally");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
#[path = "tests/listener_tests.rs"]
mod tests;
