use std::{
    collections::BTreeSet,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{ClientFrame, EventTag, ServerEvent},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
    config::{ClientSettings, ReconnectPolicy},
    credentials::CredentialStore,
    dispatcher::EventDispatcher,
    error::ClientError,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handshake = BoxFuture<'static, Result<Socket, RealtimeError>>;

const EVENT_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Authenticated,
    Closing,
}

impl ConnectionState {
    /// A socket exists or is being opened; `connect` is a no-op.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Authenticated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("no access token, staying disconnected")]
    NoAccessToken,
    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),
    #[error("websocket handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("no traffic within {0:?} of a ping")]
    LivenessTimeout(Duration),
}

/// Attempt counter for [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` have been
    /// scheduled since the last reset.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(
            self.policy
                .delay_for(self.attempt)
                .saturating_add(jitter(self.policy.jitter)),
        )
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::from(elapsed.subsec_nanos()))
        .unwrap_or_default();
    let bound = u64::try_from(max.as_millis()).unwrap_or(u64::MAX).max(1);
    Duration::from_millis(seed % bound)
}

enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    JoinRoom(ConversationId),
    LeaveRoom(ConversationId),
    Transient(ClientFrame),
    PendingRooms(oneshot::Sender<Vec<ConversationId>>),
}

/// Owns the realtime channel. All socket work happens on one spawned task;
/// the methods here only enqueue commands, so none of them block on I/O
/// except [`ConnectionManager::disconnect`], which waits for the close.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    dispatcher: EventDispatcher,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawns the connection task. Must be called inside a tokio runtime.
    pub fn start(
        settings: &ClientSettings,
        credentials: CredentialStore,
        dispatcher: EventDispatcher,
    ) -> Result<Self, ClientError> {
        let endpoint =
            Url::parse(&settings.realtime_url).map_err(|source| ClientError::InvalidUrl {
                field: "realtime_url",
                value: settings.realtime_url.clone(),
                source,
            })?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(ClientError::UnsupportedScheme(endpoint.scheme().to_string()));
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            endpoint,
            token_param: settings.realtime_token_param.clone(),
            credentials,
            dispatcher: dispatcher.clone(),
            state_tx,
            events: events.clone(),
            backoff: Backoff::new(settings.reconnect),
            connect_timeout: settings.connect_timeout,
            ping_interval: settings.ping_interval,
            pong_timeout: settings.pong_timeout,
            pending_rooms: BTreeSet::new(),
            handshake: None,
            socket: None,
            reconnect_at: None,
            probe_sent_at: None,
        };
        let task = tokio::spawn(actor.run(command_rx));

        Ok(Self {
            commands,
            state,
            events,
            dispatcher,
            task,
        })
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("realtime: connection task is gone, command dropped");
        }
    }

    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Closes the socket, cancels any pending reconnect and forgets every
    /// room and event subscription.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        self.command(Command::Disconnect(ack));
        let _ = done.await;
    }

    pub fn join_room(&self, conversation_id: impl Into<ConversationId>) {
        self.command(Command::JoinRoom(conversation_id.into()));
    }

    pub fn leave_room(&self, conversation_id: impl Into<ConversationId>) {
        self.command(Command::LeaveRoom(conversation_id.into()));
    }

    pub fn send_typing(&self, conversation_id: impl Into<ConversationId>, active: bool) {
        self.command(Command::Transient(ClientFrame::typing(
            conversation_id.into(),
            active,
        )));
    }

    pub fn mark_read(
        &self,
        message_id: impl Into<MessageId>,
        conversation_id: impl Into<ConversationId>,
    ) {
        self.command(Command::Transient(ClientFrame::MessageRead {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
        }));
    }

    pub fn mark_delivered(
        &self,
        message_id: impl Into<MessageId>,
        conversation_id: impl Into<ConversationId>,
    ) {
        self.command(Command::Transient(ClientFrame::MessageDelivered {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
        }));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Rooms that will be re-joined on every successful authentication.
    pub async fn pending_rooms(&self) -> Vec<ConversationId> {
        let (reply, rooms) = oneshot::channel();
        self.command(Command::PendingRooms(reply));
        rooms.await.unwrap_or_default()
    }

    /// Stops the connection task after closing the socket.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(err) = task.await {
            warn!(error = %err, "realtime: connection task ended abnormally");
        }
    }
}

struct Actor {
    endpoint: Url,
    token_param: String,
    credentials: CredentialStore,
    dispatcher: EventDispatcher,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    backoff: Backoff,
    connect_timeout: Duration,
    ping_interval: Duration,
    pong_timeout: Duration,
    pending_rooms: BTreeSet<ConversationId>,
    handshake: Option<Handshake>,
    socket: Option<Socket>,
    reconnect_at: Option<Instant>,
    probe_sent_at: Option<Instant>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let period = self.ping_interval.max(MIN_PING_INTERVAL);
        let mut liveness = time::interval_at(Instant::now() + period, period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let probe_deadline = self.probe_sent_at.map(|sent| sent + self.pong_timeout);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                result = next_handshake(&mut self.handshake) => self.on_handshake(result),
                inbound = next_inbound(&mut self.socket) => self.on_inbound(inbound).await,
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.open_socket().await;
                }
                _ = wait_until(probe_deadline) => {
                    warn!(error = %RealtimeError::LivenessTimeout(self.pong_timeout), "realtime: peer unresponsive");
                    self.on_closed();
                }
                _ = liveness.tick() => self.probe().await,
            }
        }

        debug!("realtime: command channel closed, stopping");
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.state().is_active() {
                    debug!(state = ?self.state(), "realtime: already connecting or connected");
                    return;
                }
                self.reconnect_at = None;
                self.backoff.reset();
                self.open_socket().await;
            }
            Command::Disconnect(ack) => {
                self.teardown().await;
                let _ = ack.send(());
            }
            Command::JoinRoom(room) => {
                self.pending_rooms.insert(room.clone());
                if self.state() == ConnectionState::Authenticated {
                    self.send_frame(&ClientFrame::JoinConversation {
                        conversation_id: room,
                    })
                    .await;
                } else {
                    debug!(%room, "realtime: join queued until authenticated");
                }
            }
            Command::LeaveRoom(room) => {
                self.pending_rooms.remove(&room);
                if matches!(
                    self.state(),
                    ConnectionState::Open | ConnectionState::Authenticated
                ) {
                    self.send_frame(&ClientFrame::LeaveConversation {
                        conversation_id: room,
                    })
                    .await;
                }
            }
            Command::Transient(frame) => {
                if self.state() == ConnectionState::Authenticated {
                    self.send_frame(&frame).await;
                } else {
                    debug!(tag = frame.tag(), state = ?self.state(), "realtime: not authenticated, frame dropped");
                }
            }
            Command::PendingRooms(reply) => {
                let _ = reply.send(self.pending_rooms.iter().cloned().collect());
            }
        }
    }

    async fn open_socket(&mut self) {
        let Some(token) = self.credentials.access_token().await else {
            warn!(error = %RealtimeError::NoAccessToken, "realtime: cannot connect");
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair(&self.token_param, &token);

        info!(
            endpoint = %self.endpoint,
            attempt = self.backoff.attempt(),
            "realtime: connecting"
        );
        self.set_state(ConnectionState::Connecting);
        let limit = self.connect_timeout;
        let handshake = connect_async(String::from(url));
        self.handshake = Some(
            async move {
                match time::timeout(limit, handshake).await {
                    Ok(Ok((socket, _response))) => Ok(socket),
                    Ok(Err(err)) => Err(RealtimeError::Handshake(err)),
                    Err(_elapsed) => Err(RealtimeError::HandshakeTimeout(limit)),
                }
            }
            .boxed(),
        );
    }

    fn on_handshake(&mut self, result: Result<Socket, RealtimeError>) {
        match result {
            Ok(socket) => {
                self.socket = Some(socket);
                self.probe_sent_at = None;
                // Resets on open, not on auth: a peer that closes right after
                // the upgrade is retried at the base delay without exhausting.
                self.backoff.reset();
                info!("realtime: socket open, awaiting auth");
                self.set_state(ConnectionState::Open);
            }
            Err(err) => {
                warn!(error = %err, "realtime: connect failed");
                self.on_closed();
            }
        }
    }

    async fn on_inbound(&mut self, inbound: Option<Result<Message, tungstenite::Error>>) {
        match inbound {
            Some(Ok(message)) => {
                self.probe_sent_at = None;
                match message {
                    Message::Text(text) => self.on_frame(&text).await,
                    Message::Binary(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => self.on_frame(&text).await,
                        Err(_) => warn!("realtime: dropping non-utf8 binary frame"),
                    },
                    Message::Close(frame) => debug!(?frame, "realtime: close frame received"),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            Some(Err(err)) => {
                warn!(error = %err, "realtime: transport error");
                self.on_closed();
            }
            None => {
                info!("realtime: connection closed by peer");
                self.on_closed();
            }
        }
    }

    async fn on_frame(&mut self, text: &str) {
        let event = match ServerEvent::decode(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "realtime: dropping malformed frame");
                return;
            }
        };

        if event.tag == EventTag::AuthSuccess && self.state() == ConnectionState::Open {
            info!(rooms = self.pending_rooms.len(), "realtime: authenticated");
            self.set_state(ConnectionState::Authenticated);
            for room in self.pending_rooms.clone() {
                self.send_frame(&ClientFrame::JoinConversation {
                    conversation_id: room,
                })
                .await;
            }
        }

        let handlers = self.dispatcher.dispatch(&event);
        trace!(tag = %event.tag, handlers, "realtime: event dispatched");
    }

    async fn send_frame(&mut self, frame: &ClientFrame) {
        let Some(socket) = self.socket.as_mut() else {
            debug!(tag = frame.tag(), "realtime: no socket, frame dropped");
            return;
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(tag = frame.tag(), error = %err, "realtime: frame encode failed");
                return;
            }
        };
        if let Err(err) = socket.send(Message::Text(text)).await {
            warn!(tag = frame.tag(), error = %err, "realtime: send failed");
        } else {
            trace!(tag = frame.tag(), "realtime: frame sent");
        }
    }

    async fn probe(&mut self) {
        if self.probe_sent_at.is_some() {
            return;
        }
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        match socket.send(Message::Ping(Vec::new())).await {
            Ok(()) => self.probe_sent_at = Some(Instant::now()),
            Err(err) => debug!(error = %err, "realtime: ping failed"),
        }
    }

    /// Close path for every cause except an explicit disconnect.
    fn on_closed(&mut self) {
        self.socket = None;
        self.handshake = None;
        self.probe_sent_at = None;
        self.set_state(ConnectionState::Disconnected);

        match self.backoff.next_delay() {
            Some(delay) => {
                let attempt = self.backoff.attempt();
                info!(attempt, ?delay, "realtime: reconnect scheduled");
                self.reconnect_at = Some(Instant::now() + delay);
                let _ = self
                    .events
                    .send(ConnectionEvent::ReconnectScheduled { attempt, delay });
            }
            None => {
                let attempts = self.backoff.attempt();
                warn!(
                    error = %RealtimeError::ReconnectExhausted { attempts },
                    "realtime: waiting for an explicit connect"
                );
                self.reconnect_at = None;
                let _ = self
                    .events
                    .send(ConnectionEvent::ReconnectExhausted { attempts });
            }
        }
    }

    async fn teardown(&mut self) {
        self.reconnect_at = None;
        self.handshake = None;
        self.probe_sent_at = None;
        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Closing);
        }
        if let Some(mut socket) = self.socket.take() {
            match time::timeout(CLOSE_TIMEOUT, socket.close(None)).await {
                Ok(Ok(())) => debug!("realtime: close handshake sent"),
                Ok(Err(err)) => debug!(error = %err, "realtime: close failed"),
                Err(_) => debug!("realtime: close timed out"),
            }
        }
        self.dispatcher.clear();
        self.pending_rooms.clear();
        self.backoff.reset();
        self.set_state(ConnectionState::Disconnected);
        info!("realtime: disconnected");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "realtime: state changed");
            let _ = self.events.send(ConnectionEvent::StateChanged(next));
        }
    }
}

async fn next_handshake(handshake: &mut Option<Handshake>) -> Result<Socket, RealtimeError> {
    match handshake.as_mut() {
        Some(pending) => {
            let result = pending.await;
            *handshake = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn next_inbound(socket: &mut Option<Socket>) -> Option<Result<Message, tungstenite::Error>> {
    match socket.as_mut() {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
