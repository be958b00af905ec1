//! The manager task: sole owner of the connection, its subscription table and
//! every callback registration. The public handle talks to it over a channel.

use std::{
    collections::{BTreeMap, HashMap},
    future::pending,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use gameconnect_core::{
    ChatHistoryCommand, ChatId, ChatMessage, ChatNotification, ChatSummary,
    CreateGroupChatCommand, CreatePrivateChatCommand, Frame, ListChatsCommand, MESSAGE_KIND_TEXT,
    MarkReadCommand, Ping, ReadReceipt, SendMessageCommand, StompCommand, UserId, decode_frame,
    decode_payload, dest, encode_payload,
};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until, timeout},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::ClientConfig,
    credentials::{CredentialProvider, resolve_session},
    error::ChatError,
    events::{
        ChatEvents, ConnectionStatus, ConversationEvents, Phase, StatusListeners, isolate,
        same_sink,
    },
    transport::{Connector, Link, LinkEvent, endpoint_host, endpoint_url},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    NetworkOnline,
    Foreground,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub phase: Phase,
    pub reconnect_attempt: u32,
    pub has_session: bool,
    pub conversations: Vec<ChatId>,
    /// Destinations with a live transport subscription, sorted.
    pub subscriptions: Vec<String>,
    pub pending_requests: usize,
}

pub(crate) enum Outbound {
    Message { chat_id: ChatId, content: String },
    MarkRead { chat_id: ChatId },
}

pub(crate) enum RequestKind {
    ChatList,
    History(ChatId),
    CreatePrivate(UserId),
    CreateGroup {
        name: String,
        participant_ids: Vec<UserId>,
    },
}

impl RequestKind {
    fn reply_topic(&self) -> String {
        match self {
            RequestKind::ChatList => dest::QUEUE_CHATS.to_owned(),
            RequestKind::History(chat_id) => dest::conversation_history(*chat_id),
            RequestKind::CreatePrivate(_) => dest::QUEUE_CHAT_CREATED.to_owned(),
            RequestKind::CreateGroup { .. } => dest::QUEUE_GROUP_CREATED.to_owned(),
        }
    }

    fn command(&self, user_id: UserId) -> Result<(&'static str, String), ChatError> {
        let command = match self {
            RequestKind::ChatList => (
                dest::LIST_CHATS,
                encode_payload(&ListChatsCommand { user_id })?,
            ),
            RequestKind::History(chat_id) => (
                dest::CHAT_HISTORY,
                encode_payload(&ChatHistoryCommand {
                    chat_id: *chat_id,
                    user_id,
                })?,
            ),
            RequestKind::CreatePrivate(other_user_id) => (
                dest::CREATE_PRIVATE_CHAT,
                encode_payload(&CreatePrivateChatCommand {
                    user_id,
                    other_user_id: *other_user_id,
                })?,
            ),
            RequestKind::CreateGroup {
                name,
                participant_ids,
            } => (
                dest::CREATE_GROUP_CHAT,
                encode_payload(&CreateGroupChatCommand {
                    name: name.clone(),
                    participant_ids: participant_ids.clone(),
                })?,
            ),
        };
        Ok(command)
    }
}

pub(crate) type ReplySender = oneshot::Sender<Result<serde_json::Value, ChatError>>;

pub(crate) enum Command {
    Connect {
        user_id: UserId,
        credentials: Arc<dyn CredentialProvider>,
        events: Option<Arc<dyn ChatEvents>>,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    SubscribeConversation {
        chat_id: ChatId,
        handlers: Arc<dyn ConversationEvents>,
    },
    UnsubscribeConversation {
        chat_id: ChatId,
    },
    Publish(Outbound),
    Request {
        kind: RequestKind,
        reply: ReplySender,
    },
    Reconnect {
        reason: &'static str,
        reply: Option<oneshot::Sender<bool>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    DebugInfo {
        reply: oneshot::Sender<DebugInfo>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    ChatList,
    ChatCreated,
    Notification,
    GlobalMessage,
    ConversationMessages(ChatId),
    ConversationReads(ChatId),
    Reply,
}

struct Subscription {
    route: Route,
    destination: String,
}

struct LiveLink {
    link: Link,
    subscriptions: HashMap<String, Subscription>,
    conversation_subs: HashMap<ChatId, Vec<String>>,
}

struct SessionContext {
    user_id: UserId,
    credentials: Arc<dyn CredentialProvider>,
}

struct PendingRequest {
    deadline: Instant,
    reply: ReplySender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeOrigin {
    Connect,
    Reconnect,
}

/// Caller waiting on the outcome of the handshake in flight.
enum Waiter {
    Connect(oneshot::Sender<Result<(), ChatError>>),
    Reconnect(oneshot::Sender<bool>),
}

impl Waiter {
    fn resolve(self, outcome: &Result<(), ChatError>) {
        match self {
            Waiter::Connect(reply) => {
                let _ = reply.send(outcome.clone());
            }
            Waiter::Reconnect(reply) => {
                let _ = reply.send(outcome.is_ok());
            }
        }
    }
}

/// Transport open plus STOMP handshake, polled by the run loop. Dropping it
/// abandons the attempt.
struct PendingHandshake {
    origin: HandshakeOrigin,
    future: BoxFuture<'static, Result<Link, ChatError>>,
    waiters: Vec<Waiter>,
}

pub(crate) struct Driver {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    listeners: StatusListeners,
    session: Option<SessionContext>,
    sinks: Vec<Arc<dyn ChatEvents>>,
    conversations: BTreeMap<ChatId, Arc<dyn ConversationEvents>>,
    live: Option<LiveLink>,
    handshake: Option<PendingHandshake>,
    pending: HashMap<String, PendingRequest>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    next_subscription: u64,
}

impl Driver {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        commands: mpsc::UnboundedReceiver<Command>,
        status_tx: watch::Sender<ConnectionStatus>,
        listeners: StatusListeners,
    ) -> Self {
        Self {
            config,
            connector,
            commands,
            status: ConnectionStatus::default(),
            status_tx,
            listeners,
            session: None,
            sinks: Vec::new(),
            conversations: BTreeMap::new(),
            live: None,
            handshake: None,
            pending: HashMap::new(),
            reconnect_at: None,
            heartbeat: None,
            next_subscription: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let reconnect_at = self.reconnect_at;
            let request_deadline = self.pending.values().map(|p| p.deadline).min();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = next_link_event(self.live.as_mut()) => self.handle_link_event(event),
                result = next_handshake_result(self.handshake.as_mut()) => {
                    self.handshake_finished(result);
                }
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.attempt_reconnect(None);
                }
                _ = tick_opt(self.heartbeat.as_mut()) => self.send_heartbeat(),
                _ = sleep_until_opt(request_deadline) => self.expire_requests(),
            }
        }

        debug!("all manager handles dropped; shutting down");
        self.disconnect();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                user_id,
                credentials,
                events,
                reply,
            } => self.connect(user_id, credentials, events, reply),
            Command::SubscribeConversation { chat_id, handlers } => {
                self.subscribe_conversation(chat_id, handlers);
            }
            Command::UnsubscribeConversation { chat_id } => {
                self.unsubscribe_conversation(chat_id);
            }
            Command::Publish(outbound) => self.publish_outbound(outbound),
            Command::Request { kind, reply } => self.start_request(kind, reply),
            Command::Reconnect { reason, reply } => self.reconnect_now(reason, reply),
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::DebugInfo { reply } => {
                let _ = reply.send(self.debug_info());
            }
        }
    }

    fn connect(
        &mut self,
        user_id: UserId,
        credentials: Arc<dyn CredentialProvider>,
        events: Option<Arc<dyn ChatEvents>>,
        reply: oneshot::Sender<Result<(), ChatError>>,
    ) {
        if let Some(events) = events {
            self.register_sink(events);
        }

        if self.status.phase == Phase::Connected {
            debug!("already connected; reusing connection");
            let _ = reply.send(Ok(()));
            return;
        }

        self.reconnect_at = None;
        self.session = Some(SessionContext {
            user_id,
            credentials,
        });
        self.set_status(|status| {
            status.phase = Phase::Connecting;
            status.reconnect_attempt = 0;
            status.last_error = None;
        });
        self.begin_handshake(HandshakeOrigin::Connect, Some(Waiter::Connect(reply)));
    }

    /// Starts a handshake, replacing any attempt already in flight. Callers
    /// waiting on the replaced attempt wait on the new one instead.
    fn begin_handshake(&mut self, origin: HandshakeOrigin, waiter: Option<Waiter>) {
        let mut waiters = match self.handshake.take() {
            Some(superseded) => {
                debug!("abandoning handshake in flight");
                superseded.waiters
            }
            None => Vec::new(),
        };
        waiters.extend(waiter);

        match self.open_handshake() {
            Ok(future) => {
                self.handshake = Some(PendingHandshake {
                    origin,
                    future,
                    waiters,
                });
            }
            Err(err) => self.handshake_failed(origin, waiters, err),
        }
    }

    fn open_handshake(&self) -> Result<BoxFuture<'static, Result<Link, ChatError>>, ChatError> {
        let Some(context) = self.session.as_ref() else {
            return Err(ChatError::AuthMissing);
        };
        let session = resolve_session(context.credentials.as_ref())?;
        let endpoint = endpoint_url(&self.config.ws_url, &session.token)?;

        let connector = self.connector.clone();
        let connect_timeout = self.config.connect_timeout();
        Ok(Box::pin(async move {
            match timeout(connect_timeout, handshake(connector, endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(ChatError::HandshakeTimeout(connect_timeout)),
            }
        }))
    }

    fn handshake_finished(&mut self, result: Result<Link, ChatError>) {
        let Some(finished) = self.handshake.take() else {
            return;
        };
        match result {
            Ok(link) => {
                self.install_link(link);
                if finished.origin == HandshakeOrigin::Reconnect {
                    info!("reconnected");
                }
                for waiter in finished.waiters {
                    waiter.resolve(&Ok(()));
                }
            }
            Err(err) => self.handshake_failed(finished.origin, finished.waiters, err),
        }
    }

    fn handshake_failed(
        &mut self,
        origin: HandshakeOrigin,
        waiters: Vec<Waiter>,
        err: ChatError,
    ) {
        let outcome: Result<(), ChatError> = Err(err.clone());
        match origin {
            HandshakeOrigin::Connect => {
                let user_id = self.session.as_ref().map(|s| s.user_id);
                error!(?user_id, "connect failed: {err}");
                self.set_status(|status| {
                    status.phase = Phase::Failed;
                    status.last_error = Some(err);
                });
            }
            HandshakeOrigin::Reconnect => {
                warn!(
                    attempt = self.status.reconnect_attempt,
                    "reconnect attempt failed: {err}"
                );
                self.schedule_reconnect(err);
            }
        }
        for waiter in waiters {
            waiter.resolve(&outcome);
        }
    }

    /// Takes over a completed handshake and restores every subscription
    /// before reporting `Connected`.
    fn install_link(&mut self, link: Link) {
        self.live = Some(LiveLink {
            link,
            subscriptions: HashMap::new(),
            conversation_subs: HashMap::new(),
        });

        self.subscribe(dest::QUEUE_CHATS.to_owned(), Route::ChatList);
        self.subscribe(dest::QUEUE_CHAT_CREATED.to_owned(), Route::ChatCreated);
        self.subscribe(dest::QUEUE_NOTIFICATIONS.to_owned(), Route::Notification);
        self.subscribe(dest::QUEUE_GLOBAL_MESSAGES.to_owned(), Route::GlobalMessage);

        let chat_ids: Vec<ChatId> = self.conversations.keys().copied().collect();
        for chat_id in chat_ids {
            self.subscribe_conversation_topics(chat_id);
        }

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        info!(
            conversations = self.conversations.len(),
            "connected; subscriptions established"
        );
        self.set_status(|status| {
            status.phase = Phase::Connected;
            status.reconnect_attempt = 0;
            status.last_error = None;
        });
    }

    fn register_sink(&mut self, events: Arc<dyn ChatEvents>) {
        if !self.sinks.iter().any(|existing| same_sink(existing, &events)) {
            self.sinks.push(events);
        }
    }

    fn subscribe(&mut self, destination: String, route: Route) -> Option<String> {
        let live = self.live.as_mut()?;
        self.next_subscription += 1;
        let id = format!("sub-{}", self.next_subscription);

        if let Err(err) = live.link.send_frame(&Frame::subscribe(&id, &destination)) {
            warn!(destination = %destination, "subscribe failed: {err}");
            return None;
        }

        debug!(destination = %destination, subscription = %id, "subscribed");
        live.subscriptions
            .insert(id.clone(), Subscription { route, destination });
        Some(id)
    }

    fn unsubscribe(&mut self, id: &str) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if let Some(subscription) = live.subscriptions.remove(id) {
            debug!(destination = %subscription.destination, subscription = %id, "unsubscribed");
            if let Err(err) = live.link.send_frame(&Frame::unsubscribe(id)) {
                warn!(subscription = %id, "unsubscribe failed: {err}");
            }
        }
    }

    fn subscribe_conversation_topics(&mut self, chat_id: ChatId) {
        let ids: Vec<String> = [
            self.subscribe(
                dest::conversation_messages(chat_id),
                Route::ConversationMessages(chat_id),
            ),
            self.subscribe(
                dest::conversation_reads(chat_id),
                Route::ConversationReads(chat_id),
            ),
        ]
        .into_iter()
        .flatten()
        .collect();

        if let Some(live) = self.live.as_mut() {
            live.conversation_subs.insert(chat_id, ids);
        }
    }

    fn subscribe_conversation(&mut self, chat_id: ChatId, handlers: Arc<dyn ConversationEvents>) {
        self.conversations.insert(chat_id, handlers);

        let Some(live) = self.live.as_ref() else {
            debug!(chat_id, "offline; conversation will be subscribed on reconnect");
            return;
        };
        if live.conversation_subs.contains_key(&chat_id) {
            debug!(chat_id, "conversation handlers replaced");
            return;
        }
        self.subscribe_conversation_topics(chat_id);
    }

    fn unsubscribe_conversation(&mut self, chat_id: ChatId) {
        self.conversations.remove(&chat_id);
        let ids = self
            .live
            .as_mut()
            .and_then(|live| live.conversation_subs.remove(&chat_id))
            .unwrap_or_default();
        for id in ids {
            self.unsubscribe(&id);
        }
    }

    fn publish(&mut self, destination: &str, body: String) -> bool {
        let Some(live) = self.live.as_ref() else {
            warn!(destination, "not connected; dropping publish");
            return false;
        };
        match live.link.send_frame(&Frame::send(destination, body)) {
            Ok(()) => true,
            Err(err) => {
                warn!(destination, "publish failed: {err}");
                false
            }
        }
    }

    fn publish_outbound(&mut self, outbound: Outbound) {
        let Some(user_id) = self.session.as_ref().map(|s| s.user_id) else {
            warn!("no session; dropping outbound command");
            return;
        };

        let encoded = match outbound {
            Outbound::Message { chat_id, content } => encode_payload(&SendMessageCommand {
                chat_id,
                user_id,
                content,
                kind: MESSAGE_KIND_TEXT.to_owned(),
            })
            .map(|body| (dest::SEND_MESSAGE, body)),
            Outbound::MarkRead { chat_id } => {
                encode_payload(&MarkReadCommand { chat_id, user_id })
                    .map(|body| (dest::MARK_READ, body))
            }
        };

        match encoded {
            Ok((destination, body)) => {
                self.publish(destination, body);
            }
            Err(err) => warn!("failed to encode outbound command: {err}"),
        }
    }

    fn refresh_chat_list(&mut self) {
        if !self.config.refresh_chats_on_activity {
            return;
        }
        let Some(user_id) = self.session.as_ref().map(|s| s.user_id) else {
            return;
        };
        match encode_payload(&ListChatsCommand { user_id }) {
            Ok(body) => {
                self.publish(dest::LIST_CHATS, body);
            }
            Err(err) => warn!("failed to encode chat list request: {err}"),
        }
    }

    fn start_request(&mut self, kind: RequestKind, reply: ReplySender) {
        let user_id = match (&self.live, &self.session) {
            (Some(_), Some(session)) => session.user_id,
            _ => {
                let _ = reply.send(Err(ChatError::NotConnected));
                return;
            }
        };

        let (destination, body) = match kind.command(user_id) {
            Ok(command) => command,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };

        let Some(id) = self.subscribe(kind.reply_topic(), Route::Reply) else {
            let _ = reply.send(Err(ChatError::NotConnected));
            return;
        };

        if !self.publish(destination, body) {
            self.unsubscribe(&id);
            let _ = reply.send(Err(ChatError::NotConnected));
            return;
        }

        let deadline = Instant::now() + self.config.request_timeout();
        self.pending.insert(id, PendingRequest { deadline, reply });
    }

    fn resolve_request(&mut self, id: &str, body: &str) {
        let value = match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) => value,
            Err(err) => {
                warn!(subscription = %id, "dropping undecodable reply: {err}");
                return;
            }
        };
        self.unsubscribe(id);
        if let Some(request) = self.pending.remove(id) {
            let _ = request.reply.send(Ok(value));
        }
    }

    fn expire_requests(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let request_timeout = self.config.request_timeout();
        for id in expired {
            if let Some(request) = self.pending.remove(&id) {
                warn!(subscription = %id, "request timed out after {:?}", request_timeout);
                self.unsubscribe(&id);
                let _ = request.reply.send(Err(ChatError::Timeout(request_timeout)));
            }
        }
    }

    fn fail_pending(&mut self, err: &ChatError) {
        for (_, request) in self.pending.drain() {
            let _ = request.reply.send(Err(err.clone()));
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Text(text) => self.handle_text(&text),
            LinkEvent::Closed { code, reason } => {
                if code == Some(1006) {
                    warn!("connection closed abnormally; possible network or auth problem");
                }
                let detail = match code {
                    Some(code) => format!("connection closed (code {code}) {reason}"),
                    None => format!("connection closed {reason}"),
                };
                self.connection_lost(ChatError::Transport(detail.trim_end().to_owned()));
            }
            LinkEvent::Error(err) => self.connection_lost(ChatError::Transport(err)),
        }
    }

    fn handle_text(&mut self, text: &str) {
        let frame = match decode_frame(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                warn!("dropping undecodable frame: {err}");
                return;
            }
        };

        match frame.command {
            StompCommand::Message => self.route_message(frame),
            StompCommand::Error => {
                let summary = frame.error_summary();
                error!("broker error: {summary}");
                self.connection_lost(ChatError::Transport(summary));
            }
            other => debug!(command = other.as_str(), "ignoring frame"),
        }
    }

    fn route_message(&mut self, frame: Frame) {
        let Some(id) = frame.get("subscription").map(str::to_owned) else {
            warn!("dropping MESSAGE without subscription header");
            return;
        };
        let Some((route, destination)) = self.live.as_ref().and_then(|live| {
            live.subscriptions
                .get(&id)
                .map(|s| (s.route, s.destination.clone()))
        }) else {
            debug!(subscription = %id, "dropping MESSAGE for unknown subscription");
            return;
        };
        let body = frame.body;

        match route {
            Route::Reply => self.resolve_request(&id, &body),
            Route::ChatList => {
                if let Some(chats) = decode_body::<Vec<ChatSummary>>(&destination, &body) {
                    self.emit("on_chat_list", |sink| sink.on_chat_list(&chats));
                }
            }
            Route::ChatCreated => {
                if let Some(chat) = decode_body::<ChatSummary>(&destination, &body) {
                    info!(chat_id = chat.chat_id, "new chat");
                    self.emit("on_chat_created", |sink| sink.on_chat_created(&chat));
                    self.refresh_chat_list();
                }
            }
            Route::Notification => {
                if let Some(notification) = decode_body::<ChatNotification>(&destination, &body) {
                    self.emit("on_notification", |sink| sink.on_notification(&notification));
                    self.refresh_chat_list();
                }
            }
            Route::GlobalMessage => {
                if let Some(message) = decode_body::<ChatMessage>(&destination, &body) {
                    self.emit("on_message", |sink| sink.on_message(&message));
                }
            }
            Route::ConversationMessages(chat_id) => {
                if let Some(message) = decode_body::<ChatMessage>(&destination, &body) {
                    if let Some(handlers) = self.conversations.get(&chat_id) {
                        isolate("conversation on_message", || handlers.on_message(&message));
                    }
                    self.emit("on_message", |sink| sink.on_message(&message));
                    self.refresh_chat_list();
                }
            }
            Route::ConversationReads(chat_id) => {
                if let Some(receipt) = decode_body::<ReadReceipt>(&destination, &body) {
                    if let Some(handlers) = self.conversations.get(&chat_id) {
                        isolate("conversation on_read_receipt", || {
                            handlers.on_read_receipt(&receipt)
                        });
                    }
                    self.emit("on_read_receipt", |sink| sink.on_read_receipt(&receipt));
                }
            }
        }
    }

    fn emit(&self, callback: &'static str, deliver: impl Fn(&dyn ChatEvents)) {
        for sink in &self.sinks {
            isolate(callback, || deliver(sink.as_ref()));
        }
    }

    fn drop_link(&mut self) {
        self.heartbeat = None;
        self.live = None;
    }

    fn connection_lost(&mut self, err: ChatError) {
        if self.live.is_none() {
            return;
        }
        warn!("connection lost: {err}");
        self.drop_link();
        self.fail_pending(&ChatError::NotConnected);

        if self.session.is_none() {
            self.set_status(|status| {
                status.phase = Phase::Disconnected;
                status.last_error = Some(err);
            });
            return;
        }
        self.schedule_reconnect(err);
    }

    fn schedule_reconnect(&mut self, err: ChatError) {
        let attempt = self.status.reconnect_attempt + 1;
        let max_attempts = self.config.max_reconnect_attempts;
        if attempt > max_attempts {
            error!(
                max_attempts,
                "could not reconnect after {max_attempts} attempts; giving up"
            );
            self.reconnect_at = None;
            self.set_status(|status| {
                status.phase = Phase::Failed;
                status.last_error = Some(err);
            });
            return;
        }

        let delay = self.config.reconnect_delay(attempt);
        info!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_status(|status| {
            status.phase = Phase::Reconnecting;
            status.reconnect_attempt = attempt;
            status.last_error = Some(err);
        });
    }

    fn attempt_reconnect(&mut self, waiter: Option<Waiter>) {
        info!(
            attempt = self.status.reconnect_attempt,
            max_attempts = self.config.max_reconnect_attempts,
            "reconnecting"
        );
        self.begin_handshake(HandshakeOrigin::Reconnect, waiter);
    }

    fn reconnect_now(&mut self, reason: &'static str, reply: Option<oneshot::Sender<bool>>) {
        let waiter = reply.map(Waiter::Reconnect);
        if self.status.phase == Phase::Connected {
            if let Some(waiter) = waiter {
                waiter.resolve(&Ok(()));
            }
            return;
        }
        if self.session.is_none() {
            debug!(reason, "no session to resume");
            if let Some(waiter) = waiter {
                waiter.resolve(&Err(ChatError::AuthMissing));
            }
            return;
        }
        if let Some(in_flight) = self.handshake.as_mut() {
            debug!(reason, "handshake already in flight");
            in_flight.waiters.extend(waiter);
            return;
        }

        info!(reason, "reconnecting immediately");
        self.reconnect_at = None;
        if self.status.phase != Phase::Reconnecting {
            self.set_status(|status| {
                status.phase = Phase::Reconnecting;
                status.reconnect_attempt = 1;
            });
        }
        self.attempt_reconnect(waiter);
    }

    fn send_heartbeat(&mut self) {
        let body = match encode_payload(&Ping {
            timestamp: now_unix_ms(),
        }) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to encode heartbeat: {err}");
                return;
            }
        };
        if !self.publish(dest::PING, body) {
            warn!("heartbeat not sent");
        }
    }

    fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.heartbeat = None;
        let cancelled = self.handshake.take();
        if cancelled.is_some() {
            info!("cancelling handshake in flight");
        }
        if let Some(live) = self.live.take() {
            info!("disconnecting");
            if let Err(err) = live.link.send_frame(&Frame::disconnect()) {
                debug!("DISCONNECT frame not sent: {err}");
            }
        }
        self.fail_pending(&ChatError::NotConnected);
        self.sinks.clear();
        self.conversations.clear();
        self.session = None;
        self.set_status(|status| *status = ConnectionStatus::default());

        for waiter in cancelled.into_iter().flat_map(|h| h.waiters) {
            waiter.resolve(&Err(ChatError::NotConnected));
        }
    }

    fn debug_info(&self) -> DebugInfo {
        let mut subscriptions: Vec<String> = self
            .live
            .as_ref()
            .map(|live| {
                live.subscriptions
                    .values()
                    .map(|s| s.destination.clone())
                    .collect()
            })
            .unwrap_or_default();
        subscriptions.sort();

        DebugInfo {
            phase: self.status.phase,
            reconnect_attempt: self.status.reconnect_attempt,
            has_session: self.session.is_some(),
            conversations: self.conversations.keys().copied().collect(),
            subscriptions,
            pending_requests: self.pending.len(),
        }
    }

    fn set_status(&mut self, update: impl FnOnce(&mut ConnectionStatus)) {
        let mut next = self.status.clone();
        update(&mut next);
        if next == self.status {
            return;
        }

        debug!(
            from = self.status.phase.label(),
            to = next.phase.label(),
            attempt = next.reconnect_attempt,
            "connection status changed"
        );
        self.status = next;
        self.status_tx.send_replace(self.status.clone());
        self.listeners.notify(&self.status);
        self.emit("on_status", |sink| sink.on_status(&self.status));
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Covers the task ending without a teardown, e.g. a runtime shutdown.
        if self.status.phase != Phase::Disconnected {
            error!(
                phase = self.status.phase.label(),
                "manager task stopped while active"
            );
            self.status_tx.send_replace(ConnectionStatus {
                last_error: Some(ChatError::NotConnected),
                ..ConnectionStatus::default()
            });
        }
    }
}

async fn handshake(connector: Arc<dyn Connector>, endpoint: Url) -> Result<Link, ChatError> {
    let host = endpoint_host(&endpoint);
    let mut link = connector.open(endpoint).await?;
    link.send_frame(&Frame::connect(&host))?;

    loop {
        match link.next_event().await {
            LinkEvent::Text(text) => match decode_frame(&text) {
                Ok(Some(frame)) if frame.command == StompCommand::Connected => return Ok(link),
                Ok(Some(frame)) if frame.command == StompCommand::Error => {
                    return Err(ChatError::Transport(frame.error_summary()));
                }
                Ok(_) => continue,
                Err(err) => warn!("undecodable frame during handshake: {err}"),
            },
            LinkEvent::Closed { reason, .. } => {
                return Err(ChatError::Transport(format!(
                    "connection closed during handshake {reason}"
                )
                .trim_end()
                .to_owned()));
            }
            LinkEvent::Error(err) => return Err(ChatError::Transport(err)),
        }
    }
}

fn decode_body<T: DeserializeOwned>(destination: &str, body: &str) -> Option<T> {
    match decode_payload::<T>(body) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(destination, "dropping frame with malformed body: {err}");
            None
        }
    }
}

async fn next_link_event(live: Option<&mut LiveLink>) -> LinkEvent {
    match live {
        Some(live) => live.link.next_event().await,
        None => pending().await,
    }
}

async fn next_handshake_result(
    in_flight: Option<&mut PendingHandshake>,
) -> Result<Link, ChatError> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.future).await,
        None => pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

async fn tick_opt(heartbeat: Option<&mut Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending().await,
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
