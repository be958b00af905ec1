#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::BoxFuture;
use gameconnect_client::{
    ChatError, ChatEvents, ClientConfig, ConnectionManager, ConnectionStatus, Connector,
    ConversationHandlers, Link, LinkEvent, Phase, StaticCredentials, UserRecord,
};
use gameconnect_core::{
    ChatMessage, ChatNotification, ChatSummary, Frame, ReadReceipt, StompCommand, decode_frame,
    encode_frame,
};
use tokio::sync::mpsc;
use url::Url;

pub const USER_ID: i64 = 5;
pub const TOKEN: &str = "token-abcdef-123456";

pub fn test_config() -> ClientConfig {
    ClientConfig {
        ws_url: "ws://broker.test/ws".to_owned(),
        ..ClientConfig::default()
    }
}

pub fn credentials() -> Arc<StaticCredentials> {
    Arc::new(StaticCredentials::new(
        TOKEN,
        UserRecord {
            id: USER_ID,
            username: "ana".to_owned(),
            email: "ana@example.com".to_owned(),
        },
    ))
}

struct LiveConnection {
    generation: u64,
    to_client: mpsc::UnboundedSender<LinkEvent>,
    /// (subscription id, destination)
    subscriptions: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    opens: usize,
    endpoints: Vec<Url>,
    fail_next_opens: usize,
    silent: bool,
    reject_connect: Option<String>,
    frames: Vec<Frame>,
    generation: u64,
    live: Option<LiveConnection>,
}

/// In-memory STOMP broker standing in for the WebSocket transport.
///
/// Answers CONNECT with CONNECTED (unless told otherwise), tracks SUBSCRIBE /
/// UNSUBSCRIBE per connection and records every frame the client sends.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manager(&self, config: ClientConfig) -> ConnectionManager {
        ConnectionManager::with_connector(config, Arc::new(self.clone()))
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn endpoints(&self) -> Vec<Url> {
        self.state.lock().unwrap().endpoints.clone()
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().unwrap().fail_next_opens = count;
    }

    /// Never answer CONNECT.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Answer CONNECT with an ERROR frame.
    pub fn reject_connect(&self, message: &str) {
        self.state.lock().unwrap().reject_connect = Some(message.to_owned());
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn frames_of(&self, command: StompCommand) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|frame| frame.command == command)
            .collect()
    }

    pub fn sends_to(&self, destination: &str) -> Vec<Frame> {
        self.frames_of(StompCommand::Send)
            .into_iter()
            .filter(|frame| frame.get("destination") == Some(destination))
            .collect()
    }

    pub fn subscribe_count(&self, destination: &str) -> usize {
        self.frames_of(StompCommand::Subscribe)
            .iter()
            .filter(|frame| frame.get("destination") == Some(destination))
            .count()
    }

    /// Destinations subscribed on the current connection, one entry per subscription.
    pub fn active_destinations(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut destinations: Vec<String> = state
            .live
            .as_ref()
            .map(|live| live.subscriptions.iter().map(|(_, d)| d.clone()).collect())
            .unwrap_or_default();
        destinations.sort();
        destinations
    }

    /// Delivers `body` to every subscription on `destination`; returns how many.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        let state = self.state.lock().unwrap();
        let Some(live) = state.live.as_ref() else {
            return 0;
        };

        let mut delivered = 0;
        for (id, subscribed) in &live.subscriptions {
            if subscribed == destination {
                let frame = Frame::message(id, destination, body);
                if live.to_client.send(LinkEvent::Text(encode_frame(&frame))).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn inject_raw(&self, text: &str) {
        let state = self.state.lock().unwrap();
        if let Some(live) = state.live.as_ref() {
            let _ = live.to_client.send(LinkEvent::Text(text.to_owned()));
        }
    }

    pub fn send_error_frame(&self, message: &str) {
        self.inject_raw(&encode_frame(&Frame::error(message)));
    }

    /// Abnormal close (1006) of the current connection.
    pub fn drop_connection(&self) {
        let live = self.state.lock().unwrap().live.take();
        if let Some(live) = live {
            let _ = live.to_client.send(LinkEvent::Closed {
                code: Some(1006),
                reason: "abnormal closure".to_owned(),
            });
        }
    }
}

impl Connector for MockBroker {
    fn open(&self, endpoint: Url) -> BoxFuture<'static, Result<Link, ChatError>> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        state.endpoints.push(endpoint);

        if state.fail_next_opens > 0 {
            state.fail_next_opens -= 1;
            return Box::pin(std::future::ready(Err(ChatError::Transport(
                "connection refused".to_owned(),
            ))));
        }

        let (client_tx, from_client) = mpsc::unbounded_channel::<String>();
        let (to_client, client_rx) = mpsc::unbounded_channel::<LinkEvent>();
        state.generation += 1;
        let generation = state.generation;
        state.live = Some(LiveConnection {
            generation,
            to_client,
            subscriptions: Vec::new(),
        });

        tokio::spawn(serve_connection(self.state.clone(), generation, from_client));
        Box::pin(std::future::ready(Ok(Link::new(client_tx, client_rx))))
    }
}

async fn serve_connection(
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
    mut from_client: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = from_client.recv().await {
        let Ok(Some(frame)) = decode_frame(&text) else {
            continue;
        };

        let mut state = state.lock().unwrap();
        state.frames.push(frame.clone());
        let silent = state.silent;
        let reject = state.reject_connect.clone();
        let Some(live) = state
            .live
            .as_mut()
            .filter(|live| live.generation == generation)
        else {
            continue;
        };

        match frame.command {
            StompCommand::Connect => {
                let reply = match reject {
                    Some(message) => Some(Frame::error(&message)),
                    None if silent => None,
                    None => Some(Frame::connected()),
                };
                if let Some(reply) = reply {
                    let _ = live.to_client.send(LinkEvent::Text(encode_frame(&reply)));
                }
            }
            StompCommand::Subscribe => {
                if let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination"))
                {
                    live.subscriptions
                        .push((id.to_owned(), destination.to_owned()));
                }
            }
            StompCommand::Unsubscribe => {
                if let Some(id) = frame.get("id") {
                    live.subscriptions.retain(|(existing, _)| existing != id);
                }
            }
            _ => {}
        }
    }
}

/// Polls `condition` while letting the manager and broker tasks run.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub async fn wait_for_phase(manager: &ConnectionManager, phase: Phase) -> ConnectionStatus {
    let mut status_rx = manager.watch_status();
    tokio::time::timeout(Duration::from_secs(300), async move {
        loop {
            let status = status_rx.borrow_and_update().clone();
            if status.phase == phase {
                return status;
            }
            status_rx.changed().await.expect("manager task alive");
        }
    })
    .await
    .expect("phase reached in time")
}

pub type StatusLog = Arc<Mutex<Vec<ConnectionStatus>>>;

pub fn record_statuses(manager: &ConnectionManager) -> StatusLog {
    let log: StatusLog = Arc::default();
    let sink = log.clone();
    manager.add_status_listener(move |status| sink.lock().unwrap().push(status.clone()));
    log
}

pub fn phases(log: &StatusLog) -> Vec<Phase> {
    log.lock().unwrap().iter().map(|s| s.phase).collect()
}

#[derive(Default)]
pub struct RecordingSink {
    pub chat_lists: Mutex<Vec<Vec<ChatSummary>>>,
    pub created: Mutex<Vec<ChatSummary>>,
    pub notifications: Mutex<Vec<ChatNotification>>,
    pub messages: Mutex<Vec<ChatMessage>>,
    pub receipts: Mutex<Vec<ReadReceipt>>,
    pub statuses: Mutex<Vec<ConnectionStatus>>,
}

impl ChatEvents for RecordingSink {
    fn on_chat_list(&self, chats: &[ChatSummary]) {
        self.chat_lists.lock().unwrap().push(chats.to_vec());
    }

    fn on_chat_created(&self, chat: &ChatSummary) {
        self.created.lock().unwrap().push(chat.clone());
    }

    fn on_notification(&self, notification: &ChatNotification) {
        self.notifications.lock().unwrap().push(notification.clone());
    }

    fn on_message(&self, message: &ChatMessage) {
        self.messages.lock().unwrap().push(message.clone());
    }

    fn on_read_receipt(&self, receipt: &ReadReceipt) {
        self.receipts.lock().unwrap().push(receipt.clone());
    }

    fn on_status(&self, status: &ConnectionStatus) {
        self.statuses.lock().unwrap().push(status.clone());
    }
}

/// Messages and receipts seen by one set of conversation handlers.
#[derive(Clone, Default)]
pub struct ConversationLog {
    pub messages: Arc<Mutex<Vec<ChatMessage>>>,
    pub receipts: Arc<Mutex<Vec<ReadReceipt>>>,
}

impl ConversationLog {
    pub fn handlers(&self) -> Arc<dyn gameconnect_client::ConversationEvents> {
        let messages = self.messages.clone();
        let receipts = self.receipts.clone();
        ConversationHandlers::new(
            move |message: &ChatMessage| messages.lock().unwrap().push(message.clone()),
            move |receipt: &ReadReceipt| receipts.lock().unwrap().push(receipt.clone()),
        )
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

pub fn message_json(chat_id: i64, message_id: i64, content: &str) -> String {
    serde_json::json!({
        "mensajeId": message_id,
        "chatId": chat_id,
        "usuarioId": 9,
        "username": "bruno",
        "contenido": content,
        "fechaEnvio": "2024-05-01 10:00:00",
        "tipo": "TEXTO",
        "esLeido": false
    })
    .to_string()
}

pub fn chat_json(chat_id: i64, name: &str) -> serde_json::Value {
    serde_json::json!({
        "chatId": chat_id,
        "nombreChat": name,
        "tipo": "GRUPAL",
        "fechaCreacion": "2024-05-01 09:00:00",
        "participantes": [
            {"usuarioId": 5, "username": "ana", "email": "ana@example.com"},
            {"usuarioId": 9, "username": "bruno"}
        ],
        "mensajesNoLeidos": 2
    })
}
