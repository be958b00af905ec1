use std::sync::Arc;

use gameconnect_core::{ChatId, ChatMessage, ChatSummary, UserId};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::{
    config::ClientConfig,
    credentials::{CredentialProvider, resolve_session},
    driver::{Command, DebugInfo, Driver, HostEvent, Outbound, RequestKind},
    error::ChatError,
    events::{ChatEvents, ConnectionStatus, ConversationEvents, ListenerId, StatusListeners},
    transport::{Connector, WsConnector},
};

/// Handle to the connection manager task.
///
/// Cloning is cheap; every clone drives the same connection. The task shuts
/// down (and disconnects) once the last handle is dropped. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    listeners: StatusListeners,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let listeners = StatusListeners::default();

        let driver = Driver::new(
            config,
            connector,
            commands_rx,
            status_tx,
            listeners.clone(),
        );
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            status: status_rx,
            listeners,
        }
    }

    /// Opens the connection and establishes the global subscriptions.
    ///
    /// Returns immediately with `Ok` when already connected; `events` is then
    /// added to the registered sinks without touching the transport.
    pub async fn connect(
        &self,
        user_id: UserId,
        credentials: Arc<dyn CredentialProvider>,
        events: Option<Arc<dyn ChatEvents>>,
    ) -> Result<(), ChatError> {
        if !self.is_connected() {
            resolve_session(credentials.as_ref())?;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(Command::Connect {
            user_id,
            credentials,
            events,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| ChatError::NotConnected)?
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Status stream for async consumers; only changes are published.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Listeners stay registered across `disconnect()`.
    pub fn add_status_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Tracks the conversation and subscribes to its message and read-receipt
    /// topics. Registering the same id again replaces its handlers. While
    /// offline the conversation is subscribed on the next successful connect.
    pub fn subscribe_to_conversation(
        &self,
        chat_id: ChatId,
        handlers: Arc<dyn ConversationEvents>,
    ) {
        if self
            .command(Command::SubscribeConversation { chat_id, handlers })
            .is_err()
        {
            warn!(chat_id, "manager task is gone; conversation not tracked");
        }
    }

    pub fn unsubscribe_from_conversation(&self, chat_id: ChatId) {
        let _ = self.command(Command::UnsubscribeConversation { chat_id });
    }

    /// Fire-and-forget publish. Returns `false` without touching the transport
    /// when not connected; nothing is queued.
    pub fn send_message(&self, chat_id: ChatId, content: impl Into<String>) -> bool {
        self.publish(Outbound::Message {
            chat_id,
            content: content.into(),
        })
    }

    pub fn mark_as_read(&self, chat_id: ChatId) -> bool {
        self.publish(Outbound::MarkRead { chat_id })
    }

    pub async fn request_conversation_list(&self) -> Result<Vec<ChatSummary>, ChatError> {
        self.request(RequestKind::ChatList).await
    }

    pub async fn request_conversation_history(
        &self,
        chat_id: ChatId,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.request(RequestKind::History(chat_id)).await
    }

    pub async fn create_private_chat(&self, other_user_id: UserId) -> Result<ChatSummary, ChatError> {
        self.request(RequestKind::CreatePrivate(other_user_id)).await
    }

    pub async fn create_group_chat(
        &self,
        name: impl Into<String>,
        participant_ids: Vec<UserId>,
    ) -> Result<ChatSummary, ChatError> {
        self.request(RequestKind::CreateGroup {
            name: name.into(),
            participant_ids,
        })
        .await
    }

    /// Immediate reconnect attempt outside the backoff schedule. Returns
    /// whether the manager is connected afterwards.
    pub async fn reconnect(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command(Command::Reconnect {
                reason: "manual",
                reply: Some(reply_tx),
            })
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Host signal (network back, app foregrounded). Triggers a reconnect
    /// attempt when a session exists and the manager is not connected.
    pub fn notify_host_event(&self, event: HostEvent) {
        if self.is_connected() {
            return;
        }
        let reason = match event {
            HostEvent::NetworkOnline => "network online",
            HostEvent::Foreground => "foreground",
        };
        debug!(reason, "host event");
        let _ = self.command(Command::Reconnect {
            reason,
            reply: None,
        });
    }

    /// Tears everything down. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.command(Command::Disconnect { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
    }

    pub async fn debug_info(&self) -> Option<DebugInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(Command::DebugInfo { reply: reply_tx }).ok()?;
        reply_rx.await.ok()
    }

    fn publish(&self, outbound: Outbound) -> bool {
        if !self.is_connected() {
            debug!("not connected; publish refused");
            return false;
        }
        self.command(Command::Publish(outbound)).is_ok()
    }

    async fn request<T: DeserializeOwned>(&self, kind: RequestKind) -> Result<T, ChatError> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(Command::Request {
            kind,
            reply: reply_tx,
        })?;
        let value = reply_rx.await.map_err(|_| ChatError::NotConnected)??;
        serde_json::from_value(value).map_err(|err| ChatError::Decode(err.to_string()))
    }

    fn command(&self, command: Command) -> Result<(), ChatError> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::NotConnected)
    }
}
