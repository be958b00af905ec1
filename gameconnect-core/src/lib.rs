use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const STOMP_ACCEPT_VERSION: &str = "1.2,1.1";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const MESSAGE_KIND_TEXT: &str = "TEXTO";

pub type ChatId = i64;
pub type UserId = i64;
pub type MessageId = i64;

/// Broker destinations used by the chat backend.
///
/// `/app/...` destinations are commands published by the client, `/user/queue/...`
/// are per-user queues and `/topic/...` are per-conversation broadcasts.
pub mod dest {
    use super::ChatId;

    pub const SEND_MESSAGE: &str = "/app/chat.enviarMensaje";
    pub const MARK_READ: &str = "/app/chat.marcarLeido";
    pub const CREATE_PRIVATE_CHAT: &str = "/app/chat.crearPrivado";
    pub const CREATE_GROUP_CHAT: &str = "/app/chat.crearGrupal";
    pub const LIST_CHATS: &str = "/app/chat.obtenerChats";
    pub const CHAT_HISTORY: &str = "/app/chat.obtenerMensajes";
    pub const PING: &str = "/app/ping";

    pub const QUEUE_CHATS: &str = "/user/queue/chats";
    pub const QUEUE_CHAT_CREATED: &str = "/user/queue/chat.nuevo";
    pub const QUEUE_NOTIFICATIONS: &str = "/user/queue/notificaciones";
    pub const QUEUE_GLOBAL_MESSAGES: &str = "/user/queue/mensajes.globales";
    pub const QUEUE_GROUP_CREATED: &str = "/user/queue/chat.group.created";

    pub fn conversation_messages(chat_id: ChatId) -> String {
        format!("/topic/chat.{chat_id}.mensajes")
    }

    pub fn conversation_reads(chat_id: ChatId) -> String {
        format!("/topic/chat.{chat_id}.lectura")
    }

    pub fn conversation_history(chat_id: ChatId) -> String {
        format!("/user/queue/chat.{chat_id}.mensajes.historial")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    #[serde(rename = "usuarioId")]
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(rename = "mensajeId", default)]
    pub message_id: Option<MessageId>,
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
    #[serde(rename = "usuarioId")]
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(rename = "contenido")]
    pub content: String,
    #[serde(rename = "fechaEnvio", default)]
    pub sent_at: Option<String>,
    #[serde(rename = "tipo", default)]
    pub kind: Option<String>,
    #[serde(rename = "esLeido", default)]
    pub read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatSummary {
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
    #[serde(rename = "nombreChat", default)]
    pub name: Option<String>,
    #[serde(rename = "tipo", default)]
    pub kind: Option<String>,
    #[serde(rename = "fechaCreacion", default)]
    pub created_at: Option<String>,
    #[serde(rename = "participantes", default)]
    pub participants: Vec<UserSummary>,
    #[serde(rename = "ultimoMensaje", default)]
    pub last_message: Option<ChatMessage>,
    #[serde(rename = "mensajesNoLeidos", default)]
    pub unread_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
    #[serde(rename = "usuarioId")]
    pub reader_id: UserId,
    #[serde(rename = "usuarioNombre", default)]
    pub reader_name: Option<String>,
    #[serde(rename = "mensajesLeidosIds", default)]
    pub message_ids: Vec<MessageId>,
    #[serde(rename = "fechaMarcado", default)]
    pub read_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatNotification {
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
    #[serde(rename = "remitenteId")]
    pub sender_id: UserId,
    #[serde(rename = "remitenteNombre", default)]
    pub sender_name: String,
    #[serde(rename = "contenidoPreview", default)]
    pub preview: String,
    #[serde(rename = "tipoMensaje", default)]
    pub kind: Option<String>,
    #[serde(rename = "fechaEnvio", default)]
    pub sent_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageCommand {
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
    #[serde(rename = "usuarioId")]
    pub user_id: UserId,
    #[serde(rename = "contenido")]
    pub content: String,
    #[serde(rename = "tipo")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkReadCommand {
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
    #[serde(rename = "usuarioId")]
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListChatsCommand {
    #[serde(rename = "usuarioId")]
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatHistoryCommand {
    #[serde(rename = "chatId")]
    pub chat_id: ChatId,
    #[serde(rename = "usuarioId")]
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatePrivateChatCommand {
    #[serde(rename = "usuario1Id")]
    pub user_id: UserId,
    #[serde(rename = "usuario2Id")]
    pub other_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateGroupChatCommand {
    #[serde(rename = "nombreChat")]
    pub name: String,
    #[serde(rename = "participantesIds")]
    pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl StompCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Send => "SEND",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
            StompCommand::Disconnect => "DISCONNECT",
        }
    }

    pub fn parse(line: &str) -> Result<Self, CoreError> {
        match line {
            "CONNECT" | "STOMP" => Ok(StompCommand::Connect),
            "CONNECTED" => Ok(StompCommand::Connected),
            "SEND" => Ok(StompCommand::Send),
            "SUBSCRIBE" => Ok(StompCommand::Subscribe),
            "UNSUBSCRIBE" => Ok(StompCommand::Unsubscribe),
            "MESSAGE" => Ok(StompCommand::Message),
            "RECEIPT" => Ok(StompCommand::Receipt),
            "ERROR" => Ok(StompCommand::Error),
            "DISCONNECT" => Ok(StompCommand::Disconnect),
            other => Err(CoreError::UnknownCommand(other.to_owned())),
        }
    }

    // CONNECT and CONNECTED headers are never escaped (STOMP 1.2).
    fn escapes_headers(self) -> bool {
        !matches!(self, StompCommand::Connect | StompCommand::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins when a header is repeated.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str) -> Self {
        Frame::new(StompCommand::Connect)
            .header("accept-version", STOMP_ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", "0,0")
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(StompCommand::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(StompCommand::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(StompCommand::Send)
            .header("destination", destination)
            .header("content-type", CONTENT_TYPE_JSON)
            .with_body(body)
    }

    pub fn disconnect() -> Self {
        Frame::new(StompCommand::Disconnect)
    }

    pub fn connected() -> Self {
        Frame::new(StompCommand::Connected).header("version", "1.2")
    }

    pub fn message(subscription: &str, destination: &str, body: impl Into<String>) -> Self {
        Frame::new(StompCommand::Message)
            .header("subscription", subscription)
            .header("destination", destination)
            .header("content-type", CONTENT_TYPE_JSON)
            .with_body(body)
    }

    pub fn error(message: &str) -> Self {
        Frame::new(StompCommand::Error).header("message", message)
    }

    /// Human-readable summary of an `ERROR` frame.
    pub fn error_summary(&self) -> String {
        match (self.get("message"), self.body.trim()) {
            (Some(message), "") => message.to_owned(),
            (Some(message), body) => format!("{message}: {body}"),
            (None, "") => "broker error".to_owned(),
            (None, body) => body.to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("unknown STOMP command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("frame is missing its NUL terminator")]
    MissingNul,
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(64 + frame.body.len());
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in &frame.headers {
        if escape {
            push_escaped(&mut out, name);
            out.push(':');
            push_escaped(&mut out, value);
        } else {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        out.push('\n');
    }
    if !frame.body.is_empty() && frame.get("content-length").is_none() {
        out.push_str("content-length:");
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decodes one text frame. Returns `Ok(None)` for a heart-beat (EOL only).
pub fn decode_frame(data: &str) -> Result<Option<Frame>, CoreError> {
    if data.len() > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let data = data.trim_start_matches(['\r', '\n']);
    if data.is_empty() {
        return Ok(None);
    }

    let mut rest = data;
    let command_line = next_line(&mut rest).ok_or(CoreError::MissingNul)?;
    let command = StompCommand::parse(command_line)?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let line = next_line(&mut rest).ok_or(CoreError::MissingNul)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CoreError::MalformedHeader(line.to_owned()))?;
        if escape {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| CoreError::InvalidContentLength(value.clone()))
        })
        .transpose()?;

    let body = match content_length {
        Some(len) => {
            let body = rest
                .get(..len)
                .ok_or_else(|| CoreError::InvalidContentLength(len.to_string()))?;
            if !rest[len..].starts_with('\0') {
                return Err(CoreError::MissingNul);
            }
            body
        }
        None => {
            let end = rest.find('\0').ok_or(CoreError::MissingNul)?;
            &rest[..end]
        }
    };

    Ok(Some(Frame {
        command,
        headers,
        body: body.to_owned(),
    }))
}

pub fn encode_payload<T: Serialize>(payload: &T) -> Result<String, CoreError> {
    serde_json::to_string(payload).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn decode_payload<T: DeserializeOwned>(body: &str) -> Result<T, CoreError> {
    serde_json::from_str(body).map_err(|err| CoreError::Serialization(err.to_string()))
}

fn next_line<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let end = rest.find('\n')?;
    let line = &rest[..end];
    *rest = &rest[end + 1..];
    Some(line.strip_suffix('\r').unwrap_or(line))
}

fn push_escaped(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(value: &str) -> Result<String, CoreError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(CoreError::InvalidEscape(value.to_owned())),
        }
    }
    Ok(out)
}
