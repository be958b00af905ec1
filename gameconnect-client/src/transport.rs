use futures::{SinkExt, StreamExt, future::BoxFuture};
use gameconnect_core::{Frame, encode_frame};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};
use tracing::{debug, warn};
use url::Url;

use crate::error::ChatError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// One open transport connection: text frames out, events in.
///
/// Dropping the link closes the underlying connection.
#[derive(Debug)]
pub struct Link {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    pub fn send_text(&self, text: String) -> Result<(), ChatError> {
        self.outbound
            .send(text)
            .map_err(|_| ChatError::Transport("connection is closed".to_owned()))
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), ChatError> {
        self.send_text(encode_frame(frame))
    }

    pub async fn next_event(&mut self) -> LinkEvent {
        self.inbound.recv().await.unwrap_or(LinkEvent::Closed {
            code: None,
            reason: "transport task ended".to_owned(),
        })
    }
}

/// Opens transport connections. The WebSocket implementation is [`WsConnector`].
pub trait Connector: Send + Sync {
    fn open(&self, endpoint: Url) -> BoxFuture<'static, Result<Link, ChatError>>;
}

/// Builds `ws(s)://host/ws?token=<token>`; `http(s)` bases are mapped to `ws(s)`.
pub fn endpoint_url(base: &str, token: &str) -> Result<Url, ChatError> {
    let mut url = Url::parse(base).map_err(|err| ChatError::InvalidEndpoint(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ChatError::InvalidEndpoint(format!(
                "unsupported scheme {other:?}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::InvalidEndpoint(format!("cannot use scheme {scheme}")))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// `host` header value for the STOMP CONNECT frame.
pub fn endpoint_host(endpoint: &Url) -> String {
    match (endpoint.host_str(), endpoint.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => "localhost".to_owned(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, endpoint: Url) -> BoxFuture<'static, Result<Link, ChatError>> {
        Box::pin(async move {
            let (ws_stream, _) = connect_async(endpoint.as_str())
                .await
                .map_err(|err| ChatError::Transport(format!("connect failed: {err}")))?;

            let (write_half, read_half) = ws_stream.split();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<LinkEvent>();

            tokio::spawn(ws_send_task(write_half, outbound_rx));
            tokio::spawn(ws_receive_task(read_half, inbound_tx));

            Ok(Link::new(outbound_tx, inbound_rx))
        })
    }
}

async fn ws_send_task(
    mut ws_write: futures::stream::SplitSink<WsStream, Message>,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = outgoing_rx.recv().await {
        if let Err(err) = ws_write.send(Message::Text(text.into())).await {
            warn!("websocket send failed: {}", err);
            break;
        }
    }
    let _ = ws_write.close().await;
    debug!("websocket send task finished");
}

async fn ws_receive_task(
    mut ws_read: futures::stream::SplitStream<WsStream>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                let _ = events_tx.send(LinkEvent::Error(format!("read failed: {err}")));
                return;
            }
        };

        match message {
            Message::Text(text) => {
                if events_tx
                    .send(LinkEvent::Text(text.as_str().to_owned()))
                    .is_err()
                {
                    return;
                }
            }
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => {
                    if events_tx.send(LinkEvent::Text(text)).is_err() {
                        return;
                    }
                }
                Err(_) => warn!("dropping non-utf8 binary frame"),
            },
            Message::Close(frame) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                    None => (None, String::new()),
                };
                let _ = events_tx.send(LinkEvent::Closed { code, reason });
                return;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    let _ = events_tx.send(LinkEvent::Closed {
        code: None,
        reason: "stream ended".to_owned(),
    });
}
