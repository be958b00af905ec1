//! Realtime chat client for the GameConnect backend: one persistent STOMP
//! connection with global and per-conversation subscriptions, publish and
//! request operations, and automatic reconnection.

pub mod config;
pub mod credentials;
mod driver;
pub mod error;
pub mod events;
mod manager;
pub mod transport;

pub use config::ClientConfig;
pub use credentials::{
    CredentialProvider, FileCredentialStore, Session, StaticCredentials, UserRecord,
    validate_token,
};
pub use driver::{DebugInfo, HostEvent};
pub use error::{ChatError, FileLoadError};
pub use events::{
    ChatEvents, ConnectionStatus, ConversationEvents, ConversationHandlers, ListenerId, Phase,
};
pub use manager::ConnectionManager;
pub use transport::{Connector, Link, LinkEvent, WsConnector};
