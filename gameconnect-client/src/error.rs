use std::{io, time::Duration};

use gameconnect_core::CoreError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("no session token or user identity available")]
    AuthMissing,
    #[error("not connected to the chat server")]
    NotConnected,
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("invalid server url: {0}")]
    InvalidEndpoint(String),
}

impl ChatError {
    /// Short text suitable for showing to an end user.
    pub fn user_summary(&self) -> &'static str {
        match self {
            ChatError::AuthMissing => "Please sign in again",
            ChatError::NotConnected => "Offline, message not sent",
            ChatError::HandshakeTimeout(_) => "Chat server is not responding",
            ChatError::Transport(_) => "Connection to chat server lost",
            ChatError::Timeout(_) => "Chat server took too long to answer",
            ChatError::Decode(_) => "Received an unreadable reply",
            ChatError::InvalidEndpoint(_) => "Chat server address is misconfigured",
        }
    }
}

impl From<CoreError> for ChatError {
    fn from(err: CoreError) -> Self {
        ChatError::Decode(err.to_string())
    }
}

/// Failure reading one of the small JSON files (`client.json`, credentials).
#[derive(Debug)]
pub enum FileLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for FileLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            FileLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            FileLoadError::Read(e) => write!(f, "read failed: {e}"),
            FileLoadError::Parse(e) => write!(f, "parse failed: {e}"),
        }
    }
}

impl std::error::Error for FileLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FileLoadError::Metadata(e) => Some(e),
            FileLoadError::Read(e) => Some(e),
            FileLoadError::Parse(e) => Some(e),
            FileLoadError::TooLarge { .. } => None,
        }
    }
}
