use std::{
    fs, io,
    path::{Path, PathBuf},
};

use gameconnect_core::UserId;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    config::read_capped,
    error::{ChatError, FileLoadError},
};

pub const MIN_TOKEN_LEN: usize = 10;
pub const MAX_CREDENTIALS_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    #[serde(rename = "usuarioId")]
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user: UserRecord,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

/// Source of the current session, read by value whenever a connection is opened.
pub trait CredentialProvider: Send + Sync {
    fn session(&self) -> Option<Session>;
}

pub fn validate_token(token: &str) -> bool {
    token.trim().len() >= MIN_TOKEN_LEN
}

pub fn resolve_session(provider: &dyn CredentialProvider) -> Result<Session, ChatError> {
    let session = provider.session().ok_or(ChatError::AuthMissing)?;
    if !validate_token(&session.token) {
        return Err(ChatError::AuthMissing);
    }
    Ok(session)
}

#[derive(Debug, Clone)]
pub struct StaticCredentials {
    session: Option<Session>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>, user: UserRecord) -> Self {
        Self {
            session: Some(Session {
                token: token.into(),
                user,
            }),
        }
    }

    pub fn empty() -> Self {
        Self { session: None }
    }
}

impl CredentialProvider for StaticCredentials {
    fn session(&self) -> Option<Session> {
        self.session.clone()
    }
}

/// On-disk layout: `{"token": "...", "usuario": {"usuarioId": 1, ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(rename = "usuario", default)]
    pub user: Option<UserRecord>,
}

#[derive(Debug)]
pub enum CredentialsSaveError {
    Serialize(serde_json::Error),
    WriteTmp(io::Error),
    Rename(io::Error),
}

impl std::fmt::Display for CredentialsSaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialsSaveError::Serialize(e) => write!(f, "serialize failed: {e}"),
            CredentialsSaveError::WriteTmp(e) => write!(f, "tmp write failed: {e}"),
            CredentialsSaveError::Rename(e) => write!(f, "rename failed: {e}"),
        }
    }
}

impl std::error::Error for CredentialsSaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CredentialsSaveError::Serialize(e) => Some(e),
            CredentialsSaveError::WriteTmp(e) => Some(e),
            CredentialsSaveError::Rename(e) => Some(e),
        }
    }
}

pub fn load_credentials_from_path(path: &Path) -> Result<StoredCredentials, FileLoadError> {
    let data = read_capped(path, MAX_CREDENTIALS_BYTES)?;
    serde_json::from_str::<StoredCredentials>(&data).map_err(FileLoadError::Parse)
}

pub fn save_credentials_to_path(
    path: &Path,
    credentials: &StoredCredentials,
) -> Result<(), CredentialsSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload =
        serde_json::to_string_pretty(credentials).map_err(CredentialsSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(CredentialsSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(CredentialsSaveError::Rename)?;
    Ok(())
}

/// Credential file re-read on every lookup so a refreshed token is picked up on reconnect.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialProvider for FileCredentialStore {
    fn session(&self) -> Option<Session> {
        let stored = match load_credentials_from_path(&self.path) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(path = %self.path.display(), "credentials unavailable: {err}");
                return None;
            }
        };

        Some(Session {
            token: stored.token?,
            user: stored.user?,
        })
    }
}
