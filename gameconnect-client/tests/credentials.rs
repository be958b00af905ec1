use std::io::Write;

use gameconnect_client::{
    CredentialProvider, FileCredentialStore, FileLoadError, UserRecord,
    credentials::{
        MAX_CREDENTIALS_BYTES, StoredCredentials, load_credentials_from_path,
        save_credentials_to_path,
    },
    validate_token,
};

fn user() -> UserRecord {
    UserRecord {
        id: 5,
        username: "ana".to_owned(),
        email: "ana@example.com".to_owned(),
    }
}

#[test]
fn saved_session_is_read_back_by_file_store() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("credentials.json");

    let stored = StoredCredentials {
        token: Some("token-abcdef-123456".to_owned()),
        user: Some(user()),
    };
    save_credentials_to_path(&path, &stored).expect("save credentials");
    assert!(!path.with_extension("json.tmp").exists());

    let store = FileCredentialStore::new(&path);
    let session = store.session().expect("session from file");
    assert_eq!(session.token, "token-abcdef-123456");
    assert_eq!(session.user, user());

    // A refreshed token is picked up without rebuilding the store.
    let refreshed = StoredCredentials {
        token: Some("token-refreshed-987654".to_owned()),
        ..stored
    };
    save_credentials_to_path(&path, &refreshed).expect("overwrite credentials");
    assert_eq!(
        store.session().map(|s| s.token).as_deref(),
        Some("token-refreshed-987654")
    );
}

#[test]
fn file_layout_uses_backend_field_names() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("credentials.json");
    std::fs::write(
        &path,
        r#"{"token": "token-abcdef-123456", "usuario": {"usuarioId": 12, "username": "bruno"}}"#,
    )
    .expect("write credentials.json");

    let stored = load_credentials_from_path(&path).expect("load credentials");
    let user = stored.user.expect("user record");
    assert_eq!(user.id, 12);
    assert_eq!(user.username, "bruno");
    assert!(user.email.is_empty());
}

#[test]
fn incomplete_or_missing_file_yields_no_session() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("credentials.json");

    let store = FileCredentialStore::new(&path);
    assert!(store.session().is_none());

    std::fs::write(&path, r#"{"token": "token-abcdef-123456"}"#).expect("write token only");
    assert!(store.session().is_none());

    std::fs::write(&path, "not json").expect("write garbage");
    assert!(store.session().is_none());
}

#[test]
fn load_credentials_rejects_oversized_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("credentials.json");

    let mut file = std::fs::File::create(&path).expect("create credentials.json");
    file.write_all(&vec![b'a'; (MAX_CREDENTIALS_BYTES as usize) + 1024])
        .expect("write oversized credentials.json");
    drop(file);

    let err = load_credentials_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
}

#[test]
fn load_credentials_reports_missing_and_malformed_files() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("credentials.json");

    let err = load_credentials_from_path(&path).expect_err("missing file should error");
    assert!(matches!(err, FileLoadError::Metadata(_)), "{err:?}");

    std::fs::write(&path, "{\"token\": 12}").expect("write credentials.json");
    let err = load_credentials_from_path(&path).expect_err("numeric token should error");
    assert!(matches!(err, FileLoadError::Parse(_)), "{err:?}");
    assert!(err.to_string().contains("parse failed"), "{err}");
}

#[test]
fn validate_token_requires_minimum_length() {
    assert!(!validate_token(""));
    assert!(!validate_token("short"));
    assert!(!validate_token("   padded   "));
    assert!(validate_token("0123456789"));
}

#[test]
fn session_debug_output_hides_token() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("credentials.json");
    let stored = StoredCredentials {
        token: Some("secret-token-value".to_owned()),
        user: Some(user()),
    };
    save_credentials_to_path(&path, &stored).expect("save credentials");

    let session = FileCredentialStore::new(&path)
        .session()
        .expect("session from file");
    let rendered = format!("{session:?}");
    assert!(!rendered.contains("secret-token-value"), "{rendered}");
}
