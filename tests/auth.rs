//! Account and session lifecycle against an in-memory database.

use std::sync::Arc;

use legami::server::auth;
use legami::server::config::ServerConfig;
use legami::server::database::Database;
use legami::server::error::ApiError;

async fn setup() -> (Arc<Database>, ServerConfig) {
    let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
    db.migrate().await.unwrap();
    (db, ServerConfig::default())
}

#[tokio::test]
async fn register_issues_a_valid_session() {
    let (db, config) = setup().await;
    let session = auth::register(&db, "alice", "segreto", &config).await.unwrap();
    assert_eq!(session.username, "alice");
    assert_eq!(
        auth::validate_session(&db, &session.token).await.as_deref(),
        Some(session.user_id.as_str())
    );
}

#[tokio::test]
async fn duplicate_username_is_a_conflict() {
    let (db, config) = setup().await;
    auth::register(&db, "alice", "pw", &config).await.unwrap();
    let err = auth::register(&db, "alice", "pw2", &config).await.unwrap_err();
    assert_eq!(err, ApiError::Conflict("Username already used".into()));
}

#[tokio::test]
async fn login_checks_the_password() {
    let (db, config) = setup().await;
    auth::register(&db, "alice", "segreto", &config).await.unwrap();

    let err = auth::login(&db, "alice", "wrong", &config).await.unwrap_err();
    assert_eq!(err, ApiError::Unauthenticated);
    let err = auth::login(&db, "nobody", "pw", &config).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));

    let session = auth::login(&db, "alice", "segreto", &config).await.unwrap();
    assert!(auth::validate_session(&db, &session.token).await.is_some());
}

#[tokio::test]
async fn refresh_rotates_the_token() {
    let (db, config) = setup().await;
    let session = auth::register(&db, "alice", "pw", &config).await.unwrap();

    let fresh = auth::refresh_session(&db, &session.token, &config).await.unwrap();
    assert_ne!(fresh, session.token);
    assert!(auth::validate_session(&db, &session.token).await.is_none());
    assert!(auth::validate_session(&db, &fresh).await.is_some());
}

#[tokio::test]
async fn logout_invalidates_the_token() {
    let (db, config) = setup().await;
    let session = auth::register(&db, "alice", "pw", &config).await.unwrap();

    auth::logout(&db, &session.token).await.unwrap();
    assert!(auth::validate_session(&db, &session.token).await.is_none());
    let err = auth::logout(&db, &session.token).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn garbage_tokens_never_validate() {
    let (db, _config) = setup().await;
    assert!(auth::validate_session(&db, "not-a-token").await.is_none());
    assert!(auth::validate_session(&db, "").await.is_none());
}
