use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use log::{info, warn};
use rand::RngCore;
use sqlx::Row;

use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::error::{ApiError, ApiResult};

/// A freshly issued session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub username: String,
    pub token: String,
}

fn hash_password(password: &str, salt_length: u32) -> ApiResult<String> {
    let mut salt_bytes = vec![0u8; salt_length as usize];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| ApiError::Internal(format!("salt encoding failed: {}", e)))?;
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {}", e)))
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

fn generate_session_token() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    format!("{}-{:x}", uuid, md5::compute(random))
}

fn looks_like_unique_violation(e: &sqlx::Error) -> bool {
    e.to_string().to_uppercase().contains("UNIQUE")
}

pub async fn register(db: &Database, username: &str, password: &str, config: &ServerConfig) -> ApiResult<Session> {
    let username = username.trim();
    if username.is_empty() || username.len() > 24 {
        return Err(ApiError::InvalidInput("Username must be 1-24 characters".into()));
    }
    if password.is_empty() {
        return Err(ApiError::InvalidInput("Password must not be empty".into()));
    }
    info!("[AUTH] Register attempt: {}", username);

    let user_id = uuid::Uuid::new_v4().to_string();
    let password_hash = hash_password(password, config.argon2_salt_length)?;
    let token = generate_session_token();
    let now = chrono::Utc::now().timestamp();
    let expires = now + 60 * 60 * 24 * config.session_expiry_days as i64;

    let mut tx = db.pool.begin().await.map_err(ApiError::from)?;
    let res = sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?, ?, ?)")
        .bind(&user_id)
        .bind(username)
        .bind(now)
        .execute(&mut *tx)
        .await;
    if let Err(e) = res {
        if looks_like_unique_violation(&e) {
            return Err(ApiError::Conflict("Username already used".into()));
        }
        return Err(ApiError::from(e));
    }
    sqlx::query("INSERT INTO auth (user_id, password_hash) VALUES (?, ?)")
        .bind(&user_id)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::from)?;
    sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&user_id)
        .bind(&token)
        .bind(now)
        .bind(expires)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::from)?;
    tx.commit().await.map_err(ApiError::from)?;

    info!("[AUTH] Registered user {} (id={})", username, user_id);
    Ok(Session { user_id, username: username.to_string(), token })
}

pub async fn login(db: &Database, username: &str, password: &str, config: &ServerConfig) -> ApiResult<Session> {
    info!("[AUTH] Login attempt: {}", username);
    let row = sqlx::query(
        "SELECT users.id, password_hash FROM users JOIN auth ON users.id = auth.user_id WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(&db.pool)
    .await
    .map_err(ApiError::from)?;

    let Some(row) = row else {
        return Err(ApiError::NotFound("User not found".into()));
    };
    let user_id: String = row.get("id");
    let password_hash: String = row.get("password_hash");
    if !verify_password(&password_hash, password) {
        warn!("[AUTH] Login failed for {}: wrong password", username);
        return Err(ApiError::Unauthenticated);
    }

    let token = generate_session_token();
    let now = chrono::Utc::now().timestamp();
    let expires = now + 60 * 60 * 24 * config.session_expiry_days as i64;
    sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&user_id)
        .bind(&token)
        .bind(now)
        .bind(expires)
        .execute(&db.pool)
        .await
        .map_err(ApiError::from)?;

    info!("[AUTH] Login success for {} (id={})", username, user_id);
    Ok(Session { user_id, username: username.to_string(), token })
}

/// The opaque verify-token-to-identity call every connection and command runs
/// through. `None` covers missing, unknown and expired tokens alike.
pub async fn validate_session(db: &Database, session_token: &str) -> Option<String> {
    let now = chrono::Utc::now().timestamp();
    let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?")
        .bind(session_token)
        .bind(now)
        .fetch_optional(&db.pool)
        .await
        .ok()??;
    Some(row.get("user_id"))
}

/// Rotates a valid token: the old one dies, a fresh one with a full expiry
/// window replaces it.
pub async fn refresh_session(db: &Database, session_token: &str, config: &ServerConfig) -> ApiResult<String> {
    let Some(user_id) = validate_session(db, session_token).await else {
        return Err(ApiError::Unauthenticated);
    };
    let token = generate_session_token();
    let now = chrono::Utc::now().timestamp();
    let expires = now + 60 * 60 * 24 * config.session_expiry_days as i64;
    let mut tx = db.pool.begin().await.map_err(ApiError::from)?;
    sqlx::query("DELETE FROM sessions WHERE session_token = ?")
        .bind(session_token)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::from)?;
    sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&user_id)
        .bind(&token)
        .bind(now)
        .bind(expires)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::from)?;
    tx.commit().await.map_err(ApiError::from)?;
    info!("[AUTH] Rotated session for user {}", user_id);
    Ok(token)
}

pub async fn logout(db: &Database, session_token: &str) -> ApiResult<()> {
    let res = sqlx::query("DELETE FROM sessions WHERE session_token = ?")
        .bind(session_token)
        .execute(&db.pool)
        .await
        .map_err(ApiError::from)?;
    if res.rows_affected() == 0 {
        return Err(ApiError::NotFound("Session not found".into()));
    }
    info!("[AUTH] Logout completed");
    Ok(())
}

/// Removes expired sessions. Idempotent, safe to run periodically.
pub async fn cleanup_expired_sessions(db: &Database) {
    let now = chrono::Utc::now().timestamp();
    match sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(&db.pool)
        .await
    {
        Ok(res) => {
            if res.rows_affected() > 0 {
                info!("[AUTH] Cleaned up {} expired sessions", res.rows_affected());
            }
        }
        Err(e) => warn!("[AUTH] Failed to cleanup sessions: {}", e),
    }
}
