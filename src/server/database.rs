use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use log::info;

/// Errors out of the transactional member-add. The 2-member cap for direct
/// chats is re-checked inside the same transaction as the insert, so two
/// racing adds cannot both land.
#[derive(Debug)]
pub enum MemberAddError {
    ChatMissing,
    AlreadyMember,
    CapExceeded,
    Db(sqlx::Error),
}

impl From<sqlx::Error> for MemberAddError {
    fn from(e: sqlx::Error) -> Self {
        MemberAddError::Db(e)
    }
}

pub const UNASSIGNED_CHAT_NAME: &str = "not_assigned";

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        // Make sure the parent directory exists for file-backed databases.
        let file_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        let file_path = file_path.split('?').next().unwrap_or(file_path);
        if file_path != ":memory:" && !file_path.is_empty() {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // A pooled :memory: database is one database per connection; keep a
        // single connection so every caller sees the same data.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        info!("[DB] Connected to {}", database_url);
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                created_at INTEGER NOT NULL,
                avatar TEXT
            );
        "#).execute(&self.pool).await?;

        // Auth
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS auth (
                user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                password_hash TEXT NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Sessions
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                session_token TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Friends lists: exactly one per user, created lazily on the first
        // accepted friendship.
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS friends_lists (
                owner_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE
            );
        "#).execute(&self.pool).await?;

        // Friends: directed edges, one per direction.
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS friends (
                id TEXT PRIMARY KEY,
                friends_list_id TEXT NOT NULL REFERENCES friends_lists(owner_id) ON DELETE CASCADE,
                friend_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                UNIQUE (friends_list_id, friend_id)
            );
        "#).execute(&self.pool).await?;

        // Friend requests: deleted on resolution, never archived.
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS friend_requests (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                receiver_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                UNIQUE (sender_id, receiver_id)
            );
        "#).execute(&self.pool).await?;

        // Chats: the sentinel name marks a direct chat.
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                is_group INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL DEFAULT 'not_assigned',
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Chat members
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS chat_members (
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            );
        "#).execute(&self.pool).await?;

        // Messages: append-only; author survives as NULL if the account goes.
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                author_id TEXT REFERENCES users(id) ON DELETE SET NULL,
                content TEXT NOT NULL,
                sent_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        Ok(())
    }

    /// Atomic friend-request acceptance: lazily create both friends lists,
    /// insert the two directed edges, delete the request. Any failure rolls
    /// the whole thing back, leaving no partial edge behind.
    pub async fn accept_friend_request(
        &self,
        request_id: &str,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for owner in [sender_id, receiver_id] {
            sqlx::query("INSERT OR IGNORE INTO friends_lists (owner_id) VALUES (?)")
                .bind(owner)
                .execute(&mut *tx)
                .await?;
        }
        // sender's list gains the receiver, and vice versa
        for (list, friend) in [(sender_id, receiver_id), (receiver_id, sender_id)] {
            sqlx::query("INSERT INTO friends (id, friends_list_id, friend_id) VALUES (?, ?, ?)")
                .bind(uuid::Uuid::new_v4().to_string())
                .bind(list)
                .bind(friend)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM friend_requests WHERE id = ?")
            .bind(request_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Atomic member add with the direct-chat cap enforced under the same
    /// transaction as the insert.
    pub async fn add_chat_member(&self, chat_id: &str, user_id: &str) -> Result<(), MemberAddError> {
        let mut tx = self.pool.begin().await?;
        let chat = sqlx::query("SELECT is_group FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_optional(&mut *tx)
            .await?;
        let is_group = match chat {
            Some(row) => row.get::<i64, _>("is_group") != 0,
            None => return Err(MemberAddError::ChatMissing),
        };
        let already = sqlx::query("SELECT 1 FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if already.is_some() {
            return Err(MemberAddError::AlreadyMember);
        }
        if !is_group {
            let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM chat_members WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_one(&mut *tx)
                .await?
                .get("c");
            if count >= 2 {
                return Err(MemberAddError::CapExceeded);
            }
        }
        sqlx::query("INSERT INTO chat_members (chat_id, user_id, joined_at) VALUES (?, ?, ?)")
            .bind(chat_id)
            .bind(user_id)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Creates a direct chat and both member rows as one unit.
    pub async fn create_direct_chat(&self, a: &str, b: &str) -> Result<String, sqlx::Error> {
        let chat_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO chats (id, is_group, name, created_at) VALUES (?, 0, ?, ?)")
            .bind(&chat_id)
            .bind(UNASSIGNED_CHAT_NAME)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        for member in [a, b] {
            sqlx::query("INSERT INTO chat_members (chat_id, user_id, joined_at) VALUES (?, ?, ?)")
                .bind(&chat_id)
                .bind(member)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(chat_id)
    }

    /// Creates a group chat with the creator as its sole member.
    pub async fn create_group_chat(&self, creator: &str, name: &str) -> Result<String, sqlx::Error> {
        let chat_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO chats (id, is_group, name, created_at) VALUES (?, 1, ?, ?)")
            .bind(&chat_id)
            .bind(name)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chat_members (chat_id, user_id, joined_at) VALUES (?, ?, ?)")
            .bind(&chat_id)
            .bind(creator)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(chat_id)
    }
}
