//! Typed read/write helpers over the relational store. Business rules live
//! in the membership engine; this module only shapes queries and rows.

use serde::Serialize;
use sqlx::Row;

use crate::server::database::Database;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct ChatRow {
    pub id: String,
    pub is_group: bool,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct FriendRequestRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub id: String,
    pub sender_name: String,
    pub sent_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    pub is_group: bool,
    pub last_message: Option<String>,
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatDetail {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub author: Option<String>,
    pub content: String,
    pub sent_at: i64,
}

impl Database {
    pub async fn user_by_username(&self, username: &str) -> Result<Option<UserRow>, sqlx::Error> {
        let row = sqlx::query("SELECT id, username FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserRow { id: r.get("id"), username: r.get("username") }))
    }

    pub async fn user_by_id(&self, id: &str) -> Result<Option<UserRow>, sqlx::Error> {
        let row = sqlx::query("SELECT id, username FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserRow { id: r.get("id"), username: r.get("username") }))
    }

    pub async fn set_avatar(&self, user_id: &str, avatar: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET avatar = ? WHERE id = ?")
            .bind(avatar)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn friends_list_exists(&self, owner_id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM friends_lists WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn friend_names(&self, owner_id: &str) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT u.username FROM friends f JOIN users u ON u.id = f.friend_id \
             WHERE f.friends_list_id = ? ORDER BY u.username",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("username")).collect())
    }

    pub async fn is_friend(&self, owner_id: &str, friend_id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM friends WHERE friends_list_id = ? AND friend_id = ?")
            .bind(owner_id)
            .bind(friend_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn friend_request_by_id(&self, id: &str) -> Result<Option<FriendRequestRow>, sqlx::Error> {
        let row = sqlx::query("SELECT id, sender_id, receiver_id FROM friend_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| FriendRequestRow {
            id: r.get("id"),
            sender_id: r.get("sender_id"),
            receiver_id: r.get("receiver_id"),
        }))
    }

    pub async fn friend_request_between(&self, sender_id: &str, receiver_id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM friend_requests WHERE sender_id = ? AND receiver_id = ?")
            .bind(sender_id)
            .bind(receiver_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn insert_friend_request(&self, id: &str, sender_id: &str, receiver_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO friend_requests (id, sender_id, receiver_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(sender_id)
            .bind(receiver_id)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_friend_request(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM friend_requests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn pending_requests_for(&self, receiver_id: &str) -> Result<Vec<PendingRequest>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT fr.id, u.username, fr.created_at FROM friend_requests fr \
             JOIN users u ON u.id = fr.sender_id \
             WHERE fr.receiver_id = ? ORDER BY fr.created_at",
        )
        .bind(receiver_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| PendingRequest {
                id: r.get("id"),
                sender_name: r.get("username"),
                sent_at: r.get("created_at"),
            })
            .collect())
    }

    pub async fn chat_by_id(&self, id: &str) -> Result<Option<ChatRow>, sqlx::Error> {
        let row = sqlx::query("SELECT id, is_group, name FROM chats WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ChatRow {
            id: r.get("id"),
            is_group: r.get::<i64, _>("is_group") != 0,
            name: r.get("name"),
        }))
    }

    pub async fn chats_for_user(&self, user_id: &str) -> Result<Vec<ChatRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT c.id, c.is_group, c.name FROM chats c \
             JOIN chat_members m ON m.chat_id = c.id WHERE m.user_id = ? \
             ORDER BY c.created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ChatRow {
                id: r.get("id"),
                is_group: r.get::<i64, _>("is_group") != 0,
                name: r.get("name"),
            })
            .collect())
    }

    /// Intersects both users' chat sets, restricted to direct chats.
    pub async fn direct_chat_between(&self, a: &str, b: &str) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT m1.chat_id FROM chat_members m1 \
             JOIN chat_members m2 ON m1.chat_id = m2.chat_id \
             JOIN chats c ON c.id = m1.chat_id \
             WHERE m1.user_id = ? AND m2.user_id = ? AND c.is_group = 0",
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("chat_id")))
    }

    pub async fn is_chat_member(&self, chat_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn member_names(&self, chat_id: &str) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT u.username FROM chat_members m JOIN users u ON u.id = m.user_id \
             WHERE m.chat_id = ? ORDER BY m.joined_at",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("username")).collect())
    }

    /// The one other member of a direct chat.
    pub async fn other_member_name(&self, chat_id: &str, user_id: &str) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT u.username FROM chat_members m JOIN users u ON u.id = m.user_id \
             WHERE m.chat_id = ? AND m.user_id != ?",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("username")))
    }

    /// Returns the number of rows actually removed.
    pub async fn remove_chat_member(&self, chat_id: &str, user_id: &str) -> Result<u64, sqlx::Error> {
        let res = sqlx::query("DELETE FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn insert_message(&self, id: &str, chat_id: &str, author_id: &str, content: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO messages (id, chat_id, author_id, content, sent_at) VALUES (?, ?, ?, ?, ?)")
            .bind(id)
            .bind(chat_id)
            .bind(author_id)
            .bind(content)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<MessageView>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT u.username, msg.content, msg.sent_at FROM messages msg \
             LEFT JOIN users u ON u.id = msg.author_id \
             WHERE msg.chat_id = ? ORDER BY msg.sent_at, msg.id",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| MessageView {
                author: r.get::<Option<String>, _>("username"),
                content: r.get("content"),
                sent_at: r.get("sent_at"),
            })
            .collect())
    }

    /// Most recent message of a chat, as (author, content, sent_at).
    pub async fn last_message(&self, chat_id: &str) -> Result<Option<(Option<String>, String, i64)>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT u.username, msg.content, msg.sent_at FROM messages msg \
             LEFT JOIN users u ON u.id = msg.author_id \
             WHERE msg.chat_id = ? ORDER BY msg.sent_at DESC, msg.id DESC LIMIT 1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            (
                r.get::<Option<String>, _>("username"),
                r.get("content"),
                r.get("sent_at"),
            )
        }))
    }
}
