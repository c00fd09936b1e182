//! The membership engine: every mutation on the friend graph and on chats
//! runs through here. Invariants are explicit preconditions checked against
//! the store before anything is persisted; committed mutations hand their
//! domain event to the dispatcher, whose delivery outcome never feeds back
//! into the caller's response.

use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::server::database::{Database, MemberAddError};
use crate::server::dispatcher::{DomainEvent, NotificationDispatcher};
use crate::server::error::{ApiError, ApiResult};
use crate::server::store::{ChatDetail, ChatSummary, MessageView, PendingRequest, UserRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddMembersReport {
    pub added: usize,
    pub failed: usize,
}

pub struct MembershipEngine {
    db: Arc<Database>,
    dispatcher: NotificationDispatcher,
    max_message_length: usize,
}

impl MembershipEngine {
    pub fn new(db: Arc<Database>, dispatcher: NotificationDispatcher, max_message_length: usize) -> Self {
        Self { db, dispatcher, max_message_length }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    async fn require_user(&self, user_id: &str) -> ApiResult<UserRow> {
        self.db
            .user_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".into()))
    }

    /// The authorization gate: chat reads and mutations are member-only.
    async fn require_member(&self, chat_id: &str, user_id: &str) -> ApiResult<()> {
        if self.db.is_chat_member(chat_id, user_id).await? {
            Ok(())
        } else {
            Err(ApiError::Forbidden("You are not a member of this chat".into()))
        }
    }

    // FRIENDSHIP

    pub async fn send_friend_request(&self, sender_id: &str, receiver_name: &str) -> ApiResult<String> {
        let sender = self.require_user(sender_id).await?;
        let receiver = self
            .db
            .user_by_username(receiver_name)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
        if receiver.id == sender.id {
            return Err(ApiError::Conflict("Unable to befriend yourself".into()));
        }
        if self.db.is_friend(&sender.id, &receiver.id).await? {
            return Err(ApiError::Conflict(format!("You are already friends with {}", receiver.username)));
        }
        // A pending request in the reverse direction is a conflict, not an
        // auto-accept: resolving it stays the receiver's call.
        if self.db.friend_request_between(&receiver.id, &sender.id).await? {
            return Err(ApiError::Conflict(format!(
                "{} has already sent you a friend request",
                receiver.username
            )));
        }
        if self.db.friend_request_between(&sender.id, &receiver.id).await? {
            return Err(ApiError::Conflict("Friend request already sent".into()));
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        self.db.insert_friend_request(&request_id, &sender.id, &receiver.id).await?;
        info!("[FRIENDS] Request {} from {} to {}", request_id, sender.username, receiver.username);

        self.dispatcher
            .dispatch(DomainEvent::FriendRequestSent {
                receiver_id: receiver.id,
                request_id: request_id.clone(),
                sender_name: sender.username,
            })
            .await;
        Ok(request_id)
    }

    pub async fn resolve_friend_request(&self, request_id: &str, caller_id: &str, accept: bool) -> ApiResult<()> {
        let request = self
            .db
            .friend_request_by_id(request_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Friend request not found".into()))?;
        if request.receiver_id != caller_id {
            return Err(ApiError::Forbidden("Only the requested user may resolve this request".into()));
        }

        if !accept {
            // Rejection is silent: the request disappears, nobody is told.
            self.db.delete_friend_request(&request.id).await?;
            info!("[FRIENDS] Request {} rejected", request.id);
            return Ok(());
        }

        let sender = self.require_user(&request.sender_id).await?;
        let receiver = self.require_user(&request.receiver_id).await?;
        self.db
            .accept_friend_request(&request.id, &sender.id, &receiver.id)
            .await
            .map_err(|e| {
                if e.to_string().to_uppercase().contains("UNIQUE") {
                    ApiError::Conflict("Friend could not be added".into())
                } else {
                    ApiError::from(e)
                }
            })?;
        info!("[FRIENDS] Request {} accepted: {} <-> {}", request.id, sender.username, receiver.username);

        self.dispatcher
            .dispatch(DomainEvent::FriendRequestAccepted {
                sender_id: sender.id,
                sender_name: sender.username,
                receiver_id: receiver.id,
                receiver_name: receiver.username,
            })
            .await;
        Ok(())
    }

    pub async fn pending_requests(&self, user_id: &str) -> ApiResult<Vec<PendingRequest>> {
        Ok(self.db.pending_requests_for(user_id).await?)
    }

    /// A user with no friends list yet (no friendship ever accepted) gets an
    /// error, distinct from an existing-but-empty list.
    pub async fn list_friends(&self, user_id: &str) -> ApiResult<Vec<String>> {
        if !self.db.friends_list_exists(user_id).await? {
            return Err(ApiError::NotFound("Not Found".into()));
        }
        Ok(self.db.friend_names(user_id).await?)
    }

    // CHATS

    pub async fn create_direct_chat(&self, caller_id: &str, friend_name: &str) -> ApiResult<String> {
        let caller = self.require_user(caller_id).await?;
        let friend = self
            .db
            .user_by_username(friend_name)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
        if !self.db.is_friend(&caller.id, &friend.id).await? {
            return Err(ApiError::Forbidden(format!("{} is not in your friends list", friend.username)));
        }
        if self.db.direct_chat_between(&caller.id, &friend.id).await?.is_some() {
            return Err(ApiError::Conflict("A chat already exists".into()));
        }

        let chat_id = self.db.create_direct_chat(&caller.id, &friend.id).await?;
        info!("[CHATS] Direct chat {} between {} and {}", chat_id, caller.username, friend.username);

        self.dispatcher
            .dispatch(DomainEvent::DirectChatCreated {
                invited_id: friend.id,
                chat_id: chat_id.clone(),
            })
            .await;
        Ok(chat_id)
    }

    pub async fn create_group_chat(&self, caller_id: &str, name: &str) -> ApiResult<String> {
        let name = name.trim();
        if name.is_empty() || name.len() > 24 {
            return Err(ApiError::InvalidInput("Group name must be 1-24 characters".into()));
        }
        let caller = self.require_user(caller_id).await?;
        let chat_id = self.db.create_group_chat(&caller.id, name).await?;
        info!("[CHATS] Group chat '{}' ({}) created by {}", name, chat_id, caller.username);
        Ok(chat_id)
    }

    /// Batch add: one bad name never aborts the rest, and nothing already
    /// added is rolled back. The report carries both counts.
    pub async fn add_members(&self, chat_id: &str, caller_id: &str, names: &[String]) -> ApiResult<AddMembersReport> {
        if self.db.chat_by_id(chat_id).await?.is_none() {
            return Err(ApiError::NotFound("Chat does not exist".into()));
        }
        self.require_member(chat_id, caller_id).await?;

        let mut report = AddMembersReport { added: 0, failed: 0 };
        for name in names {
            let user = match self.db.user_by_username(name.trim()).await? {
                Some(user) => user,
                None => {
                    report.failed += 1;
                    continue;
                }
            };
            match self.db.add_chat_member(chat_id, &user.id).await {
                Ok(()) => report.added += 1,
                Err(MemberAddError::Db(e)) => return Err(ApiError::from(e)),
                Err(_) => report.failed += 1,
            }
        }
        info!("[CHATS] add_members on {}: {} added, {} failed", chat_id, report.added, report.failed);
        Ok(report)
    }

    pub async fn remove_self(&self, chat_id: &str, caller_id: &str) -> ApiResult<()> {
        let removed = self.db.remove_chat_member(chat_id, caller_id).await?;
        if removed == 0 {
            return Err(ApiError::Conflict("You are not a member of the chat".into()));
        }
        info!("[CHATS] {} left chat {}", caller_id, chat_id);
        Ok(())
    }

    pub async fn list_chats(&self, user_id: &str) -> ApiResult<Vec<ChatSummary>> {
        let chats = self.db.chats_for_user(user_id).await?;
        let mut summaries = Vec::with_capacity(chats.len());
        for chat in chats {
            let last = self.db.last_message(&chat.id).await?;
            let (last_message, modified_at) = match last {
                Some((author, content, sent_at)) => {
                    let line = if chat.is_group {
                        format!("{}: {}", author.as_deref().unwrap_or("?"), content)
                    } else {
                        content
                    };
                    (Some(line), Some(sent_at))
                }
                None => (None, None),
            };
            let name = if chat.is_group {
                chat.name.clone()
            } else {
                // Direct chats carry the sentinel name; show the other side.
                self.db
                    .other_member_name(&chat.id, user_id)
                    .await?
                    .unwrap_or_else(|| chat.name.clone())
            };
            summaries.push(ChatSummary {
                id: chat.id,
                name,
                is_group: chat.is_group,
                last_message,
                modified_at,
            });
        }
        Ok(summaries)
    }

    pub async fn chat_detail(&self, chat_id: &str, caller_id: &str) -> ApiResult<ChatDetail> {
        let chat = self
            .db
            .chat_by_id(chat_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Chat not found".into()))?;
        self.require_member(chat_id, caller_id).await?;
        let members = self.db.member_names(chat_id).await?;
        Ok(ChatDetail { id: chat.id, name: chat.name, members })
    }

    // MESSAGES

    pub async fn list_messages(&self, chat_id: &str, caller_id: &str) -> ApiResult<Vec<MessageView>> {
        if self.db.chat_by_id(chat_id).await?.is_none() {
            return Err(ApiError::NotFound("Chat does not exist".into()));
        }
        self.require_member(chat_id, caller_id).await?;
        Ok(self.db.messages_for_chat(chat_id).await?)
    }

    pub async fn post_message(&self, chat_id: &str, author_id: &str, content: &str) -> ApiResult<String> {
        if content.is_empty() {
            return Err(ApiError::InvalidInput("Message must not be empty".into()));
        }
        if content.len() > self.max_message_length {
            return Err(ApiError::InvalidInput(format!(
                "Message too long (max {} chars)",
                self.max_message_length
            )));
        }
        let chat = self
            .db
            .chat_by_id(chat_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Chat does not exist".into()))?;
        self.require_member(chat_id, author_id).await?;
        let author = self.require_user(author_id).await?;

        let message_id = uuid::Uuid::new_v4().to_string();
        self.db.insert_message(&message_id, chat_id, author_id, content).await?;

        // Display name on the wire: the group's name, or the author's own
        // name for direct chats (the sender sees it echoed back too).
        let name = if chat.is_group { chat.name.clone() } else { author.username.clone() };
        self.dispatcher
            .dispatch(DomainEvent::MessagePosted {
                chat_id: chat_id.to_string(),
                is_group: chat.is_group,
                name,
                author: author.username,
                content: content.to_string(),
            })
            .await;
        Ok(message_id)
    }

    // PROFILE

    pub async fn set_avatar(&self, user_id: &str, avatar: &str) -> ApiResult<()> {
        if avatar.trim().is_empty() {
            return Err(ApiError::InvalidInput("Avatar must not be empty".into()));
        }
        self.require_user(user_id).await?;
        self.db.set_avatar(user_id, avatar.trim()).await?;
        Ok(())
    }
}
