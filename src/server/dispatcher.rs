use std::sync::Arc;

use log::debug;

use crate::server::events::{GroupKey, Notification};
use crate::server::registry::GroupRegistry;

/// A committed mutation worth announcing to live sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    FriendRequestSent {
        receiver_id: String,
        request_id: String,
        sender_name: String,
    },
    FriendRequestAccepted {
        sender_id: String,
        sender_name: String,
        receiver_id: String,
        receiver_name: String,
    },
    DirectChatCreated {
        invited_id: String,
        chat_id: String,
    },
    MessagePosted {
        chat_id: String,
        is_group: bool,
        name: String,
        author: String,
        content: String,
    },
}

/// Pure event -> (group key, payload) mapping. Acceptance fans out to both
/// personal channels, each side carrying the *other* party's name.
pub fn targets(event: DomainEvent) -> Vec<(GroupKey, Notification)> {
    match event {
        DomainEvent::FriendRequestSent { receiver_id, request_id, sender_name } => vec![(
            GroupKey::User(receiver_id),
            Notification::FriendRequestSent { request_id, sender_name },
        )],
        DomainEvent::FriendRequestAccepted { sender_id, sender_name, receiver_id, receiver_name } => vec![
            (
                GroupKey::User(sender_id),
                Notification::FriendRequestAccepted { name: receiver_name },
            ),
            (
                GroupKey::User(receiver_id),
                Notification::FriendRequestAccepted { name: sender_name },
            ),
        ],
        DomainEvent::DirectChatCreated { invited_id, chat_id } => vec![(
            GroupKey::User(invited_id),
            Notification::ChatCreated { chat_id },
        )],
        DomainEvent::MessagePosted { chat_id, is_group, name, author, content } => vec![(
            GroupKey::Chat(chat_id.clone()),
            Notification::MessagePosted { chat_id, is_group, name, author, content },
        )],
    }
}

/// Fire-and-forget bridge from committed mutations to registry broadcasts.
/// Delivery problems are logged and swallowed; they never fail the mutation.
#[derive(Clone)]
pub struct NotificationDispatcher {
    registry: Arc<GroupRegistry>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<GroupRegistry>) -> Self {
        Self { registry }
    }

    pub async fn dispatch(&self, event: DomainEvent) {
        for (key, note) in targets(event) {
            let delivered = self.registry.broadcast(&key, note).await;
            debug!("[DISPATCH] {:?} -> {} session(s)", key, delivered);
        }
    }
}
