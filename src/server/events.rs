use serde::{Deserialize, Serialize};

/// Identifier a set of live sessions is indexed by: a chat, or a user's
/// personal notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Chat(String),
    User(String),
}

/// Closed set of events that travel from the dispatcher through the registry
/// into session queues. `ChatCreated` is consumed by the session itself (it
/// joins the new group); everything else is relayed to the client as a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    FriendRequestSent {
        request_id: String,
        sender_name: String,
    },
    FriendRequestAccepted {
        name: String,
    },
    ChatCreated {
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

impl Notification {
    /// Wire frame for this event, or `None` for the session-internal ones.
    pub fn into_frame(self) -> Option<ServerFrame> {
        match self {
            Notification::FriendRequestSent { request_id, sender_name } => {
                Some(ServerFrame::NewFriendRequest { request_id, sender_name })
            }
            Notification::FriendRequestAccepted { name } => {
                Some(ServerFrame::FriendRequestAccepted { name })
            }
            Notification::ChatCreated { .. } => None,
            Notification::MessagePosted { chat_id, is_group, name, author, content } => {
                Some(ServerFrame::NewMessage { chat_id, is_group, name, author, content })
            }
        }
    }
}

/// Server -> client frames, discriminated by the `event` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerFrame {
    NewFriendRequest {
        request_id: String,
        sender_name: String,
    },
    FriendRequestAccepted {
        name: String,
    },
    NewMessage {
        chat_id: String,
        is_group: bool,
        name: String,
        author: String,
        content: String,
    },
    Error {
        message: String,
    },
}

/// Client -> server frame: post a message into a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub chat_id: String,
    pub content: String,
    pub is_group: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_frame_shape() {
        let frame = ServerFrame::NewMessage {
            chat_id: "c1".into(),
            is_group: false,
            name: "bob".into(),
            author: "bob".into(),
            content: "hi".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(json["event"], "new_message");
        assert_eq!(json["chat_id"], "c1");
        assert_eq!(json["author"], "bob");
        assert_eq!(json["content"], "hi");
        assert_eq!(json["is_group"], false);
    }

    #[test]
    fn friend_request_frame_shape() {
        let frame = ServerFrame::NewFriendRequest {
            request_id: "r1".into(),
            sender_name: "alice".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(json["event"], "new_friend_request");
        assert_eq!(json["request_id"], "r1");
        assert_eq!(json["sender_name"], "alice");
    }

    #[test]
    fn chat_created_has_no_wire_frame() {
        assert!(Notification::ChatCreated { chat_id: "c1".into() }.into_frame().is_none());
    }

    #[test]
    fn client_frame_parses() {
        let f: ClientFrame = serde_json::from_str(r#"{"chat_id":"c1","content":"hello","is_group":true}"#).unwrap();
        assert_eq!(f.chat_id, "c1");
        assert_eq!(f.content, "hello");
        assert!(f.is_group);
    }
}
