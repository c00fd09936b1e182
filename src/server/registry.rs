use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use log::debug;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::server::events::{GroupKey, Notification};

const SHARD_COUNT: usize = 16;

/// Write end of a session's inbound queue. The registry only ever hands
/// events to sessions through this channel; session state stays single-owner.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    tx: mpsc::UnboundedSender<Notification>,
}

impl SessionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: Uuid::new_v4().to_string(), tx }, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

type Shard = HashMap<GroupKey, HashMap<String, mpsc::UnboundedSender<Notification>>>;

/// In-memory map from group key to the live sessions joined to it. Keys are
/// spread over independent shards so traffic on unrelated chats never shares
/// a lock; join/leave/broadcast on one key serialize on its shard.
pub struct GroupRegistry {
    shards: Vec<Mutex<Shard>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, key: &GroupKey) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    pub async fn join(&self, key: GroupKey, session: &SessionHandle) {
        let mut shard = self.shard_for(&key).lock().await;
        shard
            .entry(key)
            .or_default()
            .insert(session.id.clone(), session.tx.clone());
    }

    /// No-op when the session was never joined, which makes the close-time
    /// leave sweep idempotent.
    pub async fn leave(&self, key: &GroupKey, session_id: &str) {
        let mut shard = self.shard_for(key).lock().await;
        if let Some(group) = shard.get_mut(key) {
            group.remove(session_id);
            if group.is_empty() {
                shard.remove(key);
            }
        }
    }

    /// Best-effort fan-out: every session currently joined to `key` gets a
    /// copy, in dispatch order. A session whose queue is gone is dropped from
    /// the group on the spot, never retried. Returns the delivery count; an
    /// empty group is a no-op.
    pub async fn broadcast(&self, key: &GroupKey, note: Notification) -> usize {
        let mut shard = self.shard_for(key).lock().await;
        let Some(group) = shard.get_mut(key) else { return 0 };
        let mut dead: Vec<String> = Vec::new();
        let mut delivered = 0;
        for (session_id, tx) in group.iter() {
            if tx.send(note.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(session_id.clone());
            }
        }
        for session_id in dead {
            debug!("[REGISTRY] Dropping dead session {} from {:?}", session_id, key);
            group.remove(&session_id);
        }
        if group.is_empty() {
            shard.remove(key);
        }
        delivered
    }

    pub async fn member_count(&self, key: &GroupKey) -> usize {
        let shard = self.shard_for(key).lock().await;
        shard.get(key).map(|g| g.len()).unwrap_or(0)
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(n: u32) -> Notification {
        Notification::MessagePosted {
            chat_id: "c".into(),
            is_group: false,
            name: "n".into(),
            author: "a".into(),
            content: n.to_string(),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_only_the_joined_group() {
        let registry = GroupRegistry::new();
        let (h1, mut rx1) = SessionHandle::new();
        let (h2, mut rx2) = SessionHandle::new();
        registry.join(GroupKey::Chat("x".into()), &h1).await;
        registry.join(GroupKey::Chat("y".into()), &h2).await;

        registry.broadcast(&GroupKey::Chat("x".into()), note(1)).await;
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_key_order_is_dispatch_order() {
        let registry = GroupRegistry::new();
        let (h, mut rx) = SessionHandle::new();
        registry.join(GroupKey::Chat("x".into()), &h).await;
        for n in 0..32 {
            registry.broadcast(&GroupKey::Chat("x".into()), note(n)).await;
        }
        for n in 0..32 {
            match rx.try_recv().unwrap() {
                Notification::MessagePosted { content, .. } => assert_eq!(content, n.to_string()),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn dead_sessions_are_pruned() {
        let registry = GroupRegistry::new();
        let (h1, mut rx1) = SessionHandle::new();
        let (h2, rx2) = SessionHandle::new();
        registry.join(GroupKey::Chat("x".into()), &h1).await;
        registry.join(GroupKey::Chat("x".into()), &h2).await;
        drop(rx2);

        let delivered = registry.broadcast(&GroupKey::Chat("x".into()), note(0)).await;
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_ok());
        assert_eq!(registry.member_count(&GroupKey::Chat("x".into())).await, 1);
    }

    #[tokio::test]
    async fn broadcast_to_empty_group_is_a_noop() {
        let registry = GroupRegistry::new();
        assert_eq!(registry.broadcast(&GroupKey::Chat("nobody".into()), note(0)).await, 0);
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let registry = GroupRegistry::new();
        let (h, _rx) = SessionHandle::new();
        registry.join(GroupKey::User("u".into()), &h).await;
        registry.leave(&GroupKey::User("u".into()), h.id()).await;
        registry.leave(&GroupKey::User("u".into()), h.id()).await;
        assert_eq!(registry.member_count(&GroupKey::User("u".into())).await, 0);
    }
}
