//! Live fan-out tests: what a connected session's queue sees while the
//! engine commits mutations, from the friend request all the way to the
//! delivered `new_message` frame.

use std::sync::Arc;

use legami::server::database::Database;
use legami::server::dispatcher::NotificationDispatcher;
use legami::server::events::{GroupKey, Notification, ServerFrame};
use legami::server::membership::MembershipEngine;
use legami::server::registry::{GroupRegistry, SessionHandle};
use tokio::sync::mpsc::UnboundedReceiver;

async fn setup() -> (Arc<Database>, MembershipEngine, Arc<GroupRegistry>) {
    let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
    db.migrate().await.unwrap();
    let registry = Arc::new(GroupRegistry::new());
    let dispatcher = NotificationDispatcher::new(registry.clone());
    let engine = MembershipEngine::new(db.clone(), dispatcher, 2048);
    (db, engine, registry)
}

async fn create_user(db: &Database, username: &str) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(username)
        .bind(chrono::Utc::now().timestamp())
        .execute(&db.pool)
        .await
        .unwrap();
    id
}

/// A connected user as the registry sees one: a handle joined to the
/// personal channel, plus the inbox end.
async fn connect(registry: &GroupRegistry, user_id: &str) -> (SessionHandle, UnboundedReceiver<Notification>) {
    let (handle, inbox) = SessionHandle::new();
    registry.join(GroupKey::User(user_id.to_string()), &handle).await;
    (handle, inbox)
}

#[tokio::test]
async fn friend_request_lands_on_the_receivers_personal_channel() {
    let (db, engine, registry) = setup().await;
    let alice = create_user(&db, "alice").await;
    let bob = create_user(&db, "bob").await;
    let (_alice_handle, mut alice_inbox) = connect(&registry, &alice).await;
    let (_bob_handle, mut bob_inbox) = connect(&registry, &bob).await;

    let request_id = engine.send_friend_request(&alice, "bob").await.unwrap();

    assert_eq!(
        bob_inbox.try_recv().unwrap(),
        Notification::FriendRequestSent { request_id, sender_name: "alice".into() }
    );
    assert!(alice_inbox.try_recv().is_err());
}

#[tokio::test]
async fn acceptance_notifies_both_parties_with_the_other_name() {
    let (db, engine, registry) = setup().await;
    let alice = create_user(&db, "alice").await;
    let bob = create_user(&db, "bob").await;
    let (_ah, mut alice_inbox) = connect(&registry, &alice).await;
    let (_bh, mut bob_inbox) = connect(&registry, &bob).await;

    let request_id = engine.send_friend_request(&alice, "bob").await.unwrap();
    let _ = bob_inbox.try_recv();
    engine.resolve_friend_request(&request_id, &bob, true).await.unwrap();

    assert_eq!(
        alice_inbox.try_recv().unwrap(),
        Notification::FriendRequestAccepted { name: "bob".into() }
    );
    assert_eq!(
        bob_inbox.try_recv().unwrap(),
        Notification::FriendRequestAccepted { name: "alice".into() }
    );
}

#[tokio::test]
async fn rejection_is_silent() {
    let (db, engine, registry) = setup().await;
    let alice = create_user(&db, "alice").await;
    let bob = create_user(&db, "bob").await;
    let (_ah, mut alice_inbox) = connect(&registry, &alice).await;
    let (_bh, mut bob_inbox) = connect(&registry, &bob).await;

    let request_id = engine.send_friend_request(&alice, "bob").await.unwrap();
    let _ = bob_inbox.try_recv();
    engine.resolve_friend_request(&request_id, &bob, false).await.unwrap();

    assert!(alice_inbox.try_recv().is_err());
    assert!(bob_inbox.try_recv().is_err());
}

#[tokio::test]
async fn alice_receives_bobs_message_as_a_new_message_frame() {
    let (db, engine, registry) = setup().await;
    let alice = create_user(&db, "alice").await;
    let bob = create_user(&db, "bob").await;
    let (alice_handle, mut alice_inbox) = connect(&registry, &alice).await;
    let (bob_handle, mut bob_inbox) = connect(&registry, &bob).await;

    // alice requests, bob accepts, alice opens the chat
    let request_id = engine.send_friend_request(&alice, "bob").await.unwrap();
    engine.resolve_friend_request(&request_id, &bob, true).await.unwrap();
    let chat_id = engine.create_direct_chat(&alice, "bob").await.unwrap();

    // bob's session learns about the chat on its personal channel and joins;
    // alice's session joins as her own session would on its next connect
    let _ = bob_inbox.try_recv(); // FriendRequestSent
    let _ = bob_inbox.try_recv(); // FriendRequestAccepted
    let _ = alice_inbox.try_recv(); // FriendRequestAccepted
    match bob_inbox.try_recv().unwrap() {
        Notification::ChatCreated { chat_id: announced } => {
            assert_eq!(announced, chat_id);
            registry.join(GroupKey::Chat(announced), &bob_handle).await;
        }
        other => panic!("expected ChatCreated, got {:?}", other),
    }
    registry.join(GroupKey::Chat(chat_id.clone()), &alice_handle).await;

    engine.post_message(&chat_id, &bob, "hi").await.unwrap();

    let note = alice_inbox.try_recv().unwrap();
    let frame = note.into_frame().unwrap();
    match &frame {
        ServerFrame::NewMessage { chat_id: c, is_group, name, author, content } => {
            assert_eq!(c, &chat_id);
            assert!(!is_group);
            assert_eq!(name, "bob");
            assert_eq!(author, "bob");
            assert_eq!(content, "hi");
        }
        other => panic!("expected NewMessage, got {:?}", other),
    }
    let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
    assert_eq!(json["event"], "new_message");

    // No self-suppression: bob renders his own echo.
    assert!(matches!(bob_inbox.try_recv().unwrap(), Notification::MessagePosted { .. }));
}

#[tokio::test]
async fn messages_stay_inside_their_chat_group() {
    let (db, engine, registry) = setup().await;
    let alice = create_user(&db, "alice").await;
    let bob = create_user(&db, "bob").await;
    let carol = create_user(&db, "carol").await;

    let team = engine.create_group_chat(&alice, "Team").await.unwrap();
    let other = engine.create_group_chat(&carol, "Other").await.unwrap();
    engine.add_members(&team, &alice, &["bob".to_string()]).await.unwrap();

    let (alice_handle, mut alice_inbox) = connect(&registry, &alice).await;
    let (bob_handle, mut bob_inbox) = connect(&registry, &bob).await;
    let (carol_handle, mut carol_inbox) = connect(&registry, &carol).await;
    registry.join(GroupKey::Chat(team.clone()), &alice_handle).await;
    registry.join(GroupKey::Chat(team.clone()), &bob_handle).await;
    registry.join(GroupKey::Chat(other.clone()), &carol_handle).await;

    engine.post_message(&team, &alice, "standup in 5").await.unwrap();

    assert!(matches!(alice_inbox.try_recv().unwrap(), Notification::MessagePosted { .. }));
    assert!(matches!(bob_inbox.try_recv().unwrap(), Notification::MessagePosted { .. }));
    assert!(carol_inbox.try_recv().is_err());
}

#[tokio::test]
async fn group_messages_carry_the_group_name() {
    let (db, engine, registry) = setup().await;
    let alice = create_user(&db, "alice").await;
    let team = engine.create_group_chat(&alice, "Team").await.unwrap();
    let (alice_handle, mut alice_inbox) = connect(&registry, &alice).await;
    registry.join(GroupKey::Chat(team.clone()), &alice_handle).await;

    engine.post_message(&team, &alice, "hello").await.unwrap();
    match alice_inbox.try_recv().unwrap() {
        Notification::MessagePosted { name, is_group, author, .. } => {
            assert_eq!(name, "Team");
            assert!(is_group);
            assert_eq!(author, "alice");
        }
        other => panic!("expected MessagePosted, got {:?}", other),
    }
}

#[tokio::test]
async fn delivery_failure_never_fails_the_mutation() {
    let (db, engine, registry) = setup().await;
    let alice = create_user(&db, "alice").await;
    let team = engine.create_group_chat(&alice, "Team").await.unwrap();

    // A session that went away without leaving.
    let (dead_handle, dead_inbox) = SessionHandle::new();
    registry.join(GroupKey::Chat(team.clone()), &dead_handle).await;
    drop(dead_inbox);

    engine.post_message(&team, &alice, "anyone here?").await.unwrap();
    let messages = engine.list_messages(&team, &alice).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(registry.member_count(&GroupKey::Chat(team)).await, 0);
}
