//! One task per live WebSocket connection. The session authenticates from
//! the handshake cookie, joins its groups, then relays in both directions
//! until the socket goes away.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::server::auth;
use crate::server::database::Database;
use crate::server::events::{ClientFrame, GroupKey, Notification, ServerFrame};
use crate::server::membership::MembershipEngine;
use crate::server::registry::{GroupRegistry, SessionHandle};

#[derive(Clone)]
pub struct SessionContext {
    pub db: Arc<Database>,
    pub engine: Arc<MembershipEngine>,
    pub registry: Arc<GroupRegistry>,
}

pub async fn serve(addr: &str, ctx: SessionContext) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("[WS] Listening on {}", addr);
    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, ctx).await {
                warn!("[WS] Connection error ({}): {}", peer, e);
            }
        });
    }
}

fn token_from_cookie(cookie: &str) -> Option<String> {
    cookie
        .split(';')
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
}

async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    ctx: SessionContext,
) -> anyhow::Result<()> {
    // The handshake callback only extracts the bearer token; verification
    // needs the store, so it happens after the upgrade.
    let mut token: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if let Some(cookie) = req.headers().get("cookie").and_then(|v| v.to_str().ok()) {
            token = token_from_cookie(cookie);
        }
        Ok(resp)
    };
    let mut ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let user_id = match &token {
        Some(t) => auth::validate_session(&ctx.db, t).await,
        None => None,
    };
    let Some(user_id) = user_id else {
        // Accept-then-close on failed auth, as the clients expect.
        info!("[WS] Unauthenticated connection from {}; closing", peer);
        let _ = ws_stream.close(None).await;
        return Ok(());
    };
    let Some(user) = ctx.db.user_by_id(&user_id).await? else {
        let _ = ws_stream.close(None).await;
        return Ok(());
    };
    info!("[WS] {} connected as {}", peer, user.username);

    // Subscribe: every chat this user is a member of, plus the personal
    // notification channel keyed by user id.
    let (handle, mut inbox) = SessionHandle::new();
    let mut joined: HashSet<GroupKey> = HashSet::new();
    for chat in ctx.db.chats_for_user(&user_id).await? {
        let key = GroupKey::Chat(chat.id);
        ctx.registry.join(key.clone(), &handle).await;
        joined.insert(key);
    }
    let personal = GroupKey::User(user_id.clone());
    ctx.registry.join(personal.clone(), &handle).await;
    joined.insert(personal);

    let (mut sink, mut socket) = ws_stream.split();
    loop {
        tokio::select! {
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&ctx, &user_id, &text, &mut sink).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[WS] Socket error for {}: {}", user.username, e);
                    break;
                }
            },
            note = inbox.recv() => match note {
                Some(Notification::ChatCreated { chat_id }) => {
                    // New chat involving this user: join its group, nothing
                    // goes over the wire.
                    let key = GroupKey::Chat(chat_id);
                    if joined.insert(key.clone()) {
                        ctx.registry.join(key, &handle).await;
                    }
                }
                Some(other) => {
                    if let Some(frame) = other.into_frame() {
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                if sink.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("[WS] Frame serialization failed: {}", e),
                        }
                    }
                }
                None => break,
            }
        }
    }

    // Leave sweep; harmless if the registry already pruned us.
    for key in &joined {
        ctx.registry.leave(key, handle.id()).await;
    }
    info!("[WS] {} disconnected", user.username);
    Ok(())
}

/// Inbound message post. On success the broadcast loops back through this
/// session's own queue (the sender renders its own echo); on failure only
/// the sender hears about it.
async fn handle_client_frame(
    ctx: &SessionContext,
    user_id: &str,
    text: &str,
    sink: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
) {
    let result = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => ctx.engine.post_message(&frame.chat_id, user_id, &frame.content).await.map(|_| ()),
        Err(e) => Err(crate::server::error::ApiError::InvalidInput(format!("Invalid frame: {}", e))),
    };
    if let Err(e) = result {
        let frame = ServerFrame::Error { message: e.message().to_string() };
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = sink.send(Message::Text(json)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_token_extraction() {
        assert_eq!(token_from_cookie("token=abc123"), Some("abc123".into()));
        assert_eq!(token_from_cookie("theme=dark; token=abc123; lang=it"), Some("abc123".into()));
        assert_eq!(token_from_cookie("theme=dark"), None);
        assert_eq!(token_from_cookie(""), None);
    }
}
