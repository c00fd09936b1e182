//! The command listener: the REST-style mutation surface carried over a
//! line-oriented protocol, optionally behind TLS. Every command resolves its
//! session token before the engine is touched; engine errors render as
//! `ERR <status>: <message>` lines.

use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;

// Optional TLS
use rustls::ServerConfig as RustlsConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

use crate::server::auth;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::error::{ApiError, ApiResult};
use crate::server::membership::MembershipEngine;

pub struct Server {
    pub db: Arc<Database>,
    pub config: ServerConfig,
    pub engine: Arc<MembershipEngine>,
}

fn ok(msg: impl Into<String>) -> String {
    format!("OK: {}", msg.into())
}

fn ok_json<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => ok(json),
        Err(e) => ApiError::Internal(format!("serialization failed: {}", e)).render(),
    }
}

fn render<T>(result: ApiResult<T>, success: impl FnOnce(T) -> String) -> String {
    match result {
        Ok(value) => success(value),
        Err(e) => e.render(),
    }
}

impl Server {
    /// Configure the TLS acceptor from TLS_CERT_PATH / TLS_KEY_PATH.
    fn setup_tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.config.enable_tls {
            return Ok(None);
        }

        let cert_path = std::env::var("TLS_CERT_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_CERT_PATH environment variable not set"))?;
        let key_path = std::env::var("TLS_KEY_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_KEY_PATH environment variable not set"))?;

        let cert_file = File::open(&cert_path)
            .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", cert_path, e))?;
        let mut cert_reader = StdBufReader::new(cert_file);
        let cert_chain = certs(&mut cert_reader)?
            .into_iter()
            .map(rustls::Certificate)
            .collect::<Vec<_>>();
        if cert_chain.is_empty() {
            return Err(anyhow::anyhow!("No certificates found in {}", cert_path));
        }

        let key_file = File::open(&key_path)
            .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", key_path, e))?;
        let mut key_reader = StdBufReader::new(key_file);
        // PKCS8 first, then RSA
        let mut keys = pkcs8_private_keys(&mut key_reader)?;
        if keys.is_empty() {
            let key_file = File::open(&key_path)?;
            let mut key_reader = StdBufReader::new(key_file);
            keys = rsa_private_keys(&mut key_reader)?;
        }
        if keys.is_empty() {
            return Err(anyhow::anyhow!("No private keys found in {}", key_path));
        }

        let priv_key = rustls::PrivateKey(keys.remove(0));
        let rustls_cfg = RustlsConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, priv_key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        info!("[TLS] TLS configuration successful");
        Ok(Some(TlsAcceptor::from(Arc::new(rustls_cfg))))
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("[SERVER] Listening on {}", addr);

        let tls_acceptor = match self.setup_tls_acceptor() {
            Ok(acceptor) => acceptor,
            Err(e) => {
                warn!("[TLS] TLS configuration failed: {}; falling back to plain TCP", e);
                None
            }
        };

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("[SERVER] New connection from {}", peer);
            let server = self.clone();
            let acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                let res = if let Some(acceptor) = acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => handle_client(server, tls_stream, peer).await,
                        Err(e) => {
                            warn!("[SERVER] TLS accept failed: {}", e);
                            Ok(())
                        }
                    }
                } else {
                    handle_client(server, stream, peer).await
                };
                if let Err(e) = res {
                    warn!("[SERVER] Client error ({}): {}", peer, e);
                }
            });
        }
    }

    async fn authed(&self, token: &str) -> ApiResult<String> {
        auth::validate_session(&self.db, token).await.ok_or(ApiError::Unauthenticated)
    }

    pub async fn handle_command(&self, cmd: &str, args: &[&str]) -> String {
        match cmd {
            // ACCOUNTS & SESSIONS
            "/register" if args.len() == 2 => {
                render(auth::register(&self.db, args[0], args[1], &self.config).await, |s| {
                    ok(format!("Registered as {} SESSION: {}", s.username, s.token))
                })
            }
            "/login" if args.len() == 2 => {
                render(auth::login(&self.db, args[0], args[1], &self.config).await, |s| {
                    ok(format!("Logged in as {} SESSION: {}", s.username, s.token))
                })
            }
            "/refresh_session" if args.len() == 1 => {
                render(auth::refresh_session(&self.db, args[0], &self.config).await, |t| {
                    ok(format!("SESSION: {}", t))
                })
            }
            "/logout" if args.len() == 1 => {
                render(auth::logout(&self.db, args[0]).await, |_| ok("Logged out"))
            }
            "/validate_session" if args.len() == 1 => match self.authed(args[0]).await {
                Ok(uid) => match self.db.user_by_id(&uid).await {
                    Ok(Some(user)) => ok(user.username),
                    Ok(None) => ApiError::NotFound("User not found".into()).render(),
                    Err(e) => ApiError::from(e).render(),
                },
                Err(e) => e.render(),
            },
            "/set_avatar" if args.len() == 2 => match self.authed(args[0]).await {
                Ok(uid) => render(self.engine.set_avatar(&uid, args[1]).await, |_| ok("Avatar updated")),
                Err(e) => e.render(),
            },

            // FRIENDSHIP
            "/send_friend_request" if args.len() == 2 => match self.authed(args[0]).await {
                Ok(uid) => render(self.engine.send_friend_request(&uid, args[1]).await, |id| {
                    ok(format!("Request sent: {}", id))
                }),
                Err(e) => e.render(),
            },
            "/friend_requests" if args.len() == 1 => match self.authed(args[0]).await {
                Ok(uid) => render(self.engine.pending_requests(&uid).await, |reqs| ok_json(&reqs)),
                Err(e) => e.render(),
            },
            "/resolve_friend_request" if args.len() == 3 => {
                let accept = match args[2] {
                    "accept" => true,
                    "reject" => false,
                    _ => return ApiError::InvalidInput("Expected 'accept' or 'reject'".into()).render(),
                };
                match self.authed(args[0]).await {
                    Ok(uid) => render(self.engine.resolve_friend_request(args[1], &uid, accept).await, |_| {
                        if accept { ok("Request accepted") } else { ok("Request rejected") }
                    }),
                    Err(e) => e.render(),
                }
            }
            "/list_friends" if args.len() == 1 => match self.authed(args[0]).await {
                Ok(uid) => render(self.engine.list_friends(&uid).await, |names| ok_json(&names)),
                Err(e) => e.render(),
            },

            // CHATS
            "/create_chat" if args.len() == 2 => match self.authed(args[0]).await {
                Ok(uid) => render(self.engine.create_direct_chat(&uid, args[1]).await, |id| {
                    ok(format!("Chat created: {}", id))
                }),
                Err(e) => e.render(),
            },
            "/create_group_chat" if args.len() >= 2 => {
                let name = args[1..].join(" ");
                match self.authed(args[0]).await {
                    Ok(uid) => render(self.engine.create_group_chat(&uid, &name).await, |id| {
                        ok(format!("Group '{}' created: {}", name, id))
                    }),
                    Err(e) => e.render(),
                }
            }
            "/my_chats" if args.len() == 1 => match self.authed(args[0]).await {
                Ok(uid) => render(self.engine.list_chats(&uid).await, |chats| ok_json(&chats)),
                Err(e) => e.render(),
            },
            "/chat_members" if args.len() == 2 => match self.authed(args[0]).await {
                Ok(uid) => render(self.engine.chat_detail(args[1], &uid).await, |d| ok_json(&d)),
                Err(e) => e.render(),
            },
            "/add_members" if args.len() == 3 => {
                let names: Vec<String> = args[2].split(',').map(str::to_string).collect();
                match self.authed(args[0]).await {
                    Ok(uid) => render(self.engine.add_members(args[1], &uid, &names).await, |r| {
                        ok(format!("{} added, {} failed", r.added, r.failed))
                    }),
                    Err(e) => e.render(),
                }
            }
            "/leave_chat" if args.len() == 2 => match self.authed(args[0]).await {
                Ok(uid) => render(self.engine.remove_self(args[1], &uid).await, |_| {
                    ok("You are no longer a member of this chat")
                }),
                Err(e) => e.render(),
            },

            // MESSAGES
            "/messages" if args.len() == 2 => match self.authed(args[0]).await {
                Ok(uid) => render(self.engine.list_messages(args[1], &uid).await, |msgs| ok_json(&msgs)),
                Err(e) => e.render(),
            },
            "/send_message" if args.len() >= 3 => {
                let content = args[2..].join(" ");
                match self.authed(args[0]).await {
                    Ok(uid) => render(self.engine.post_message(args[1], &uid, &content).await, |id| {
                        ok(format!("Message sent: {}", id))
                    }),
                    Err(e) => e.render(),
                }
            }

            // SYSTEM
            "/help" => help(),
            "/quit" => ok("Disconnected"),
            _ => ApiError::InvalidInput("Unknown or invalid command".into()).render(),
        }
    }
}

fn help() -> String {
    "Available commands:\n\
    /register <username> <password>\n\
    /login <username> <password>\n\
    /refresh_session <token>\n\
    /logout <token>\n\
    /validate_session <token>\n\
    /set_avatar <token> <url>\n\
    /send_friend_request <token> <username>\n\
    /friend_requests <token>\n\
    /resolve_friend_request <token> <request_id> <accept|reject>\n\
    /list_friends <token>\n\
    /create_chat <token> <friend_username>\n\
    /create_group_chat <token> <name>\n\
    /my_chats <token>\n\
    /chat_members <token> <chat_id>\n\
    /add_members <token> <chat_id> <name,name,...>\n\
    /leave_chat <token> <chat_id>\n\
    /messages <token> <chat_id>\n\
    /send_message <token> <chat_id> <content>\n\
    /help\n\
    /quit\n"
        .to_string()
}

/// One handler for both plain TCP and TLS streams.
async fn handle_client<S>(server: Arc<Server>, stream: S, peer: std::net::SocketAddr) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            debug!("[SERVER] Client disconnected: {}", peer);
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let cmd = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();
        debug!("[CONN] [{}] Cmd='{}'", peer, cmd);

        let response = server.handle_command(cmd, &args).await;
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        if cmd == "/quit" {
            break;
        }
    }
    Ok(())
}
