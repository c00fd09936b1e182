//! Smoke client for the command surface: register two users, run the friend
//! request flow end to end, open a chat and exchange a message.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

async fn send_command(host: &str, cmd: &str) -> anyhow::Result<String> {
    let stream = TcpStream::connect(host).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(cmd.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

fn session_token(resp: &str) -> Option<String> {
    resp.split("SESSION:").nth(1).map(|s| s.trim().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let host = std::env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:5000".to_string());
    println!("Using host {}", host);

    let run_id = uuid::Uuid::new_v4().to_string();
    let suffix = &run_id[..8];
    let alice = format!("alice_{}", suffix);
    let bob = format!("bob_{}", suffix);

    let resp = send_command(&host, &format!("/register {} pw1", alice)).await?;
    println!("REGISTER {} -> {}", alice, resp);
    let alice_token = session_token(&resp).ok_or_else(|| anyhow::anyhow!("no session token"))?;

    let resp = send_command(&host, &format!("/register {} pw2", bob)).await?;
    println!("REGISTER {} -> {}", bob, resp);
    let bob_token = session_token(&resp).ok_or_else(|| anyhow::anyhow!("no session token"))?;

    let resp = send_command(&host, &format!("/send_friend_request {} {}", alice_token, bob)).await?;
    println!("FRIEND REQUEST -> {}", resp);

    let resp = send_command(&host, &format!("/friend_requests {}", bob_token)).await?;
    println!("PENDING -> {}", resp);
    let json = resp.trim_start_matches("OK:").trim();
    let pending: serde_json::Value = serde_json::from_str(json)?;
    let request_id = pending[0]["id"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("no pending request id"))?
        .to_string();

    let resp = send_command(&host, &format!("/resolve_friend_request {} {} accept", bob_token, request_id)).await?;
    println!("ACCEPT -> {}", resp);

    let resp = send_command(&host, &format!("/create_chat {} {}", alice_token, bob)).await?;
    println!("CREATE CHAT -> {}", resp);
    let chat_id = resp
        .rsplit(' ')
        .next()
        .ok_or_else(|| anyhow::anyhow!("no chat id"))?
        .to_string();

    let resp = send_command(&host, &format!("/send_message {} {} hi from the smoke test", bob_token, chat_id)).await?;
    println!("SEND -> {}", resp);

    let resp = send_command(&host, &format!("/messages {} {}", alice_token, chat_id)).await?;
    println!("MESSAGES -> {}", resp);

    Ok(())
}
