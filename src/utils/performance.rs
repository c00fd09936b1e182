use std::{fs::OpenOptions, io::Write, sync::Arc, time::Duration};

use chrono::Utc;
use log::{error, info, warn};
use sysinfo::System;
use tokio::time;

use crate::server::database::Database;

pub async fn start_performance_logger(db: Arc<Database>, log_path: &str) {
    let mut system = System::new_all();

    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("Unable to open performance log file '{}': {}", log_path, e);
            return;
        }
    };

    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        let header = "# Legami Server Performance Log\n# Timestamp, Sessions, Chats, Total_Messages, CPU_Usage";
        if let Err(e) = writeln!(file, "{}", header) {
            error!("Failed to write header to performance log: {}", e);
            return;
        }
        info!("📊 Performance log initialized: {}", log_path);
    }

    loop {
        system.refresh_all();
        let cpu_usage =
            system.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / system.cpus().len().max(1) as f32;
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");

        let sessions = count(&db, "SELECT COUNT(*) FROM sessions").await;
        let chats = count(&db, "SELECT COUNT(*) FROM chats").await;
        let total_messages = count(&db, "SELECT COUNT(*) FROM messages").await;

        info!(
            "📊 Performance - Sessions: {}, Chats: {}, Messages: {}, CPU: {:.1}%",
            sessions, chats, total_messages, cpu_usage
        );

        if let Err(e) = writeln!(file, "{}, {}, {}, {}, {:.1}%", timestamp, sessions, chats, total_messages, cpu_usage) {
            error!("Failed to write to performance log: {}", e);
        } else if let Err(e) = file.flush() {
            error!("Failed to flush performance log: {}", e);
        }

        time::sleep(Duration::from_secs(120)).await;
    }
}

async fn count(db: &Database, query: &str) -> i64 {
    match sqlx::query_scalar::<_, i64>(query).fetch_one(&db.pool).await {
        Ok(count) => count,
        Err(e) => {
            warn!("Failed to run stats query '{}': {}", query, e);
            -1
        }
    }
}
