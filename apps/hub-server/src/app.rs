//! Wires the hub, the chat directory and the front end together.

use std::sync::Arc;

use anyhow::Context;

use flippy_hub::{ChatDirectory, ChatRelay, Hub, InMemoryDirectory};

use crate::config::Config;
use crate::server::{HubServer, ServerConfig};

/// Runs the server until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let directory = Arc::new(InMemoryDirectory::new());
    for chat in &config.chats {
        directory
            .upsert_chat(chat.id.as_str(), chat.members.iter().map(String::as_str))
            .await;
    }
    tracing::info!(chats = config.chats.len(), "chat directory seeded");

    let hub = Hub::new(
        config.hub.to_hub_config(),
        ChatRelay,
        Some(directory as Arc<dyn ChatDirectory>),
    )?;

    let listen = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {:?}", config.listen))?;
    let server = HubServer::new(
        ServerConfig {
            listen,
            path: config.path,
            user_header: config.user_header,
        },
        hub,
    );

    let server2 = Arc::clone(&server);
    let mut handle = tokio::spawn(async move { server2.run().await });

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            true
        }
        result = &mut handle => {
            result??;
            false
        }
    };

    if interrupted {
        tracing::info!("interrupt received");
        server.shutdown();
        handle.await??;
    }
    Ok(())
}
