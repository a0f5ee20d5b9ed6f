use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use shared::domain::{ConversationKey, UserId};
use sync_core::{
    load_settings, ConnectionSession, EngineEvent, HttpHistoryApi, SyncEngine, WsTransport,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from sync.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, env = "SYNC_TOKEN")]
    token: String,
    #[arg(long)]
    user_id: i64,
    /// Peer user id, or `group:<id>`.
    #[arg(long)]
    conversation: ConversationKey,
    /// Message to send once the conversation is open.
    #[arg(long)]
    send: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let session = Arc::new(
        ConnectionSession::from_settings(&settings, Arc::new(WsTransport))
            .context("invalid hub url")?,
    );
    let history = Arc::new(HttpHistoryApi::new_with_credential(
        settings.api_url().context("invalid api url")?,
        args.token.clone(),
    ));
    let engine = SyncEngine::new_with_history(
        settings,
        session,
        history,
        UserId(args.user_id),
    );
    let _sweeper = engine.spawn_typing_sweeper(Duration::from_secs(1));
    let mut events = engine.event_stream();

    engine.connect(&args.token).await?;
    let report = engine.open_conversation(args.conversation).await?;
    info!(
        conversation = %args.conversation,
        loaded = report.admitted,
        "conversation open"
    );
    for message in engine.messages(args.conversation) {
        println!("[{}] {}: {}", message.sent_at, message.sender_id, message.body);
    }
    if let Some(body) = args.send.as_deref() {
        let nonce = engine.send_message(args.conversation, body)?;
        info!(%nonce, "message sent");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(Ok(event)) => print_event(&engine, event),
                Some(Err(err)) => warn!("event stream lagged: {err}"),
                None => break,
            },
        }
    }

    engine.disconnect().await;
    Ok(())
}

fn print_event(engine: &SyncEngine, event: EngineEvent) {
    match event {
        EngineEvent::MessagesChanged { conversation } => {
            if let Some(latest) = engine.latest(conversation) {
                println!("{conversation} {}: {}", latest.sender_label, latest.preview);
            }
        }
        EngineEvent::TypingChanged {
            conversation,
            typers,
        } => {
            let names: Vec<_> = typers.iter().map(|t| t.user_name.as_str()).collect();
            if !names.is_empty() {
                println!("{conversation}: {} typing…", names.join(", "));
            }
        }
        other => info!(event = ?other, "engine event"),
    }
}
