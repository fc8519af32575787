use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    AccessTokenProvider, ChatSyncEngine, DurableMessageCache, EngineEvent, HttpChatClient,
    StaticTokenProvider, WsLiveChannel,
};
use shared::domain::{ChatRoom, ChatUser, RoomId, UserId};

/// Opens a 1:1 room against a chat backend and tails the synced timeline.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    my_user_id: String,
    #[arg(long)]
    opponent_id: String,
    #[arg(long, default_value = "")]
    opponent_nick: String,
    /// Existing room to open; omit for a room that is created on first send.
    #[arg(long)]
    room_id: Option<String>,
    #[arg(long)]
    access_token: Option<String>,
    #[arg(long, default_value = "sqlite://chat-cache.db")]
    cache_url: String,
    /// Message to send once the room is open.
    #[arg(long)]
    send: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let tokens: Arc<dyn AccessTokenProvider> = match &args.access_token {
        Some(token) => Arc::new(StaticTokenProvider::new(token.clone())),
        None => Arc::new(StaticTokenProvider::anonymous()),
    };
    let cache = DurableMessageCache::initialize(&args.cache_url).await?;
    let http = Arc::new(HttpChatClient::new(args.server_url.clone(), tokens.clone()));
    let live = Arc::new(WsLiveChannel::new(args.server_url.clone(), tokens));

    let engine = ChatSyncEngine::new(cache, http.clone(), http, live);
    let mut events = engine.subscribe_events();

    let room = args.room_id.map(|room_id| ChatRoom {
        room_id: RoomId::new(room_id),
        participants: Vec::new(),
    });
    let opponent = ChatUser {
        user_id: UserId::new(args.opponent_id),
        nick: args.opponent_nick,
        profile_image: None,
    };
    engine
        .open_room(room, opponent, UserId::new(args.my_user_id))
        .await;

    if let Some(text) = args.send {
        let _ = engine.send(&text).await;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(EngineEvent::TimelineUpdated) => {
                    let snapshot = engine.snapshot().await;
                    println!(
                        "timeline: {} messages (loading={}, more={}, live={})",
                        snapshot.timeline.len(),
                        snapshot.is_loading,
                        snapshot.has_more_history,
                        snapshot.is_live_connected,
                    );
                    if let Some(last) = snapshot.timeline.last() {
                        println!(
                            "  last: [{:?}] {}: {}",
                            last.send_status,
                            last.sender.user_id,
                            last.content.as_deref().unwrap_or("<attachments>"),
                        );
                    }
                }
                Ok(event) => println!("event: {event:?}"),
                Err(_) => break,
            },
        }
    }

    engine.close_room().await;
    Ok(())
}
