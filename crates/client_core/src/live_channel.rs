use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{ChatMessage, RoomId},
    protocol::MessagePayload,
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
};
use tracing::info;
use url::Url;

use crate::{AccessTokenProvider, LiveChannel, LiveEvent, LiveHandle};

const LIVE_EVENT_BUFFER: usize = 256;

/// Live channel over a room-scoped websocket endpoint. Frames are decoded
/// into typed messages at this boundary; the engine never sees raw payloads.
pub struct WsLiveChannel {
    server_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl WsLiveChannel {
    pub fn new(server_url: impl Into<String>, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            server_url: server_url.into(),
            tokens,
        }
    }

    fn ws_url(&self, room_id: &RoomId) -> Result<String> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url '{}'", self.server_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("unsupported server url scheme '{other}'")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("failed to derive websocket scheme"))?;
        url.set_path(&format!("/chats-{room_id}"));
        Ok(url.to_string())
    }
}

/// A frame carries either a single message object or a batch of them.
fn decode_live_frame(text: &str) -> Result<Vec<ChatMessage>> {
    if let Ok(batch) = serde_json::from_str::<Vec<MessagePayload>>(text) {
        return Ok(batch
            .into_iter()
            .map(MessagePayload::into_domain)
            .collect());
    }
    let single: MessagePayload = serde_json::from_str(text)?;
    Ok(vec![single.into_domain()])
}

#[async_trait]
impl LiveChannel for WsLiveChannel {
    async fn attach(&self, room_id: &RoomId) -> Result<LiveHandle> {
        let ws_url = self.ws_url(room_id)?;
        let mut request = ws_url
            .clone()
            .into_client_request()
            .with_context(|| format!("invalid websocket url: {ws_url}"))?;
        if let Some(token) = self.tokens.access_token() {
            request.headers_mut().insert(
                "Authorization",
                token
                    .parse()
                    .context("access token is not a valid header value")?,
            );
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect live channel: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(LIVE_EVENT_BUFFER);
        let room = room_id.clone();
        let conn_task = tokio::spawn(async move {
            let _ = tx.send(LiveEvent::ConnectionChanged(true)).await;
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match decode_live_frame(&text) {
                        Ok(messages) if !messages.is_empty() => {
                            let _ = tx.send(LiveEvent::Messages(messages)).await;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            let _ = tx
                                .send(LiveEvent::ChannelError(format!(
                                    "invalid live payload: {err}"
                                )))
                                .await;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = tx
                            .send(LiveEvent::ChannelError(format!(
                                "live channel receive failed: {err}"
                            )))
                            .await;
                        break;
                    }
                }
            }
            let _ = tx.send(LiveEvent::ConnectionChanged(false)).await;
            info!(room_id = %room, "live channel closed");
        });

        Ok(LiveHandle::with_conn_task(room_id.clone(), rx, conn_task))
    }
}
