use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::domain::{ChatMessage, ChatRoom, ChatUser, MessageId, RoomId, SendStatus, UserId};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

pub mod cache;
pub mod error;
pub mod live_channel;
pub mod protocol_client;

pub use cache::DurableMessageCache;
pub use error::SyncError;
pub use live_channel::WsLiveChannel;
pub use protocol_client::HttpChatClient;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Box tags found at offset 4 of MP4/QuickTime containers. Payloads are
/// classified by content, not by filename.
const VIDEO_CONTAINER_BOX_TAGS: [&[u8; 4]; 4] = [b"ftyp", b"moov", b"mdat", b"wide"];

fn timeout_task_key(local_id: &str) -> String {
    format!("{local_id}-timeout")
}

fn is_video_payload(bytes: &[u8]) -> bool {
    if bytes.len() <= 12 {
        return false;
    }
    let tag = &bytes[4..8];
    VIDEO_CONTAINER_BOX_TAGS.iter().any(|sig| tag == &sig[..])
}

fn classify_payload(index: usize, bytes: &[u8]) -> AttachmentUpload {
    if is_video_payload(bytes) {
        AttachmentUpload {
            filename: format!("video_{index}_{}.mp4", Uuid::new_v4()),
            mime_type: "video/mp4".to_string(),
            bytes: bytes.to_vec(),
        }
    } else {
        AttachmentUpload {
            filename: format!("image_{index}_{}.jpg", Uuid::new_v4()),
            mime_type: "image/jpeg".to_string(),
            bytes: bytes.to_vec(),
        }
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>>;
    async fn upsert(&self, message: &ChatMessage) -> Result<()>;
}

pub struct MissingCacheStore;

#[async_trait]
impl CacheStore for MissingCacheStore {
    async fn load(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        Err(anyhow!("cache store unavailable for room {room_id}"))
    }

    async fn upsert(&self, message: &ChatMessage) -> Result<()> {
        Err(anyhow!(
            "cache store unavailable for message {}",
            message.id
        ))
    }
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    /// Declared full-page size; a shorter page means no older pages remain.
    pub page_size: u32,
}

#[async_trait]
pub trait HistoryClient: Send + Sync {
    async fn fetch_history(&self, room_id: &RoomId, cursor: Option<&str>) -> Result<HistoryPage>;
}

pub struct MissingHistoryClient;

#[async_trait]
impl HistoryClient for MissingHistoryClient {
    async fn fetch_history(&self, room_id: &RoomId, _cursor: Option<&str>) -> Result<HistoryPage> {
        Err(anyhow!("history client unavailable for room {room_id}"))
    }
}

/// A raw outgoing attachment, already classified for upload.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait SendClient: Send + Sync {
    async fn create_room(&self, opponent_id: &UserId) -> Result<ChatRoom>;
    async fn send_message(
        &self,
        room_id: &RoomId,
        content: Option<&str>,
        file_refs: &[String],
    ) -> Result<ChatMessage>;
    async fn upload_attachments(
        &self,
        room_id: &RoomId,
        files: Vec<AttachmentUpload>,
    ) -> Result<Vec<String>>;
}

pub struct MissingSendClient;

#[async_trait]
impl SendClient for MissingSendClient {
    async fn create_room(&self, opponent_id: &UserId) -> Result<ChatRoom> {
        Err(anyhow!("send client unavailable for opponent {opponent_id}"))
    }

    async fn send_message(
        &self,
        room_id: &RoomId,
        _content: Option<&str>,
        _file_refs: &[String],
    ) -> Result<ChatMessage> {
        Err(anyhow!("send client unavailable for room {room_id}"))
    }

    async fn upload_attachments(
        &self,
        room_id: &RoomId,
        _files: Vec<AttachmentUpload>,
    ) -> Result<Vec<String>> {
        Err(anyhow!("send client unavailable for room {room_id}"))
    }
}

#[derive(Debug, Clone)]
pub enum LiveEvent {
    Messages(Vec<ChatMessage>),
    ConnectionChanged(bool),
    ChannelError(String),
}

/// Handle to an attached live connection. The engine owns the event stream;
/// dropping the connection task tears the socket down.
pub struct LiveHandle {
    pub room_id: RoomId,
    pub events: mpsc::Receiver<LiveEvent>,
    conn_task: Option<JoinHandle<()>>,
}

impl LiveHandle {
    pub fn new(room_id: RoomId, events: mpsc::Receiver<LiveEvent>) -> Self {
        Self {
            room_id,
            events,
            conn_task: None,
        }
    }

    pub fn with_conn_task(
        room_id: RoomId,
        events: mpsc::Receiver<LiveEvent>,
        conn_task: JoinHandle<()>,
    ) -> Self {
        Self {
            room_id,
            events,
            conn_task: Some(conn_task),
        }
    }
}

#[async_trait]
pub trait LiveChannel: Send + Sync {
    async fn attach(&self, room_id: &RoomId) -> Result<LiveHandle>;
}

pub struct MissingLiveChannel;

#[async_trait]
impl LiveChannel for MissingLiveChannel {
    async fn attach(&self, room_id: &RoomId) -> Result<LiveHandle> {
        Err(anyhow!("live channel unavailable for room {room_id}"))
    }
}

/// Supplies the opaque auth token attached to HTTP calls and the live-channel
/// handshake. The engine never inspects the token.
pub trait AccessTokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

pub struct StaticTokenProvider(Option<String>);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TimelineUpdated,
    RoomCreated(ChatRoom),
    /// Room-level recoverable failure (history fetch); timeline is untouched.
    SyncFailed(SyncError),
    /// Per-message failure; the placeholder is now `Failed` and retryable.
    SendFailed { local_id: String, error: SyncError },
    LiveConnectionChanged(bool),
    LiveChannelFailed(SyncError),
}

#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub timeline: Vec<ChatMessage>,
    pub is_loading: bool,
    pub is_uploading: bool,
    pub has_more_history: bool,
    pub is_live_connected: bool,
    pub room: Option<ChatRoom>,
}

struct EngineState {
    room: Option<ChatRoom>,
    opponent: Option<ChatUser>,
    my_user_id: Option<UserId>,
    messages: Vec<ChatMessage>,
    cursor: Option<String>,
    has_more_history: bool,
    is_loading: bool,
    is_live_connected: bool,
    pending_uploads: HashMap<String, Vec<Vec<u8>>>,
    tasks: HashMap<String, JoinHandle<()>>,
    live_room: Option<RoomId>,
    live_conn_task: Option<JoinHandle<()>>,
    live_pump_task: Option<JoinHandle<()>>,
    bootstrap_task: Option<JoinHandle<()>>,
}

impl EngineState {
    fn empty() -> Self {
        Self {
            room: None,
            opponent: None,
            my_user_id: None,
            messages: Vec::new(),
            cursor: None,
            has_more_history: true,
            is_loading: false,
            is_live_connected: false,
            pending_uploads: HashMap::new(),
            tasks: HashMap::new(),
            live_room: None,
            live_conn_task: None,
            live_pump_task: None,
            bootstrap_task: None,
        }
    }

    fn abort_background_work(&mut self) {
        if let Some(task) = self.bootstrap_task.take() {
            task.abort();
        }
        if let Some(task) = self.live_pump_task.take() {
            task.abort();
        }
        if let Some(task) = self.live_conn_task.take() {
            task.abort();
        }
        self.live_room = None;
        self.is_live_connected = false;
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        self.pending_uploads.clear();
    }

    fn placeholder_index(&self, local_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.local_id.as_deref() == Some(local_id))
    }
}

/// Cancels the upload/timeout pair registered for `local_id`. The caller's own
/// key, if given, is only released; the task is about to finish on its own and
/// must not abort itself mid-settlement.
fn settle_task_keys(state: &mut EngineState, local_id: &str, own_key: Option<&str>) {
    for key in [local_id.to_string(), timeout_task_key(local_id)] {
        if own_key == Some(key.as_str()) {
            state.tasks.remove(&key);
        } else if let Some(task) = state.tasks.remove(&key) {
            task.abort();
        }
    }
}

/// Client-side synchronization engine for a single 1:1 room. Owns the ordered
/// timeline and the pending-send registry; cache, history, send and live
/// collaborators only ever feed it through async results and events.
pub struct ChatSyncEngine {
    cache: Arc<dyn CacheStore>,
    history: Arc<dyn HistoryClient>,
    sender: Arc<dyn SendClient>,
    live: Arc<dyn LiveChannel>,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl ChatSyncEngine {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        history: Arc<dyn HistoryClient>,
        sender: Arc<dyn SendClient>,
        live: Arc<dyn LiveChannel>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            cache,
            history,
            sender,
            live,
            inner: Mutex::new(EngineState::empty()),
            events,
        })
    }

    /// Engine with every collaborator absent. Useful for rooms that do not
    /// exist yet and for tests that only exercise local state.
    pub fn detached() -> Arc<Self> {
        Self::new(
            Arc::new(MissingCacheStore),
            Arc::new(MissingHistoryClient),
            Arc::new(MissingSendClient),
            Arc::new(MissingLiveChannel),
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn timeline(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let guard = self.inner.lock().await;
        EngineSnapshot {
            timeline: guard.messages.clone(),
            is_loading: guard.is_loading,
            is_uploading: guard
                .messages
                .iter()
                .any(|m| m.upload_pending && m.send_status == SendStatus::Sending),
            has_more_history: guard.has_more_history,
            is_live_connected: guard.is_live_connected,
            room: guard.room.clone(),
        }
    }

    /// Opens a room: cache fast path, then initial history sync, then live
    /// attach. Without a room id the timeline stays empty until the first
    /// send creates the room.
    pub async fn open_room(
        self: &Arc<Self>,
        room: Option<ChatRoom>,
        opponent: ChatUser,
        my_user_id: UserId,
    ) {
        let room_id = room.as_ref().map(|r| r.room_id.clone());
        {
            let mut guard = self.inner.lock().await;
            guard.abort_background_work();
            *guard = EngineState::empty();
            guard.room = room;
            guard.opponent = Some(opponent);
            guard.my_user_id = Some(my_user_id);
        }

        let Some(room_id) = room_id else {
            return;
        };

        match self.cache.load(&room_id).await {
            Ok(cached) => {
                let mut guard = self.inner.lock().await;
                guard.messages = cached;
                guard.is_loading = true;
                drop(guard);
                let _ = self.events.send(EngineEvent::TimelineUpdated);
            }
            Err(err) => {
                warn!(room_id = %room_id, "cache load failed, syncing from history only: {err}");
                self.inner.lock().await.is_loading = true;
            }
        }

        let engine = Arc::clone(self);
        let sync_room_id = room_id.clone();
        let handle = tokio::spawn(async move {
            engine.run_initial_sync(sync_room_id).await;
        });
        self.inner.lock().await.bootstrap_task = Some(handle);
    }

    /// Detaches the live channel and aborts all per-message work. The
    /// timeline stays readable until the next `open_room`.
    pub async fn close_room(&self) {
        self.inner.lock().await.abort_background_work();
    }

    async fn run_initial_sync(self: Arc<Self>, room_id: RoomId) {
        match self.history.fetch_history(&room_id, None).await {
            Ok(page) => {
                self.merge_history_page(&room_id, page, true).await;
                self.attach_live_channel(room_id).await;
            }
            Err(err) => {
                warn!(room_id = %room_id, "initial history fetch failed: {err}");
                self.inner.lock().await.is_loading = false;
                let _ = self.events.send(EngineEvent::SyncFailed(
                    SyncError::HistoryFetchFailed(err.to_string()),
                ));
            }
        }
    }

    /// Fetches the next (older) history page. No-op while a fetch is in
    /// flight or once the backend has signalled the end of history.
    pub async fn load_more(&self) {
        let (room_id, cursor) = {
            let mut guard = self.inner.lock().await;
            if guard.is_loading || !guard.has_more_history {
                return;
            }
            let Some(room_id) = guard.room.as_ref().map(|r| r.room_id.clone()) else {
                return;
            };
            guard.is_loading = true;
            (room_id, guard.cursor.clone())
        };

        match self.history.fetch_history(&room_id, cursor.as_deref()).await {
            Ok(page) => {
                self.merge_history_page(&room_id, page, cursor.is_none())
                    .await
            }
            Err(err) => {
                warn!(room_id = %room_id, "history pagination failed: {err}");
                self.inner.lock().await.is_loading = false;
                let _ = self.events.send(EngineEvent::SyncFailed(
                    SyncError::HistoryFetchFailed(err.to_string()),
                ));
            }
        }
    }

    async fn merge_history_page(&self, room_id: &RoomId, page: HistoryPage, is_initial: bool) {
        let HistoryPage {
            messages: page_messages,
            page_size,
        } = page;
        let has_more = page_size > 0 && page_messages.len() as u32 >= page_size;
        // Pages arrive oldest-to-newest; the next cursor is the oldest entry.
        let next_cursor = page_messages.first().map(|m| m.created_at.to_rfc3339());

        {
            let mut guard = self.inner.lock().await;
            if is_initial {
                if guard.messages.is_empty() {
                    guard.messages = page_messages.clone();
                } else {
                    let existing: HashSet<String> = guard
                        .messages
                        .iter()
                        .map(|m| m.id.as_str().to_string())
                        .collect();
                    for message in &page_messages {
                        if !existing.contains(message.id.as_str()) {
                            guard.messages.push(message.clone());
                        }
                    }
                }
            } else {
                let mut merged = page_messages.clone();
                merged.append(&mut guard.messages);
                guard.messages = merged;
            }
            if next_cursor.is_some() {
                guard.cursor = next_cursor;
            }
            guard.has_more_history = has_more;
            guard.is_loading = false;
        }
        let _ = self.events.send(EngineEvent::TimelineUpdated);

        for message in &page_messages {
            if let Err(err) = self.cache.upsert(message).await {
                warn!(room_id = %room_id, message_id = %message.id, "failed to persist history message: {err}");
            }
        }
    }

    /// Opens the live connection for `room_id`. Attaching to the room already
    /// connected is a no-op; a different room tears the previous connection
    /// down first.
    async fn attach_live_channel(self: &Arc<Self>, room_id: RoomId) {
        {
            let mut guard = self.inner.lock().await;
            if guard.live_room.as_ref() == Some(&room_id) {
                return;
            }
            if let Some(task) = guard.live_pump_task.take() {
                task.abort();
            }
            if let Some(task) = guard.live_conn_task.take() {
                task.abort();
            }
            guard.live_room = None;
            guard.is_live_connected = false;
        }

        let handle = match self.live.attach(&room_id).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(room_id = %room_id, "live channel attach failed: {err}");
                let _ = self.events.send(EngineEvent::LiveChannelFailed(
                    SyncError::LiveChannelError(err.to_string()),
                ));
                return;
            }
        };
        info!(room_id = %room_id, "live channel attached");

        let LiveHandle {
            events: mut live_events,
            conn_task,
            ..
        } = handle;
        let engine = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = live_events.recv().await {
                match event {
                    LiveEvent::Messages(batch) => engine.reconcile_live_messages(batch).await,
                    LiveEvent::ConnectionChanged(connected) => {
                        engine.inner.lock().await.is_live_connected = connected;
                        let _ = engine
                            .events
                            .send(EngineEvent::LiveConnectionChanged(connected));
                    }
                    LiveEvent::ChannelError(message) => {
                        warn!("live channel error: {message}");
                        let _ = engine.events.send(EngineEvent::LiveChannelFailed(
                            SyncError::LiveChannelError(message),
                        ));
                    }
                }
            }
        });

        let mut guard = self.inner.lock().await;
        guard.live_room = Some(room_id);
        guard.live_conn_task = conn_task;
        guard.live_pump_task = Some(pump);
    }

    /// Reconciliation rule for inbound live messages: drop duplicates by id,
    /// adopt self-echoes into their `Sending` placeholder, append the rest.
    async fn reconcile_live_messages(&self, batch: Vec<ChatMessage>) {
        let mut to_persist = Vec::new();
        let mut changed = false;
        {
            let mut guard = self.inner.lock().await;
            for message in batch {
                if guard.messages.iter().any(|m| m.id == message.id) {
                    continue;
                }

                let echo_index = guard.messages.iter().position(|m| {
                    m.send_status == SendStatus::Sending
                        && m.local_id.is_some()
                        && m.sender.user_id == message.sender.user_id
                        && m.content == message.content
                });

                if let Some(index) = echo_index {
                    // The echo beat the HTTP response; adopt the confirmed
                    // entry and drop the in-flight send for this placeholder.
                    let local_id = guard.messages[index].local_id.clone();
                    guard.messages[index] = message.clone();
                    if let Some(local_id) = local_id {
                        info!(local_id = %local_id, message_id = %message.id, "live echo confirmed pending send");
                        guard.pending_uploads.remove(&local_id);
                        settle_task_keys(&mut guard, &local_id, None);
                    }
                } else {
                    guard.messages.push(message.clone());
                }
                to_persist.push(message);
                changed = true;
            }
        }

        if changed {
            let _ = self.events.send(EngineEvent::TimelineUpdated);
        }
        for message in &to_persist {
            if let Err(err) = self.cache.upsert(message).await {
                warn!(message_id = %message.id, "failed to persist live message: {err}");
            }
        }
    }

    /// Optimistically sends a text message. Whitespace-only input is rejected
    /// before any placeholder exists. Returns the placeholder's local id.
    pub async fn send(self: &Arc<Self>, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }

        let local_id = Uuid::new_v4().to_string();
        self.append_placeholder(&local_id, Some(text.to_string()), false)
            .await;

        let engine = Arc::clone(self);
        let task_local_id = local_id.clone();
        let content = text.to_string();
        let handle = tokio::spawn(async move {
            engine
                .run_send(task_local_id, Some(content), Vec::new())
                .await;
        });
        self.register_task(&local_id, handle).await;
        Some(local_id)
    }

    /// Optimistically sends attachments. Raw payloads are retained for retry
    /// until the message confirms or the user cancels.
    pub async fn send_attachments(self: &Arc<Self>, payloads: Vec<Vec<u8>>) -> Option<String> {
        if payloads.is_empty() {
            return None;
        }

        let local_id = Uuid::new_v4().to_string();
        self.append_placeholder(&local_id, None, true).await;
        self.inner
            .lock()
            .await
            .pending_uploads
            .insert(local_id.clone(), payloads);

        self.spawn_upload_pair(&local_id).await;
        Some(local_id)
    }

    /// Re-runs a failed send. An upload entry for the placeholder re-runs the
    /// upload+timeout pair; otherwise the plain send is re-issued with the
    /// placeholder's original content. Supersedes any still-running attempt.
    pub async fn retry(self: &Arc<Self>, local_id: &str) {
        enum RetryMode {
            Upload,
            Plain {
                content: Option<String>,
                file_refs: Vec<String>,
            },
        }

        let mode = {
            let mut guard = self.inner.lock().await;
            let Some(index) = guard.placeholder_index(local_id) else {
                return;
            };
            if guard.messages[index].send_status != SendStatus::Failed {
                return;
            }
            guard.messages[index].send_status = SendStatus::Sending;
            if guard.pending_uploads.contains_key(local_id) {
                guard.messages[index].upload_pending = true;
                RetryMode::Upload
            } else {
                RetryMode::Plain {
                    content: guard.messages[index].content.clone(),
                    file_refs: guard.messages[index].attachments.clone(),
                }
            }
        };
        let _ = self.events.send(EngineEvent::TimelineUpdated);

        match mode {
            RetryMode::Upload => self.spawn_upload_pair(local_id).await,
            RetryMode::Plain { content, file_refs } => {
                let engine = Arc::clone(self);
                let task_local_id = local_id.to_string();
                let handle = tokio::spawn(async move {
                    engine.run_send(task_local_id, content, file_refs).await;
                });
                self.register_task(local_id, handle).await;
            }
        }
    }

    /// Removes a placeholder and its retained payloads. Work already
    /// completed server-side is left alone; no delete is issued.
    pub async fn cancel(&self, local_id: &str) {
        let removed = {
            let mut guard = self.inner.lock().await;
            let before = guard.messages.len();
            guard
                .messages
                .retain(|m| m.local_id.as_deref() != Some(local_id));
            guard.pending_uploads.remove(local_id);
            settle_task_keys(&mut guard, local_id, None);
            guard.messages.len() != before
        };
        if removed {
            let _ = self.events.send(EngineEvent::TimelineUpdated);
        }
    }

    async fn append_placeholder(&self, local_id: &str, content: Option<String>, uploading: bool) {
        {
            let mut guard = self.inner.lock().await;
            let sender = ChatUser {
                user_id: guard.my_user_id.clone().unwrap_or_default(),
                nick: String::new(),
                profile_image: None,
            };
            let room_id = guard
                .room
                .as_ref()
                .map(|r| r.room_id.clone())
                .unwrap_or_default();
            guard.messages.push(ChatMessage {
                id: MessageId::default(),
                room_id,
                content,
                created_at: Utc::now(),
                sender,
                attachments: Vec::new(),
                send_status: SendStatus::Sending,
                local_id: Some(local_id.to_string()),
                upload_pending: uploading,
            });
        }
        let _ = self.events.send(EngineEvent::TimelineUpdated);
    }

    async fn register_task(&self, key: &str, handle: JoinHandle<()>) {
        let mut guard = self.inner.lock().await;
        if let Some(previous) = guard.tasks.insert(key.to_string(), handle) {
            previous.abort();
        }
    }

    async fn spawn_upload_pair(self: &Arc<Self>, local_id: &str) {
        let engine = Arc::clone(self);
        let upload_local_id = local_id.to_string();
        let upload = tokio::spawn(async move {
            engine.run_attachment_send(upload_local_id).await;
        });
        self.register_task(local_id, upload).await;

        let engine = Arc::clone(self);
        let timeout_local_id = local_id.to_string();
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(UPLOAD_TIMEOUT).await;
            engine.on_upload_timeout(&timeout_local_id).await;
        });
        self.register_task(&timeout_task_key(local_id), timeout)
            .await;
    }

    /// Binds the room id exactly once: the first successful creation wins and
    /// is backfilled into placeholders created before the room existed.
    async fn ensure_room(self: &Arc<Self>) -> Result<RoomId> {
        let (existing, opponent_id) = {
            let guard = self.inner.lock().await;
            (
                guard.room.as_ref().map(|r| r.room_id.clone()),
                guard.opponent.as_ref().map(|o| o.user_id.clone()),
            )
        };
        if let Some(room_id) = existing {
            return Ok(room_id);
        }

        let opponent_id = opponent_id.ok_or_else(|| anyhow!("no opponent bound to this session"))?;
        info!(opponent_id = %opponent_id, "creating room on first send");
        let created = self.sender.create_room(&opponent_id).await?;

        let bound = {
            let mut guard = self.inner.lock().await;
            match &guard.room {
                Some(room) => room.room_id.clone(),
                None => {
                    let room_id = created.room_id.clone();
                    for message in guard.messages.iter_mut() {
                        if message.room_id.as_str().is_empty() {
                            message.room_id = room_id.clone();
                        }
                    }
                    guard.room = Some(created.clone());
                    room_id
                }
            }
        };

        if bound == created.room_id {
            let _ = self.events.send(EngineEvent::RoomCreated(created));
            // A fresh room has no history to sync, so the live channel can
            // attach as soon as the id is known.
            let engine = Arc::clone(self);
            let attach_room_id = bound.clone();
            let handle = tokio::spawn(async move {
                engine.attach_live_channel(attach_room_id).await;
            });
            let mut guard = self.inner.lock().await;
            if let Some(previous) = guard.bootstrap_task.replace(handle) {
                previous.abort();
            }
        }

        Ok(bound)
    }

    async fn run_send(
        self: Arc<Self>,
        local_id: String,
        content: Option<String>,
        file_refs: Vec<String>,
    ) {
        let room_id = match self.ensure_room().await {
            Ok(room_id) => room_id,
            Err(err) => {
                self.fail_placeholder(
                    &local_id,
                    SyncError::RoomCreationFailed(err.to_string()),
                    Some(&local_id),
                )
                .await;
                return;
            }
        };

        match self
            .sender
            .send_message(&room_id, content.as_deref(), &file_refs)
            .await
        {
            Ok(confirmed) => self.confirm_placeholder(&local_id, confirmed).await,
            Err(err) => {
                self.fail_placeholder(
                    &local_id,
                    SyncError::SendFailed(err.to_string()),
                    Some(&local_id),
                )
                .await
            }
        }
    }

    async fn run_attachment_send(self: Arc<Self>, local_id: String) {
        let payloads = {
            let guard = self.inner.lock().await;
            guard.pending_uploads.get(&local_id).cloned()
        };
        let Some(payloads) = payloads else {
            // cancelled before the upload started
            return;
        };

        let room_id = match self.ensure_room().await {
            Ok(room_id) => room_id,
            Err(err) => {
                self.fail_placeholder(
                    &local_id,
                    SyncError::RoomCreationFailed(err.to_string()),
                    Some(&local_id),
                )
                .await;
                return;
            }
        };

        let files: Vec<AttachmentUpload> = payloads
            .iter()
            .enumerate()
            .map(|(index, bytes)| classify_payload(index, bytes))
            .collect();

        let file_refs = match self.sender.upload_attachments(&room_id, files).await {
            Ok(file_refs) => file_refs,
            Err(err) => {
                self.fail_placeholder(
                    &local_id,
                    SyncError::UploadFailed(err.to_string()),
                    Some(&local_id),
                )
                .await;
                return;
            }
        };

        // The upload beat the timer; the post itself is not under the timeout.
        {
            let mut guard = self.inner.lock().await;
            if let Some(task) = guard.tasks.remove(&timeout_task_key(&local_id)) {
                task.abort();
            }
        }

        match self.sender.send_message(&room_id, None, &file_refs).await {
            Ok(confirmed) => self.confirm_placeholder(&local_id, confirmed).await,
            Err(err) => {
                self.fail_placeholder(
                    &local_id,
                    SyncError::SendFailed(err.to_string()),
                    Some(&local_id),
                )
                .await
            }
        }
    }

    async fn on_upload_timeout(self: Arc<Self>, local_id: &str) {
        warn!(local_id = %local_id, "attachment upload timed out");
        let own_key = timeout_task_key(local_id);
        self.fail_placeholder(local_id, SyncError::UploadTimedOut, Some(&own_key))
            .await;
    }

    /// Splices the server-confirmed message over its placeholder and settles
    /// both cancellation keys. If a live echo already superseded the
    /// placeholder the response is dropped as a duplicate.
    async fn confirm_placeholder(&self, local_id: &str, confirmed: ChatMessage) {
        let spliced = {
            let mut guard = self.inner.lock().await;
            guard.pending_uploads.remove(local_id);
            settle_task_keys(&mut guard, local_id, Some(local_id));
            match guard.placeholder_index(local_id) {
                Some(index) => {
                    guard.messages[index] = confirmed.clone();
                    true
                }
                None => false,
            }
        };

        if spliced {
            let _ = self.events.send(EngineEvent::TimelineUpdated);
            if let Err(err) = self.cache.upsert(&confirmed).await {
                warn!(message_id = %confirmed.id, "failed to persist confirmed send: {err}");
            }
        }
    }

    /// Marks the placeholder `Failed`, keeping its content for retry. Both
    /// cancellation keys settle so no timer leaks past a terminal state.
    async fn fail_placeholder(&self, local_id: &str, error: SyncError, own_key: Option<&str>) {
        let failed = {
            let mut guard = self.inner.lock().await;
            settle_task_keys(&mut guard, local_id, own_key);
            match guard.placeholder_index(local_id) {
                Some(index) if guard.messages[index].send_status == SendStatus::Sending => {
                    guard.messages[index].send_status = SendStatus::Failed;
                    guard.messages[index].upload_pending = false;
                    true
                }
                _ => false,
            }
        };

        if failed {
            warn!(local_id = %local_id, "send failed: {error}");
            let _ = self.events.send(EngineEvent::SendFailed {
                local_id: local_id.to_string(),
                error,
            });
            let _ = self.events.send(EngineEvent::TimelineUpdated);
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
