use thiserror::Error;

/// Failure taxonomy of the sync engine. Per-message failures are localized to
/// the placeholder they belong to; only room-level sync failures surface as a
/// recoverable condition. Nothing here is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("local cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("history fetch failed: {0}")]
    HistoryFetchFailed(String),
    #[error("room creation failed: {0}")]
    RoomCreationFailed(String),
    #[error("attachment upload failed: {0}")]
    UploadFailed(String),
    #[error("attachment upload timed out")]
    UploadTimedOut,
    #[error("message send failed: {0}")]
    SendFailed(String),
    #[error("live channel error: {0}")]
    LiveChannelError(String),
}
