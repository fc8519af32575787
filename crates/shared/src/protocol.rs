use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatMessage, ChatRoom, ChatUser, MessageId, RoomId, SendStatus, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub opponent_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPayload {
    pub user_id: UserId,
    pub nick: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

impl From<ParticipantPayload> for ChatUser {
    fn from(value: ParticipantPayload) -> Self {
        ChatUser {
            user_id: value.user_id,
            nick: value.nick,
            profile_image: value.profile_image,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPayload {
    pub room_id: RoomId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub participants: Vec<ParticipantPayload>,
}

impl RoomPayload {
    pub fn into_domain(self) -> ChatRoom {
        ChatRoom {
            room_id: self.room_id,
            participants: self.participants.into_iter().map(Into::into).collect(),
        }
    }
}

/// A single message as the backend serializes it, over both the history
/// endpoint and the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub chat_id: MessageId,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sender: ParticipantPayload,
    #[serde(default)]
    pub files: Vec<String>,
}

impl MessagePayload {
    pub fn into_domain(self) -> ChatMessage {
        ChatMessage {
            id: self.chat_id,
            room_id: self.room_id,
            content: self.content,
            created_at: self.created_at,
            sender: self.sender.into(),
            attachments: self.files,
            send_status: SendStatus::Confirmed,
            local_id: None,
            upload_pending: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageListResponse {
    pub data: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFilesResponse {
    pub files: Vec<String>,
}
