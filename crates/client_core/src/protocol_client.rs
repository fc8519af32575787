use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response};
use shared::{
    domain::{ChatMessage, ChatRoom, RoomId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        CreateRoomRequest, MessageListResponse, MessagePayload, RoomPayload, SendMessageRequest,
        UploadFilesResponse,
    },
};

use crate::{AccessTokenProvider, AttachmentUpload, HistoryClient, HistoryPage, SendClient};

/// Declared full-page size of the history endpoint; a page shorter than this
/// means no older messages remain.
const HISTORY_PAGE_SIZE: u32 = 20;

/// HTTP client for the chat backend: room creation, paginated history,
/// attachment upload and message post.
pub struct HttpChatClient {
    http: Client,
    server_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl HttpChatClient {
    pub fn new(server_url: impl Into<String>, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            tokens,
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.tokens.access_token() {
            Some(token) => builder.header("Authorization", token),
            None => builder,
        }
    }
}

/// Decodes the backend's error body, when present, into a typed exception.
async fn into_api_result(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ApiError>().await {
        Ok(body) => body.message,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
    };
    Err(ApiException::new(status.as_u16(), message).into())
}

#[async_trait]
impl HistoryClient for HttpChatClient {
    async fn fetch_history(&self, room_id: &RoomId, cursor: Option<&str>) -> Result<HistoryPage> {
        let mut request = self
            .authorized(self.http.get(format!("{}/chats/{room_id}", self.server_url)));
        if let Some(cursor) = cursor {
            request = request.query(&[("next", cursor)]);
        }
        let response = into_api_result(request.send().await?).await?;
        let body: MessageListResponse = response.json().await?;
        Ok(HistoryPage {
            messages: body
                .data
                .into_iter()
                .map(MessagePayload::into_domain)
                .collect(),
            page_size: HISTORY_PAGE_SIZE,
        })
    }
}

#[async_trait]
impl SendClient for HttpChatClient {
    async fn create_room(&self, opponent_id: &UserId) -> Result<ChatRoom> {
        let response = self
            .authorized(self.http.post(format!("{}/chats", self.server_url)))
            .json(&CreateRoomRequest {
                opponent_id: opponent_id.clone(),
            })
            .send()
            .await?;
        let body: RoomPayload = into_api_result(response).await?.json().await?;
        Ok(body.into_domain())
    }

    async fn send_message(
        &self,
        room_id: &RoomId,
        content: Option<&str>,
        file_refs: &[String],
    ) -> Result<ChatMessage> {
        let request = SendMessageRequest {
            content: content.map(str::to_string),
            files: if file_refs.is_empty() {
                None
            } else {
                Some(file_refs.to_vec())
            },
        };
        let response = self
            .authorized(self.http.post(format!("{}/chats/{room_id}", self.server_url)))
            .json(&request)
            .send()
            .await?;
        let body: MessagePayload = into_api_result(response).await?.json().await?;
        Ok(body.into_domain())
    }

    async fn upload_attachments(
        &self,
        room_id: &RoomId,
        files: Vec<AttachmentUpload>,
    ) -> Result<Vec<String>> {
        let mut form = multipart::Form::new();
        for file in files {
            let part = multipart::Part::bytes(file.bytes)
                .file_name(file.filename)
                .mime_str(&file.mime_type)?;
            form = form.part("files", part);
        }
        let response = self
            .authorized(
                self.http
                    .post(format!("{}/chats/{room_id}/files", self.server_url)),
            )
            .multipart(form)
            .send()
            .await?;
        let body: UploadFilesResponse = into_api_result(response).await?.json().await?;
        Ok(body.files)
    }
}
