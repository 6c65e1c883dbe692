//! REST collaborator for everything the push channel does not carry:
//! conversation lists, history pages, sends, read receipts, archival.

use std::time::Duration;

use consult_core::{
    ConversationSummary, Message, MessageDraft, SyncError, SyncErrorCategory,
    classify_http_status,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

/// One outbound send, ready for the REST collaborator.
///
/// `conversation_id` is `None` when the message is the first send into a
/// transient conversation; the server then creates the conversation for
/// `case_id` and the confirmed [`Message`] carries the persisted ID.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: Option<String>,
    pub case_id: String,
    pub draft: MessageDraft,
    /// Idempotency key; resending with the same ref must not duplicate.
    pub client_ref: String,
}

/// Server-side operations backing the sync engine.
///
/// `ConsultApi` is the production implementation; tests and the smoke
/// binary use the in-memory fake from `memory`.
#[allow(async_fn_in_trait)]
pub trait ConsultBackend: Send + Sync {
    /// All conversations visible to the authenticated user.
    async fn list_conversations(
        &self,
        include_archived: bool,
    ) -> Result<Vec<ConversationSummary>, SyncError>;

    /// Server-side conversation search over case IDs and previews.
    async fn search_conversations(
        &self,
        query: &str,
    ) -> Result<Vec<ConversationSummary>, SyncError>;

    /// One conversation by its persisted ID.
    async fn conversation(&self, conversation_id: &str)
    -> Result<ConversationSummary, SyncError>;

    /// The conversation attached to a medical case, if any.
    async fn conversation_by_case(&self, case_id: &str)
    -> Result<ConversationSummary, SyncError>;

    /// One page of history, newest first. Pages are 1-based.
    async fn messages_page(
        &self,
        conversation_id: &str,
        page: u32,
        per_page: u16,
    ) -> Result<Vec<Message>, SyncError>;

    /// Send a message; the returned [`Message`] is the server-confirmed copy.
    async fn send_message(&self, request: &SendRequest) -> Result<Message, SyncError>;

    /// Acknowledge a single message as read.
    async fn mark_message_read(&self, message_id: &str) -> Result<(), SyncError>;

    /// Acknowledge every message in a conversation as read.
    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), SyncError>;

    /// Set or clear the archived flag on a conversation.
    async fn archive_conversation(
        &self,
        conversation_id: &str,
        archived: bool,
    ) -> Result<(), SyncError>;

    /// Total unread count across all conversations, per the server.
    async fn total_unread(&self) -> Result<u64, SyncError>;
}

#[derive(Serialize)]
struct SendBody<'a> {
    conversation_id: Option<&'a str>,
    case_id: &'a str,
    receiver_id: &'a str,
    content: &'a str,
    attachments: &'a [consult_core::Attachment],
    kind: consult_core::MessageKind,
    client_ref: &'a str,
}

#[derive(Serialize)]
struct ArchiveBody {
    archived: bool,
}

#[derive(Deserialize)]
struct UnreadTotal {
    count: u64,
}

/// HTTP implementation of [`ConsultBackend`].
pub struct ConsultApi {
    http: reqwest::Client,
    base_url: Url,
    bearer_token: String,
}

impl std::fmt::Debug for ConsultApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsultApi")
            .field("base_url", &self.base_url.as_str())
            .field("bearer_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl ConsultApi {
    /// Build a client for the given API root.
    ///
    /// The base URL is normalized to end with `/` so endpoint paths join
    /// under it rather than replacing its last segment.
    pub fn new(base_url: &str, bearer_token: impl Into<String>) -> Result<Self, SyncError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: normalize_base_url(base_url)?,
            bearer_token: bearer_token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url.join(path).map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Config,
                "invalid_endpoint",
                format!("cannot build endpoint '{path}': {err}"),
            )
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SyncError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = ensure_success(response)?;
        response.json::<T>().await.map_err(map_transport_error)
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, SyncError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.bearer_token)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = ensure_success(response)?;
        response.json::<T>().await.map_err(map_transport_error)
    }

    async fn put_ack<B: Serialize>(&self, url: Url, body: Option<&B>) -> Result<(), SyncError> {
        let mut builder = self.http.put(url).bearer_auth(&self.bearer_token);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(map_transport_error)?;
        ensure_success(response).map(|_| ())
    }
}

impl ConsultBackend for ConsultApi {
    async fn list_conversations(
        &self,
        include_archived: bool,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let mut url = self.endpoint("api/conversations")?;
        url.query_pairs_mut()
            .append_pair("include_archived", if include_archived { "true" } else { "false" });
        self.get_json(url).await
    }

    async fn search_conversations(
        &self,
        query: &str,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let mut url = self.endpoint("api/conversations/search")?;
        url.query_pairs_mut().append_pair("q", query);
        self.get_json(url).await
    }

    async fn conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationSummary, SyncError> {
        let url = self.endpoint(&format!("api/conversations/{conversation_id}"))?;
        self.get_json(url).await
    }

    async fn conversation_by_case(
        &self,
        case_id: &str,
    ) -> Result<ConversationSummary, SyncError> {
        let url = self.endpoint(&format!("api/cases/{case_id}/conversation"))?;
        self.get_json(url).await
    }

    async fn messages_page(
        &self,
        conversation_id: &str,
        page: u32,
        per_page: u16,
    ) -> Result<Vec<Message>, SyncError> {
        let mut url = self.endpoint(&format!("api/conversations/{conversation_id}/messages"))?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("per_page", &per_page.to_string());
        self.get_json(url).await
    }

    async fn send_message(&self, request: &SendRequest) -> Result<Message, SyncError> {
        let url = self.endpoint("api/messages")?;
        let body = SendBody {
            conversation_id: request.conversation_id.as_deref(),
            case_id: &request.case_id,
            receiver_id: &request.draft.receiver_id,
            content: &request.draft.content,
            attachments: &request.draft.attachments,
            kind: request.draft.kind,
            client_ref: &request.client_ref,
        };
        self.post_json(url, &body).await
    }

    async fn mark_message_read(&self, message_id: &str) -> Result<(), SyncError> {
        let url = self.endpoint(&format!("api/messages/{message_id}/read"))?;
        self.put_ack::<()>(url, None).await
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), SyncError> {
        let url = self.endpoint(&format!("api/conversations/{conversation_id}/read"))?;
        self.put_ack::<()>(url, None).await
    }

    async fn archive_conversation(
        &self,
        conversation_id: &str,
        archived: bool,
    ) -> Result<(), SyncError> {
        let url = self.endpoint(&format!("api/conversations/{conversation_id}/archive"))?;
        self.put_ack(url, Some(&ArchiveBody { archived })).await
    }

    async fn total_unread(&self) -> Result<u64, SyncError> {
        let url = self.endpoint("api/messages/unread-count")?;
        let total: UnreadTotal = self.get_json(url).await?;
        Ok(total.count)
    }
}

fn normalize_base_url(base_url: &str) -> Result<Url, SyncError> {
    let normalized = if base_url.ends_with('/') {
        base_url.to_owned()
    } else {
        format!("{base_url}/")
    };
    Url::parse(&normalized).map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_base_url",
            format!("cannot parse API base URL: {err}"),
        )
    })
}

fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut err = SyncError::new(
        classify_http_status(status.as_u16()),
        "http_status",
        format!("REST call failed with HTTP status {status}"),
    );
    if let Some(delay) = retry_after_from_headers(response.headers()) {
        err = err.with_retry_after(delay);
    }
    Err(err)
}

fn map_transport_error(err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::new(
            SyncErrorCategory::Serialization,
            "response_decode_error",
            format!("cannot decode REST response: {err}"),
        )
    } else {
        SyncError::new(
            SyncErrorCategory::Network,
            "transport_error",
            format!("REST transport failure: {err}"),
        )
    }
}

fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}
