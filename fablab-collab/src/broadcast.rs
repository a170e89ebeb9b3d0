//! Broadcast gateway: the HTTP side of collaboration.
//!
//! Engines never talk to the broker directly. A local mutation becomes a
//! [`GatewayRequest`]; the session hands it to [`Gateway::publish`], which
//! returns immediately. The backend fans the mutation out to every other
//! client through the event broker.
//!
//! Delivery is at-most-once: a failed publish is logged and dropped, and the
//! local mutation is not rolled back.
//!
//! ```text
//! POST /collaboration/whiteboard/action   WhiteboardActionMessage
//! POST /collaboration/whiteboard/cursor   WhiteboardCursor
//! POST /collaboration/document/change     DocumentChange
//! POST /collaboration/document/cursor     DocumentCursor
//! POST /documents/{id}/lock               {locked, project_id}
//! GET  /projects/{id}/whiteboard          initial action log
//! GET  /documents/{id}                    DocumentRecord
//! PUT  /documents/{id}                    {content}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CollabConfig;
use crate::document::{DocumentChange, DocumentCursor, DocumentRecord};
use crate::error::CollabError;
use crate::whiteboard::{DrawingAction, WhiteboardActionMessage, WhiteboardCursor};

/// Body of `POST /documents/{id}/lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub locked: bool,
    pub project_id: String,
}

/// One fire-and-forget publish.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayRequest {
    WhiteboardAction(WhiteboardActionMessage),
    WhiteboardCursor(WhiteboardCursor),
    DocumentChange(DocumentChange),
    DocumentCursor(DocumentCursor),
    DocumentLock { document_id: String, request: LockRequest },
}

impl GatewayRequest {
    /// Path relative to the API base URL.
    pub fn path(&self) -> String {
        match self {
            GatewayRequest::WhiteboardAction(_) => "/collaboration/whiteboard/action".to_string(),
            GatewayRequest::WhiteboardCursor(_) => "/collaboration/whiteboard/cursor".to_string(),
            GatewayRequest::DocumentChange(_) => "/collaboration/document/change".to_string(),
            GatewayRequest::DocumentCursor(_) => "/collaboration/document/cursor".to_string(),
            GatewayRequest::DocumentLock { document_id, .. } => format!("/documents/{document_id}/lock"),
        }
    }

    pub fn body(&self) -> Result<Value, CollabError> {
        Ok(match self {
            GatewayRequest::WhiteboardAction(msg) => serde_json::to_value(msg)?,
            GatewayRequest::WhiteboardCursor(cursor) => serde_json::to_value(cursor)?,
            GatewayRequest::DocumentChange(change) => serde_json::to_value(change)?,
            GatewayRequest::DocumentCursor(cursor) => serde_json::to_value(cursor)?,
            GatewayRequest::DocumentLock { request, .. } => serde_json::to_value(request)?,
        })
    }

    /// Cursor moves are high-frequency and logged at trace level only.
    pub fn is_cursor(&self) -> bool {
        matches!(self, GatewayRequest::WhiteboardCursor(_) | GatewayRequest::DocumentCursor(_))
    }
}

/// HTTP collaborator the sessions publish to and load from.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Publish without waiting. Must never block the caller; failures are
    /// logged by the implementation.
    fn publish(&self, request: GatewayRequest);

    async fn load_document(&self, document_id: &str) -> Result<DocumentRecord, CollabError>;

    async fn save_document(&self, document_id: &str, content: &str) -> Result<(), CollabError>;

    async fn load_whiteboard(&self, project_id: &str) -> Result<Vec<DrawingAction>, CollabError>;
}

/// `GET /projects/{id}/whiteboard` answers either a bare list or `{actions: [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum WhiteboardBody {
    Actions(Vec<DrawingAction>),
    Wrapped { actions: Vec<DrawingAction> },
}

#[derive(Serialize)]
struct SaveBody<'a> {
    content: &'a str,
}

/// [`Gateway`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpGateway {
    pub fn new(config: &CollabConfig) -> Result<Self, CollabError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| CollabError::Connection(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send one publish and wait for the response.
    pub async fn send(&self, request: &GatewayRequest) -> Result<(), CollabError> {
        let body = request.body()?;
        self.request(reqwest::Method::POST, &request.path())
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| CollabError::Broadcast(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    fn publish(&self, request: GatewayRequest) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime, dropping publish to {}", request.path());
            return;
        };
        let gateway = self.clone();
        runtime.spawn(async move {
            match gateway.send(&request).await {
                Ok(()) if request.is_cursor() => log::trace!("Published {}", request.path()),
                Ok(()) => log::debug!("Published {}", request.path()),
                Err(e) => log::warn!("Publish to {} failed: {e}", request.path()),
            }
        });
    }

    async fn load_document(&self, document_id: &str) -> Result<DocumentRecord, CollabError> {
        let record = self
            .request(reqwest::Method::GET, &format!("/documents/{document_id}"))
            .send()
            .await?
            .error_for_status()?
            .json::<DocumentRecord>()
            .await?;
        Ok(record)
    }

    async fn save_document(&self, document_id: &str, content: &str) -> Result<(), CollabError> {
        self.request(reqwest::Method::PUT, &format!("/documents/{document_id}"))
            .json(&SaveBody { content })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn load_whiteboard(&self, project_id: &str) -> Result<Vec<DrawingAction>, CollabError> {
        let body = self
            .request(reqwest::Method::GET, &format!("/projects/{project_id}/whiteboard"))
            .send()
            .await?
            .error_for_status()?
            .json::<WhiteboardBody>()
            .await?;
        Ok(match body {
            WhiteboardBody::Actions(actions) | WhiteboardBody::Wrapped { actions } => actions,
        })
    }
}
