//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/conversations` | Create a conversation |
//! | `GET`    | `/conversations` | List conversations, newest first |
//! | `DELETE` | `/conversations/{id}` | Soft-delete a conversation |
//! | `GET`    | `/conversations/{id}/messages` | Message log, oldest first |
//! | `POST`   | `/documents` | Multipart upload (`file`, `conversation_id`) |
//! | `GET`    | `/documents?conversation_id=` | Documents of a conversation |
//! | `GET`    | `/documents/{id}` | Document status |
//! | `DELETE` | `/documents/{id}` | Soft-delete a document |
//! | `POST`   | `/documents/{id}/fail` | Operator force-fail |
//! | `POST`   | `/chat` | Ask a question (`conversation_id`, `message`) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "document_exists", "message": "conversation ... already has a document" } }
//! ```

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::answer::{answer, Answer};
use crate::app::App;
use crate::error::{AnswerError, UploadError};
use crate::ingest;
use crate::models::{Conversation, Document, Message};
use crate::store::format_ts_iso;

/// Room for multipart framing and the `conversation_id` field on top of the
/// file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the router. Exposed for tests that serve it on an ephemeral port.
pub fn router(app: App) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = app.config.ingestion.max_file_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/conversations",
            post(handle_create_conversation).get(handle_list_conversations),
        )
        .route(
            "/conversations/{id}",
            axum::routing::delete(handle_delete_conversation),
        )
        .route("/conversations/{id}/messages", get(handle_list_messages))
        .route(
            "/documents",
            post(handle_upload).get(handle_list_documents),
        )
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/documents/{id}/fail", post(handle_fail_document))
        .route("/chat", post(handle_chat))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(app)
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "docqa server listening");
    println!("docqa server listening on http://{}", bind_addr);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = ?err, "request failed");
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{:#}", err))
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        internal(err)
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let message = err.to_string();
        match err {
            UploadError::FileTooLarge { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "file_too_large", message)
            }
            UploadError::UnsupportedType => {
                AppError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_type", message)
            }
            UploadError::EmptyFile => AppError::new(StatusCode::BAD_REQUEST, "empty_file", message),
            UploadError::Parse(e) => AppError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                &e.code().to_ascii_lowercase(),
                message,
            ),
            UploadError::ConversationNotFound(_) => not_found(message),
            UploadError::DocumentAlreadyAttached(_) => {
                AppError::new(StatusCode::CONFLICT, "document_exists", message)
            }
            UploadError::Storage { .. } => {
                tracing::error!(error = %message, "upload storage failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", message)
            }
            UploadError::Internal(e) => internal(e),
        }
    }
}

impl From<AnswerError> for AppError {
    fn from(err: AnswerError) -> Self {
        match err {
            AnswerError::ConversationNotFound(_) => not_found(err.to_string()),
            AnswerError::EmptyQuestion => bad_request(err.to_string()),
            AnswerError::Internal(e) => internal(e),
        }
    }
}

// ============ Views ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ConversationView {
    id: String,
    created_at: String,
}

impl From<Conversation> for ConversationView {
    fn from(c: Conversation) -> Self {
        Self {
            id: c.id,
            created_at: format_ts_iso(c.created_at),
        }
    }
}

#[derive(Serialize)]
struct DocumentView {
    id: String,
    conversation_id: String,
    filename: String,
    file_type: String,
    status: String,
    processing_attempts: i64,
    error_reason: Option<String>,
    created_at: String,
}

impl From<Document> for DocumentView {
    fn from(d: Document) -> Self {
        Self {
            id: d.id,
            conversation_id: d.conversation_id,
            filename: d.filename,
            file_type: d.file_type.to_string(),
            status: d.status.to_string(),
            processing_attempts: d.processing_attempts,
            error_reason: d.error_reason,
            created_at: format_ts_iso(d.created_at),
        }
    }
}

#[derive(Serialize)]
struct MessageView {
    id: String,
    role: String,
    content: String,
    created_at: String,
}

impl From<Message> for MessageView {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            role: m.role.as_str().to_string(),
            content: m.content,
            created_at: format_ts_iso(m.created_at),
        }
    }
}

#[derive(Serialize)]
struct UploadResponse {
    document_id: String,
    status: String,
}

// ============ Handlers ============

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_create_conversation(
    State(app): State<App>,
) -> Result<(StatusCode, Json<ConversationView>), AppError> {
    let conversation = app.store.create_conversation().await?;
    Ok((StatusCode::CREATED, Json(conversation.into())))
}

async fn handle_list_conversations(
    State(app): State<App>,
) -> Result<Json<Vec<ConversationView>>, AppError> {
    let conversations = app.store.list_conversations().await?;
    Ok(Json(conversations.into_iter().map(Into::into).collect()))
}

async fn handle_delete_conversation(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if app.store.soft_delete_conversation(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("conversation not found: {}", id)))
    }
}

async fn handle_list_messages(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageView>>, AppError> {
    if !app.store.conversation_exists(&id).await? {
        return Err(not_found(format!("conversation not found: {}", id)));
    }
    let messages = app.store.list_messages(&id).await?;
    Ok(Json(messages.into_iter().map(Into::into).collect()))
}

/// `POST /documents`: accepts the file and returns while processing runs in
/// the background.
async fn handle_upload(
    State(app): State<App>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut conversation_id: Option<String> = None;
    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(multipart_error(e)),
        };

        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("conversation_id") => {
                let text = field.text().await.map_err(multipart_error)?;
                conversation_id = Some(text.trim().to_string());
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_error)?;
                file = Some((filename, content_type, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let conversation_id = conversation_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| bad_request("missing required field: conversation_id"))?;
    let (filename, content_type, bytes) =
        file.ok_or_else(|| bad_request("missing required field: file"))?;

    let document = ingest::upload(
        &app,
        &conversation_id,
        &filename,
        content_type.as_deref(),
        &bytes,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            document_id: document.id,
            status: document.status.to_string(),
        }),
    ))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "file_too_large", err.body_text())
    } else {
        bad_request(err.body_text())
    }
}

#[derive(Deserialize)]
struct DocumentsQuery {
    conversation_id: String,
}

async fn handle_list_documents(
    State(app): State<App>,
    Query(query): Query<DocumentsQuery>,
) -> Result<Json<Vec<DocumentView>>, AppError> {
    let documents = app.store.list_documents(&query.conversation_id).await?;
    Ok(Json(documents.into_iter().map(Into::into).collect()))
}

async fn handle_get_document(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError> {
    let document = app
        .store
        .get_document(&id)
        .await?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))?;
    Ok(Json(document.into()))
}

async fn handle_delete_document(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if app.store.soft_delete_document(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("document not found: {}", id)))
    }
}

async fn handle_fail_document(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError> {
    let document = app
        .store
        .get_document(&id)
        .await?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))?;

    if !ingest::force_fail(&app.store, &id).await? {
        return Err(AppError::new(
            StatusCode::CONFLICT,
            "invalid_state",
            format!("document {} is already {}", id, document.status),
        ));
    }

    let document = app
        .store
        .get_document(&id)
        .await?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))?;
    Ok(Json(document.into()))
}

#[derive(Deserialize)]
struct ChatRequest {
    conversation_id: String,
    message: String,
}

async fn handle_chat(
    State(app): State<App>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<Answer>, AppError> {
    let answer = answer(&app, &request.conversation_id, &request.message).await?;
    Ok(Json(answer))
}
