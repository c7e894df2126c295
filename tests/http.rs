//! HTTP-level tests: the OpenAI-compatible clients against a local fake API,
//! and the docqa router served on an ephemeral port.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use common::{hash_embed, raw_content, HASH_DIMS};
use docqa::app::{App, Providers};
use docqa::config::{Config, EmbeddingConfig};
use docqa::embedding::{Embedder, EmbeddingError, EmbeddingProvider, OpenAIProvider};
use docqa::llm::{ChatMessage, CompletionProvider, OpenAIChat};
use docqa::storage::FsBlobStore;
use docqa::store::SqliteStore;

#[derive(Default)]
struct FakeApi {
    embed_calls: AtomicUsize,
    chat_calls: AtomicUsize,
    /// Number of upcoming embedding requests to reject with a 500.
    failing_embeddings: AtomicUsize,
    null_chat_content: AtomicBool,
    last_auth: Mutex<Option<String>>,
}

async fn fake_embeddings(
    State(api): State<Arc<FakeApi>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    api.embed_calls.fetch_add(1, Ordering::SeqCst);
    *api.last_auth.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if api
        .failing_embeddings
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, "overloaded").into_response();
    }

    let inputs = body["input"].as_array().cloned().unwrap_or_default();
    // Reverse the data array so clients must order by `index`.
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .rev()
        .map(|(i, text)| {
            json!({
                "object": "embedding",
                "index": i,
                "embedding": hash_embed(text.as_str().unwrap_or_default()),
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

async fn fake_chat(State(api): State<Arc<FakeApi>>, Json(body): Json<Value>) -> Response {
    api.chat_calls.fetch_add(1, Ordering::SeqCst);
    if api.null_chat_content.load(Ordering::SeqCst) {
        return Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": null } }]
        }))
        .into_response();
    }

    let last = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();
    let content = raw_content(&last).to_string();
    Json(json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    }))
    .into_response()
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn start_fake_api() -> (Arc<FakeApi>, String) {
    let api = Arc::new(FakeApi::default());
    let router = Router::new()
        .route("/v1/embeddings", post(fake_embeddings))
        .route("/v1/chat/completions", post(fake_chat))
        .with_state(api.clone());
    let addr = serve(router).await;
    (api, format!("http://{}/v1", addr))
}

fn embedder_config(batch_size: usize, max_retries: u32) -> EmbeddingConfig {
    EmbeddingConfig {
        batch_size,
        max_retries,
        retry_backoff_ms: 1,
        ..EmbeddingConfig::default()
    }
}

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn openai_embeddings_follow_input_order_and_send_the_key() {
    let (api, base) = start_fake_api().await;
    let provider = OpenAIProvider::with_endpoint(
        &base,
        Some("test-key".to_string()),
        "fake-embed",
        Some(HASH_DIMS),
        5,
    )
    .unwrap();

    let input = texts(&["alpha beta", "gamma", "delta epsilon zeta"]);
    let vectors = provider.embed(&input).await.unwrap();

    assert_eq!(vectors.len(), 3);
    for (text, vector) in input.iter().zip(&vectors) {
        assert_eq!(vector, &hash_embed(text));
    }
    assert_eq!(
        api.last_auth.lock().unwrap().as_deref(),
        Some("Bearer test-key")
    );
}

#[tokio::test]
async fn embedder_splits_batches_and_keeps_order() {
    let (api, base) = start_fake_api().await;
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(
        OpenAIProvider::with_endpoint(&base, None, "fake-embed", Some(HASH_DIMS), 5).unwrap(),
    );
    let embedder = Embedder::new(provider, &embedder_config(2, 0));

    let input = texts(&["one", "two", "three", "four", "five"]);
    let vectors = embedder.embed_all(&input).await.unwrap();

    assert_eq!(api.embed_calls.load(Ordering::SeqCst), 3);
    assert_eq!(vectors.len(), 5);
    assert_eq!(vectors[4], hash_embed("five"));
}

#[tokio::test]
async fn embedder_retries_transient_http_failures() {
    let (api, base) = start_fake_api().await;
    api.failing_embeddings.store(1, Ordering::SeqCst);
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(
        OpenAIProvider::with_endpoint(&base, None, "fake-embed", Some(HASH_DIMS), 5).unwrap(),
    );
    let embedder = Embedder::new(provider, &embedder_config(50, 2));

    let vectors = embedder.embed_all(&texts(&["hello"])).await.unwrap();
    assert_eq!(vectors.len(), 1);
    assert_eq!(api.embed_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn embedder_gives_up_after_its_retries() {
    let (api, base) = start_fake_api().await;
    api.failing_embeddings.store(10, Ordering::SeqCst);
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(
        OpenAIProvider::with_endpoint(&base, None, "fake-embed", Some(HASH_DIMS), 5).unwrap(),
    );
    let embedder = Embedder::new(provider, &embedder_config(50, 1));

    let err = embedder.embed_all(&texts(&["hello"])).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::Exhausted { attempts: 2, .. }));
    assert!(err.to_string().contains("500"));
    assert_eq!(api.embed_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn wrong_dimensions_are_not_retried() {
    let (api, base) = start_fake_api().await;
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(
        OpenAIProvider::with_endpoint(&base, None, "fake-embed", Some(3), 5).unwrap(),
    );
    let embedder = Embedder::new(provider, &embedder_config(50, 3));

    let err = embedder.embed_all(&texts(&["hello"])).await.unwrap_err();
    assert!(err.is_consistency());
    assert_eq!(api.embed_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn chat_completion_reads_the_first_choice() {
    let (api, base) = start_fake_api().await;
    let chat = OpenAIChat::new(&base, Some("k".to_string()), "fake-chat", 5).unwrap();

    let reply = chat
        .complete(&[ChatMessage::user("  echo me  ")], 0.0)
        .await
        .unwrap();
    assert_eq!(reply, "echo me");

    api.null_chat_content.store(true, Ordering::SeqCst);
    let reply = chat.complete(&[ChatMessage::user("x")], 0.0).await.unwrap();
    assert_eq!(reply, "");
    assert_eq!(api.chat_calls.load(Ordering::SeqCst), 2);
}

// ============ docqa HTTP API ============

struct Server {
    _tmp: TempDir,
    base: String,
    client: reqwest::Client,
}

async fn start_docqa() -> Server {
    let (_api, provider_base) = start_fake_api().await;
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("docqa.sqlite"));
    config.storage.root = tmp.path().join("blobs");

    let pool = docqa::db::connect(&config).await.unwrap();
    docqa::migrate::run_migrations(&pool).await.unwrap();

    let providers = Providers {
        embedding: Arc::new(
            OpenAIProvider::with_endpoint(&provider_base, None, "fake-embed", Some(HASH_DIMS), 5)
                .unwrap(),
        ),
        normalizer: Arc::new(OpenAIChat::new(&provider_base, None, "fake-normalizer", 5).unwrap()),
        chat: Arc::new(OpenAIChat::new(&provider_base, None, "fake-chat", 5).unwrap()),
    };
    let blobs = Arc::new(FsBlobStore::new(config.storage.root.clone()));
    let app = App::new(config, SqliteStore::new(pool), blobs, providers);

    let addr = serve(docqa::server::router(app)).await;
    Server {
        _tmp: tmp,
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
    }
}

impl Server {
    async fn create_conversation(&self) -> String {
        let resp = self
            .client
            .post(format!("{}/conversations", self.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    async fn upload(
        &self,
        conversation_id: &str,
        filename: &str,
        mime: &str,
        bytes: &[u8],
    ) -> reqwest::Response {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime)
            .unwrap();
        let form = reqwest::multipart::Form::new()
            .text("conversation_id", conversation_id.to_string())
            .part("file", part);
        self.client
            .post(format!("{}/documents", self.base))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    async fn get_json(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn wait_for_status(&self, document_id: &str) -> Value {
        for _ in 0..500 {
            let (_, doc) = self.get_json(&format!("/documents/{}", document_id)).await;
            if doc["status"] == "ready" || doc["status"] == "failed" {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("document {} never finished processing", document_id);
    }
}

#[tokio::test]
async fn http_api_upload_and_chat() {
    let server = start_docqa().await;

    let (status, health) = server.get_json("/health").await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "ok");

    let conversation_id = server.create_conversation().await;

    let resp = server
        .upload(&conversation_id, "record.csv", "text/csv", b"name,price\nwidget,9.99\n")
        .await;
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "processing");
    let document_id = body["document_id"].as_str().unwrap().to_string();

    let doc = server.wait_for_status(&document_id).await;
    assert_eq!(doc["status"], "ready", "{}", doc);
    assert_eq!(doc["file_type"], "csv");
    assert_eq!(doc["processing_attempts"], 1);

    let resp = server
        .client
        .post(format!("{}/chat", server.base))
        .json(&json!({
            "conversation_id": conversation_id,
            "message": "Name and price of the widget record?",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let reply: Value = resp.json().await.unwrap();
    assert!(reply["answer"].as_str().unwrap().contains("9.99"), "{}", reply);
    let sources = reply["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["document_id"], document_id.as_str());

    let (_, messages) = server
        .get_json(&format!("/conversations/{}/messages", conversation_id))
        .await;
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");

    let resp = server
        .client
        .post(format!("{}/documents/{}/fail", server.base, document_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "invalid_state");
}

#[tokio::test]
async fn http_api_error_envelope() {
    let server = start_docqa().await;
    let conversation_id = server.create_conversation().await;

    let resp = server
        .upload(&conversation_id, "photo.png", "image/png", b"\x89PNG")
        .await;
    assert_eq!(resp.status(), 415);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "unsupported_type");

    let resp = server
        .upload(&conversation_id, "broken.pdf", "application/pdf", b"not a pdf at all")
        .await;
    assert_eq!(resp.status(), 422);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "invalid_pdf");

    let resp = server
        .upload(&conversation_id, "a.csv", "text/csv", b"id\n1\n")
        .await;
    assert_eq!(resp.status(), 201);
    let resp = server
        .upload(&conversation_id, "b.csv", "text/csv", b"id\n2\n")
        .await;
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "document_exists");

    let (status, err) = server.get_json("/documents/does-not-exist").await;
    assert_eq!(status, 404);
    assert_eq!(err["error"]["code"], "not_found");

    let resp = server
        .client
        .post(format!("{}/chat", server.base))
        .json(&json!({ "conversation_id": "missing", "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = server
        .client
        .post(format!("{}/chat", server.base))
        .json(&json!({ "conversation_id": conversation_id, "message": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
