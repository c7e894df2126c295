//! Shared fakes and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use docqa::app::{App, Providers};
use docqa::config::Config;
use docqa::embedding::{Embedder, EmbeddingProvider};
use docqa::llm::{ChatMessage, CompletionProvider};
use docqa::models::Document;
use docqa::storage::{BlobStore, FsBlobStore};
use docqa::store::SqliteStore;

pub const HASH_DIMS: usize = 512;

/// Bag-of-words embedding: each lowercase alphanumeric token is hashed into
/// one of [`HASH_DIMS`] buckets. Texts sharing words are similar.
pub struct HashEmbedder;

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dims(&self) -> Option<usize> {
        Some(HASH_DIMS)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; HASH_DIMS];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        v[fnv1a(token) % HASH_DIMS] += 1.0;
    }
    v
}

fn fnv1a(s: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash as usize
}

/// Embedding provider that is always down.
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }

    fn dims(&self) -> Option<usize> {
        None
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding service unavailable")
    }
}

/// Returns one vector fewer than it was asked for.
pub struct DroppingEmbedder;

#[async_trait]
impl EmbeddingProvider for DroppingEmbedder {
    fn model_name(&self) -> &str {
        "dropping"
    }

    fn dims(&self) -> Option<usize> {
        Some(HASH_DIMS)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors: Vec<Vec<f32>> = texts.iter().map(|t| hash_embed(t)).collect();
        vectors.pop();
        Ok(vectors)
    }
}

/// Filesystem blob store whose writes take `delay` to start.
pub struct SlowBlobStore {
    pub inner: FsBlobStore,
    pub delay: Duration,
}

#[async_trait]
impl BlobStore for SlowBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}

/// How a [`FakeModel`] answers.
#[derive(Clone, Copy)]
pub enum Behavior {
    /// Normalizer: return the raw content from the prompt unchanged.
    Identity,
    /// Chat: return the whole user message (context and question).
    Echo,
    /// Always error.
    Fail,
}

pub struct FakeModel {
    behavior: Behavior,
    pub calls: AtomicUsize,
}

impl FakeModel {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for FakeModel {
    fn model_name(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, messages: &[ChatMessage], _temperature: f32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let user = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        match self.behavior {
            Behavior::Identity => Ok(raw_content(user).to_string()),
            Behavior::Echo => Ok(user.to_string()),
            Behavior::Fail => anyhow::bail!("model unavailable"),
        }
    }
}

/// The raw unit text embedded in a normalizer prompt.
pub fn raw_content(prompt: &str) -> &str {
    let after = prompt.split_once("Raw content:\n").map(|(_, r)| r).unwrap_or(prompt);
    after
        .rsplit_once("\n\nRewrite the content")
        .map(|(raw, _)| raw)
        .unwrap_or(after)
}

pub struct Harness {
    pub tmp: TempDir,
    pub app: App,
    pub normalizer: Arc<FakeModel>,
    pub chat: Arc<FakeModel>,
}

impl Harness {
    pub fn store(&self) -> &SqliteStore {
        &self.app.store
    }

    /// The harness app with its embedding provider swapped out.
    pub fn app_with_embedder(&self, provider: Arc<dyn EmbeddingProvider>) -> App {
        App {
            embedder: Embedder::new(provider, &self.app.config.embedding),
            ..self.app.clone()
        }
    }

    /// The harness app with writes delayed by `delay`.
    pub fn app_with_slow_blobs(&self, delay: Duration) -> App {
        App {
            blobs: Arc::new(SlowBlobStore {
                inner: FsBlobStore::new(self.app.config.storage.root.clone()),
                delay,
            }),
            ..self.app.clone()
        }
    }
}

pub async fn harness(normalizer: Behavior, chat: Behavior) -> Harness {
    harness_with(normalizer, chat, |_| {}).await
}

pub async fn harness_with(
    normalizer: Behavior,
    chat: Behavior,
    tweak: impl FnOnce(&mut Config),
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("data").join("docqa.sqlite"));
    config.storage.root = tmp.path().join("blobs");
    config.embedding.retry_backoff_ms = 1;
    tweak(&mut config);

    let pool = docqa::db::connect(&config).await.unwrap();
    docqa::migrate::run_migrations(&pool).await.unwrap();

    let normalizer = FakeModel::new(normalizer);
    let chat = FakeModel::new(chat);
    let providers = Providers {
        embedding: Arc::new(HashEmbedder),
        normalizer: normalizer.clone(),
        chat: chat.clone(),
    };
    let blobs = Arc::new(FsBlobStore::new(config.storage.root.clone()));
    let app = App::new(config, SqliteStore::new(pool), blobs, providers);

    Harness {
        tmp,
        app,
        normalizer,
        chat,
    }
}

/// Poll until the document reaches `ready` or `failed`.
pub async fn wait_for_terminal(store: &SqliteStore, id: &str) -> Document {
    for _ in 0..500 {
        let doc = store.get_document(id).await.unwrap().unwrap();
        if doc.status.is_terminal() {
            return doc;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("document {} never reached a terminal state", id);
}

/// A PDF with one page of text per entry in `pages`, built with lopdf.
pub fn make_pdf(pages: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => count,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}
