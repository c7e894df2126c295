//! Ingestion orchestration.
//!
//! Upload: validate → insert (`uploading`) → store blob → `processing`,
//! then the pipeline runs in a background task. The pipeline itself:
//! acquire lock → read blob → parse → normalize (bounded concurrency) →
//! chunk → replace chunks → embed → write embeddings → `ready`.
//!
//! Any failure after the lock is taken is persisted as `failed` with a
//! reason before the error reaches the caller.

use anyhow::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::fmt;

use crate::app::App;
use crate::chunk::chunk_units;
use crate::error::{PipelineError, UploadError};
use crate::models::{Document, DocumentStatus, TextUnit};
use crate::parse::parse_document_blocking;
use crate::storage::blob_key;
use crate::store::{InsertOutcome, LockOutcome, SqliteStore};
use crate::validate::validate_upload;

pub const NO_CHUNKS_REASON: &str = "No chunks generated";
pub const FORCE_FAIL_REASON: &str = "Manually marked as failed by operator";
pub const STALE_UPLOAD_REASON: &str = "Upload did not complete";

/// Result of one [`process_document`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Ready { chunks: usize },
    /// The run ended with the document in `failed`.
    Failed { reason: String },
    /// Another worker holds the lock or the document is not `processing`.
    Skipped,
    /// The attempt ceiling was reached and the document was force-failed.
    Exhausted,
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessOutcome::Ready { chunks } => write!(f, "ready ({} chunks)", chunks),
            ProcessOutcome::Failed { reason } => write!(f, "failed: {}", reason),
            ProcessOutcome::Skipped => f.write_str("skipped (locked or not processing)"),
            ProcessOutcome::Exhausted => f.write_str("failed: attempt limit reached"),
        }
    }
}

/// Accept an upload and start processing it in the background.
///
/// Returns once the blob is stored and the document is `processing`.
/// Acceptance runs in its own task: dropping the returned future (a client
/// disconnect) does not interrupt it, so the document still leaves
/// `uploading`.
pub async fn upload(
    app: &App,
    conversation_id: &str,
    filename: &str,
    content_type: Option<&str>,
    bytes: &[u8],
) -> Result<Document, UploadError> {
    let app = app.clone();
    let conversation_id = conversation_id.to_string();
    let filename = filename.to_string();
    let content_type = content_type.map(str::to_string);
    let bytes = bytes.to_vec();

    tokio::spawn(async move {
        let document = accept_owned(
            &app,
            &conversation_id,
            &filename,
            content_type.as_deref(),
            bytes,
        )
        .await?;
        spawn_processing(app, document.id.clone());
        Ok::<_, UploadError>(document)
    })
    .await
    .map_err(|e| UploadError::Internal(anyhow::anyhow!("upload task failed: {}", e)))?
}

/// Validate, record, and store an upload without running the pipeline.
pub async fn accept_upload(
    app: &App,
    conversation_id: &str,
    filename: &str,
    content_type: Option<&str>,
    bytes: &[u8],
) -> Result<Document, UploadError> {
    accept_owned(app, conversation_id, filename, content_type, bytes.to_vec()).await
}

async fn accept_owned(
    app: &App,
    conversation_id: &str,
    filename: &str,
    content_type: Option<&str>,
    bytes: Vec<u8>,
) -> Result<Document, UploadError> {
    let (validated, bytes) = {
        let ingestion = app.config.ingestion.clone();
        let content_type = content_type.map(str::to_string);
        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || {
            let validated =
                validate_upload(&ingestion, &bytes, content_type.as_deref(), &filename);
            (validated, bytes)
        })
        .await
        .map_err(|e| UploadError::Internal(anyhow::anyhow!("upload validation failed: {}", e)))?
    };
    let file_type = validated?;

    let mut document = match app
        .store
        .insert_document(conversation_id, filename, file_type)
        .await?
    {
        InsertOutcome::Inserted(document) => document,
        InsertOutcome::ConversationMissing => {
            return Err(UploadError::ConversationNotFound(conversation_id.to_string()))
        }
        InsertOutcome::AlreadyAttached => {
            return Err(UploadError::DocumentAlreadyAttached(
                conversation_id.to_string(),
            ))
        }
    };

    let key = blob_key(conversation_id, &document.id, filename);
    if let Err(e) = app.blobs.put(&key, &bytes).await {
        let reason = format!("Failed to store file: {:#}", e);
        if let Err(mark_err) = app.store.mark_failed(&document.id, &reason).await {
            tracing::error!(
                document_id = %document.id,
                error = %mark_err,
                "could not record blob storage failure"
            );
        }
        return Err(UploadError::Storage {
            document_id: document.id,
            source: e,
        });
    }

    let recorded = match app.store.mark_uploaded(&document.id, &key).await {
        Ok(recorded) => recorded,
        Err(e) => {
            let reason = format!("Failed to record stored file: {:#}", e);
            if let Err(mark_err) = app.store.mark_failed(&document.id, &reason).await {
                tracing::error!(
                    document_id = %document.id,
                    error = %mark_err,
                    "could not record upload failure; recovery will fail it later"
                );
            }
            remove_orphaned_blob(app, &document.id, &key).await;
            return Err(UploadError::Internal(e));
        }
    };
    if !recorded {
        // Force-failed while the blob was being written; nothing references it.
        remove_orphaned_blob(app, &document.id, &key).await;
        return Err(UploadError::Internal(anyhow::anyhow!(
            "document {} left the uploading state before its blob was recorded",
            document.id
        )));
    }

    tracing::info!(
        document_id = %document.id,
        conversation_id,
        file_type = %file_type,
        bytes = bytes.len(),
        "upload accepted"
    );

    document.status = DocumentStatus::Processing;
    document.storage_path = Some(key);
    Ok(document)
}

async fn remove_orphaned_blob(app: &App, document_id: &str, key: &str) {
    if let Err(e) = app.blobs.delete(key).await {
        tracing::warn!(document_id, error = %e, "could not remove orphaned blob");
    }
}

/// Run [`process_document`] on the runtime without awaiting it.
pub fn spawn_processing(app: App, document_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match process_document(&app, &document_id).await {
            Ok(outcome) => tracing::info!(document_id = %document_id, %outcome, "processing finished"),
            Err(e) => tracing::error!(document_id = %document_id, error = ?e, "processing failed"),
        }
    })
}

/// Run the pipeline for one document if this caller wins the processing
/// lock.
///
/// Lock contention is not an error: it yields [`ProcessOutcome::Skipped`].
/// A pipeline error marks the document `failed` and is then returned.
pub async fn process_document(app: &App, document_id: &str) -> Result<ProcessOutcome> {
    let ingestion = &app.config.ingestion;
    let document = match app
        .store
        .acquire_processing_lock(
            document_id,
            ingestion.max_processing_attempts,
            ingestion.lock_stale_secs,
        )
        .await?
    {
        LockOutcome::Acquired(document) => document,
        LockOutcome::Busy => {
            tracing::debug!(document_id, "processing lock not acquired");
            return Ok(ProcessOutcome::Skipped);
        }
        LockOutcome::Exhausted => {
            tracing::warn!(
                document_id,
                max_attempts = ingestion.max_processing_attempts,
                "attempt limit reached; document failed"
            );
            return Ok(ProcessOutcome::Exhausted);
        }
    };

    tracing::info!(
        document_id,
        attempt = document.processing_attempts,
        file_type = %document.file_type,
        "processing started"
    );

    match run_pipeline(app, &document).await {
        Ok(0) => {
            app.store.mark_failed(document_id, NO_CHUNKS_REASON).await?;
            Ok(ProcessOutcome::Failed {
                reason: NO_CHUNKS_REASON.to_string(),
            })
        }
        Ok(chunks) => {
            if !app.store.mark_ready(document_id).await? {
                anyhow::bail!(
                    "document {} left the processing state before it could be marked ready",
                    document_id
                );
            }
            Ok(ProcessOutcome::Ready { chunks })
        }
        Err(e) => {
            let reason = e.to_string();
            if let Err(mark_err) = app.store.mark_failed(document_id, &reason).await {
                tracing::error!(
                    document_id,
                    error = %mark_err,
                    "could not record pipeline failure"
                );
            }
            Err(anyhow::Error::new(e).context(format!("processing document {}", document_id)))
        }
    }
}

/// Parse, normalize, chunk, embed, and persist. Returns the number of
/// chunks stored; `0` means nothing was stored.
///
/// Running this twice for the same document replaces the first run's
/// chunks entirely.
pub async fn run_pipeline(app: &App, document: &Document) -> Result<usize, PipelineError> {
    let key = document
        .storage_path
        .as_deref()
        .ok_or(PipelineError::MissingStoragePath)?;
    let bytes = app.blobs.get(key).await.map_err(PipelineError::Blob)?;

    let units = parse_document_blocking(
        document.file_type,
        bytes,
        document.filename.clone(),
        app.config.ingestion.max_csv_rows,
    )
    .await
    .map_err(|e| PipelineError::ParserTask(e.to_string()))??;
    tracing::debug!(document_id = %document.id, units = units.len(), "parsed");

    let normalized = normalize_units(app, document, units).await?;

    let chunks = chunk_units(
        &normalized,
        document.file_type,
        &document.id,
        &document.conversation_id,
        &app.config.chunking,
    );
    if chunks.is_empty() {
        return Ok(0);
    }
    let max_chunks = app.config.chunking.max_chunks;
    if chunks.len() > max_chunks {
        return Err(PipelineError::TooManyChunks {
            found: chunks.len(),
            max: max_chunks,
        });
    }

    app.store
        .replace_chunks(&document.id, &chunks)
        .await
        .map_err(PipelineError::Store)?;

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let vectors = app.embedder.embed_all(&texts).await.map_err(|e| {
        if e.is_consistency() {
            PipelineError::Consistency(e.to_string())
        } else {
            PipelineError::Embedding(e.into())
        }
    })?;

    let pairs: Vec<(String, Vec<f32>)> = chunks
        .iter()
        .map(|c| c.id.clone())
        .zip(vectors)
        .collect();
    let updated = app
        .store
        .set_embeddings(&pairs)
        .await
        .map_err(PipelineError::Store)?;
    if updated != chunks.len() as u64 {
        return Err(PipelineError::Consistency(format!(
            "wrote {} embeddings for {} chunks",
            updated,
            chunks.len()
        )));
    }

    tracing::info!(
        document_id = %document.id,
        chunks = chunks.len(),
        model = app.embedder.model_name(),
        "chunks embedded"
    );
    Ok(chunks.len())
}

/// Normalize every unit with at most `normalizer.concurrency` calls in
/// flight, returning them in their original order.
async fn normalize_units(
    app: &App,
    document: &Document,
    units: Vec<TextUnit>,
) -> Result<Vec<TextUnit>, PipelineError> {
    let normalizer = &app.normalizer;
    let file_type = document.file_type;

    let mut indexed: Vec<(usize, TextUnit)> = stream::iter(units.into_iter().enumerate())
        .map(|(i, unit)| async move {
            let text = normalizer
                .normalize(&unit.text, file_type, &unit.position)
                .await?;
            Ok::<_, PipelineError>((
                i,
                TextUnit {
                    text,
                    position: unit.position,
                },
            ))
        })
        .buffer_unordered(normalizer.concurrency())
        .try_collect()
        .await?;

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, unit)| unit).collect())
}

/// Operator override: fail an `uploading` or `processing` document,
/// regardless of any lock. Returns `false` if it was already terminal or
/// does not exist.
pub async fn force_fail(store: &SqliteStore, document_id: &str) -> Result<bool> {
    let changed = store.mark_failed(document_id, FORCE_FAIL_REASON).await?;
    if changed {
        tracing::warn!(document_id, "document force-failed by operator");
    }
    Ok(changed)
}

/// Fail `uploading` documents older than the lock stale window, then re-run
/// every `processing` document whose lock is absent or stale.
pub async fn recover(app: &App) -> Result<Vec<(String, ProcessOutcome)>> {
    let stale_secs = app.config.ingestion.lock_stale_secs;
    let mut results: Vec<(String, ProcessOutcome)> = app
        .store
        .fail_stale_uploads(stale_secs, STALE_UPLOAD_REASON)
        .await?
        .into_iter()
        .map(|id| {
            tracing::warn!(document_id = %id, "stale upload failed");
            (
                id,
                ProcessOutcome::Failed {
                    reason: STALE_UPLOAD_REASON.to_string(),
                },
            )
        })
        .collect();

    let ids = app.store.recoverable_documents(stale_secs).await?;
    for id in ids {
        let outcome = match process_document(app, &id).await {
            Ok(outcome) => outcome,
            Err(e) => ProcessOutcome::Failed {
                reason: format!("{:#}", e),
            },
        };
        results.push((id, outcome));
    }
    Ok(results)
}
