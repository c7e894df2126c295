//! SQLite-backed store for conversations, documents, chunks, caches, and
//! messages.
//!
//! Every document status change is a single conditional `UPDATE` (a
//! compare-and-set on the current status), so concurrent workers and
//! processes sharing the database observe atomic transitions.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{
    Chunk, ChunkMatch, ChunkMetadata, Conversation, Document, DocumentStatus, Message, Role,
};

const DOCUMENT_COLUMNS: &str = "id, conversation_id, filename, file_type, status, storage_path, \
     processing_started_at, processing_attempts, error_reason, created_at";

/// Result of trying to attach a new document to a conversation.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Document),
    ConversationMissing,
    /// The conversation already has a non-deleted document.
    AlreadyAttached,
}

/// Result of a processing-lock acquisition attempt.
#[derive(Debug)]
pub enum LockOutcome {
    /// This caller owns the run. Carries the document as updated by the lock.
    Acquired(Document),
    /// Another worker holds the lock, or the document is not `processing`.
    Busy,
    /// The attempt ceiling was reached; the document has been force-failed.
    Exhausted,
}

/// A persisted chunk and its embedding, if one has been written.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk: Chunk,
    pub embedding: Option<Vec<f32>>,
}

/// SQLite implementation of the document store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Conversations ============

    pub async fn create_conversation(&self) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            created_at: now(),
        };
        sqlx::query("INSERT INTO conversations (id, created_at) VALUES (?, ?)")
            .bind(&conversation.id)
            .bind(conversation.created_at)
            .execute(&self.pool)
            .await?;
        Ok(conversation)
    }

    pub async fn conversation_exists(&self, id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM conversations WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT id, created_at FROM conversations WHERE deleted_at IS NULL \
             ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Conversation {
                id: row.get("id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Soft-delete a conversation. Documents, chunks, and messages are left
    /// in place. Returns `false` if it was missing or already deleted.
    pub async fn soft_delete_conversation(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ============ Documents ============

    /// Insert a document in `uploading` state, unless the conversation is
    /// missing or already has a non-deleted document. The checks and the
    /// insert are one statement.
    pub async fn insert_document(
        &self,
        conversation_id: &str,
        filename: &str,
        file_type: crate::models::FileType,
    ) -> Result<InsertOutcome> {
        let id = Uuid::new_v4().to_string();
        let created_at = now();

        let result = sqlx::query(
            r#"
            INSERT INTO documents (id, conversation_id, filename, file_type, status,
                                   processing_attempts, created_at)
            SELECT ?, ?, ?, ?, 'uploading', 0, ?
            WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ? AND deleted_at IS NULL)
              AND NOT EXISTS (SELECT 1 FROM documents
                              WHERE conversation_id = ? AND deleted_at IS NULL)
            "#,
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(filename)
        .bind(file_type.as_str())
        .bind(created_at)
        .bind(conversation_id)
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return if self.conversation_exists(conversation_id).await? {
                Ok(InsertOutcome::AlreadyAttached)
            } else {
                Ok(InsertOutcome::ConversationMissing)
            };
        }

        Ok(InsertOutcome::Inserted(Document {
            id,
            conversation_id: conversation_id.to_string(),
            filename: filename.to_string(),
            file_type,
            status: DocumentStatus::Uploading,
            storage_path: None,
            processing_started_at: None,
            processing_attempts: 0,
            error_reason: None,
            created_at,
        }))
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ? AND deleted_at IS NULL",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    /// Non-deleted documents of a conversation, newest first.
    pub async fn list_documents(&self, conversation_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE conversation_id = ? AND deleted_at IS NULL \
             ORDER BY created_at DESC, rowid DESC",
            DOCUMENT_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(document_from_row).collect()
    }

    pub async fn soft_delete_document(&self, id: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE documents SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
                .bind(now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `uploading → processing`, recording where the blob was stored.
    pub async fn mark_uploaded(&self, id: &str, storage_path: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'processing', storage_path = ? \
             WHERE id = ? AND status = 'uploading'",
        )
        .bind(storage_path)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Try to become the single worker processing a document.
    ///
    /// Succeeds only while the document is `processing`, under the attempt
    /// ceiling, and not held by a live worker (no lock, or a lock older than
    /// `stale_secs`). Success stamps `processing_started_at` and increments
    /// `processing_attempts` in the same statement; failure changes nothing,
    /// except that a document at the attempt ceiling with no live holder is
    /// force-failed.
    pub async fn acquire_processing_lock(
        &self,
        id: &str,
        max_attempts: i64,
        stale_secs: i64,
    ) -> Result<LockOutcome> {
        let now = now();
        let stale_before = now - stale_secs;

        let row = sqlx::query(&format!(
            r#"
            UPDATE documents
            SET processing_started_at = ?, processing_attempts = processing_attempts + 1
            WHERE id = ?
              AND status = 'processing'
              AND deleted_at IS NULL
              AND processing_attempts < ?
              AND (processing_started_at IS NULL OR processing_started_at <= ?)
            RETURNING {}
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(now)
        .bind(id)
        .bind(max_attempts)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(LockOutcome::Acquired(document_from_row(&row)?));
        }

        let exhausted = sqlx::query(
            r#"
            UPDATE documents
            SET status = 'failed', error_reason = ?
            WHERE id = ?
              AND status = 'processing'
              AND processing_attempts >= ?
              AND (processing_started_at IS NULL OR processing_started_at <= ?)
            "#,
        )
        .bind(format!(
            "Exceeded maximum processing attempts ({})",
            max_attempts
        ))
        .bind(id)
        .bind(max_attempts)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        if exhausted.rows_affected() == 1 {
            Ok(LockOutcome::Exhausted)
        } else {
            Ok(LockOutcome::Busy)
        }
    }

    /// `processing → ready`.
    pub async fn mark_ready(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'ready', error_reason = NULL \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `uploading | processing → failed` with a reason. Ignores the lock.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'failed', error_reason = ? \
             WHERE id = ? AND status IN ('uploading', 'processing')",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Ids of `processing` documents with no live lock holder.
    pub async fn recoverable_documents(&self, stale_secs: i64) -> Result<Vec<String>> {
        let stale_before = now() - stale_secs;
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM documents
            WHERE status = 'processing'
              AND deleted_at IS NULL
              AND (processing_started_at IS NULL OR processing_started_at <= ?)
            ORDER BY created_at
            "#,
        )
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Fail `uploading` documents created more than `stale_secs` ago whose
    /// acceptance never finished. Returns the ids that were failed.
    pub async fn fail_stale_uploads(&self, stale_secs: i64, reason: &str) -> Result<Vec<String>> {
        let stale_before = now() - stale_secs;
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM documents
            WHERE status = 'uploading'
              AND deleted_at IS NULL
              AND created_at <= ?
            ORDER BY created_at
            "#,
        )
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;

        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            if self.mark_failed(&id, reason).await? {
                failed.push(id);
            }
        }
        Ok(failed)
    }

    /// Ids of the conversation's `ready`, non-deleted documents, sorted.
    pub async fn ready_document_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE conversation_id = ? AND status = 'ready' \
             AND deleted_at IS NULL ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    // ============ Chunks ============

    /// Replace every chunk of a document in one transaction.
    pub async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let created_at = now();
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, conversation_id, chunk_index, content, \
                 embedding, metadata_json, created_at) VALUES (?, ?, ?, ?, ?, NULL, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.conversation_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Write embeddings for existing chunks. Returns how many chunk rows were
    /// updated; callers compare it with the number of vectors they sent.
    pub async fn set_embeddings(&self, embeddings: &[(String, Vec<f32>)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;

        for (chunk_id, vector) in embeddings {
            let result = sqlx::query("UPDATE chunks SET embedding = ? WHERE id = ?")
                .bind(vec_to_blob(vector))
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
            updated += result.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }

    /// All chunks of a document in `chunk_index` order.
    pub async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, conversation_id, chunk_index, content, embedding, metadata_json \
             FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let metadata_json: String = row.get("metadata_json");
                let metadata: ChunkMetadata = serde_json::from_str(&metadata_json)?;
                let embedding: Option<Vec<u8>> = row.get("embedding");
                Ok(StoredChunk {
                    chunk: Chunk {
                        id: row.get("id"),
                        document_id: row.get("document_id"),
                        conversation_id: row.get("conversation_id"),
                        chunk_index: row.get("chunk_index"),
                        content: row.get("content"),
                        metadata,
                    },
                    embedding: embedding.map(|blob| blob_to_vec(&blob)),
                })
            })
            .collect()
    }

    /// Cosine-similarity search over embedded chunks of the conversation's
    /// `ready` documents. Results are at or above `threshold`, most similar
    /// first, at most `limit` of them.
    pub async fn search_chunks(
        &self,
        conversation_id: &str,
        query_vec: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ChunkMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.content, c.embedding
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.conversation_id = ?
              AND d.status = 'ready'
              AND d.deleted_at IS NULL
              AND c.embedding IS NOT NULL
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut matches: Vec<ChunkMatch> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                (similarity >= threshold).then(|| ChunkMatch {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
                    content: row.get("content"),
                    similarity,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    // ============ Caches ============

    pub async fn get_semantic(&self, raw_hash: &str) -> Result<Option<String>> {
        let text: Option<String> =
            sqlx::query_scalar("SELECT semantic_text FROM semantic_cache WHERE raw_hash = ?")
                .bind(raw_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(text)
    }

    /// Insert-if-absent; an existing key is left untouched.
    pub async fn put_semantic(&self, raw_hash: &str, semantic_text: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO semantic_cache (raw_hash, semantic_text, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(raw_hash) DO NOTHING",
        )
        .bind(raw_hash)
        .bind(semantic_text)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_cached_answer(&self, cache_key: &str) -> Result<Option<String>> {
        let answer: Option<String> =
            sqlx::query_scalar("SELECT answer FROM query_cache WHERE cache_key = ?")
                .bind(cache_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(answer)
    }

    pub async fn put_cached_answer(&self, cache_key: &str, answer: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO query_cache (cache_key, answer, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(cache_key) DO NOTHING",
        )
        .bind(cache_key)
        .bind(answer)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ Messages ============

    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now(),
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, created_at, seq)
            VALUES (?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?))
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .bind(&message.conversation_id)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    /// Messages of a conversation, oldest first.
    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, created_at FROM messages \
             WHERE conversation_id = ? ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role: String = row.get("role");
                Ok(Message {
                    id: row.get("id"),
                    conversation_id: row.get("conversation_id"),
                    role: role.parse()?,
                    content: row.get("content"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let file_type: String = row.get("file_type");
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        filename: row.get("filename"),
        file_type: file_type.parse()?,
        status: status.parse()?,
        storage_path: row.get("storage_path"),
        processing_started_at: row.get("processing_started_at"),
        processing_attempts: row.get("processing_attempts"),
        error_reason: row.get("error_reason"),
        created_at: row.get("created_at"),
    })
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Format a unix timestamp as ISO 8601.
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
