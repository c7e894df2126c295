//! Core data models used throughout docqa.
//!
//! These types represent the conversations, documents, chunks, and messages
//! that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Csv,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Csv => "csv",
        }
    }

    /// Whether a unit of this format may fall back to its raw text when
    /// normalization is exhausted.
    ///
    /// Prose survives unnormalized; a CSV row serialized as raw text would
    /// misrepresent the record, so CSV has no fallback.
    pub fn tolerates_degraded_fallback(&self) -> bool {
        match self {
            FileType::Pdf => true,
            FileType::Csv => false,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(FileType::Pdf),
            "csv" => Ok(FileType::Csv),
            other => anyhow::bail!("unknown file type: {}", other),
        }
    }
}

/// Document lifecycle.
///
/// `uploading → processing → ready`, with `failed` reachable from the two
/// non-terminal states. `ready` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "uploading",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Ready | DocumentStatus::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(DocumentStatus::Uploading),
            "processing" => Ok(DocumentStatus::Processing),
            "ready" => Ok(DocumentStatus::Ready),
            "failed" => Ok(DocumentStatus::Failed),
            other => anyhow::bail!("unknown document status: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: i64,
}

/// Document record stored in SQLite.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub conversation_id: String,
    pub filename: String,
    pub file_type: FileType,
    pub status: DocumentStatus,
    pub storage_path: Option<String>,
    pub processing_started_at: Option<i64>,
    pub processing_attempts: i64,
    pub error_reason: Option<String>,
    pub created_at: i64,
}

/// Where a chunk came from in its source document.
///
/// PDF chunks carry a page number, CSV chunks a row index; never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkMetadata {
    Page { page_number: u32 },
    Row { row_index: u32 },
}

impl ChunkMetadata {
    pub fn page_number(&self) -> Option<u32> {
        match self {
            ChunkMetadata::Page { page_number } => Some(*page_number),
            ChunkMetadata::Row { .. } => None,
        }
    }

    pub fn row_index(&self) -> Option<u32> {
        match self {
            ChunkMetadata::Row { row_index } => Some(*row_index),
            ChunkMetadata::Page { .. } => None,
        }
    }

    /// Key/value pairs handed to the normalizer prompt and cache key.
    pub fn prompt_fields(&self) -> serde_json::Value {
        match self {
            ChunkMetadata::Page { page_number } => serde_json::json!({ "page": page_number }),
            ChunkMetadata::Row { row_index } => serde_json::json!({ "row": row_index }),
        }
    }
}

/// A unit of text produced by a format parser, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct TextUnit {
    pub text: String,
    pub position: ChunkMetadata,
}

/// A retrieval-sized piece of a document.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub conversation_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// A chunk returned by similarity search.
#[derive(Debug, Clone)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => anyhow::bail!("unknown message role: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

/// Attribution for one chunk used to answer a question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub document_id: String,
    pub chunk_id: String,
    pub similarity: f64,
}
