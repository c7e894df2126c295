//! Error taxonomy for ingestion and upload.
//!
//! Plumbing (SQL, HTTP, config) uses `anyhow`; the enums here exist where a
//! caller branches on the kind of failure: the HTTP layer picks a status code,
//! the orchestrator decides what reason to persist.

use thiserror::Error;

/// Format parser failure. Terminal for the document being parsed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid or corrupted PDF file: {0}")]
    InvalidPdf(String),

    #[error("PDF is encrypted and cannot be parsed")]
    EncryptedPdf,

    #[error("PDF contains no extractable text")]
    EmptyText,

    #[error("PDF has {found} pages (max {max})")]
    TooManyPages { found: usize, max: usize },

    #[error("CSV file is empty or has no data rows")]
    EmptyCsv,

    #[error("CSV file has no headers")]
    NoHeaders,

    #[error("CSV file exceeds maximum row limit of {max}. Found {found} rows.")]
    TooManyRows { found: usize, max: usize },

    #[error("Invalid CSV format: {0}")]
    InvalidCsv(String),
}

impl ParseError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::InvalidPdf(_) => "INVALID_PDF",
            ParseError::EncryptedPdf => "ENCRYPTED_PDF",
            ParseError::EmptyText => "EMPTY_TEXT",
            ParseError::TooManyPages { .. } => "TOO_MANY_PAGES",
            ParseError::EmptyCsv => "EMPTY_CSV",
            ParseError::NoHeaders => "NO_HEADERS",
            ParseError::TooManyRows { .. } => "TOO_MANY_ROWS",
            ParseError::InvalidCsv(_) => "INVALID_CSV",
        }
    }
}

/// Rejection of an upload. No document state exists when these are returned,
/// except for `Storage`, where the document was created and then failed.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("File too large. Maximum size is {max} bytes (got {size}).")]
    FileTooLarge { size: usize, max: usize },

    #[error("Invalid file type. Only PDF and CSV files are supported.")]
    UnsupportedType,

    #[error("File is empty")]
    EmptyFile,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("conversation {0} already has a document; start a new conversation to upload another")]
    DocumentAlreadyAttached(String),

    #[error("failed to store document {document_id}: {source}")]
    Storage {
        document_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Failure of the question-answering path. The user's message may already be
/// recorded when `Internal` is returned.
#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("message must not be empty")]
    EmptyQuestion,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Normalizer failure that the pipeline must not paper over.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Content too large for normalization: {len} characters (max {max})")]
    InputTooLarge { len: usize, max: usize },

    #[error("Semantic normalization failed for {file_type} after {attempts} attempts: {reason}")]
    Exhausted {
        file_type: crate::models::FileType,
        attempts: u32,
        reason: String,
    },

    #[error("semantic cache error: {0}")]
    Cache(#[source] anyhow::Error),
}

/// Unrecoverable failure inside a pipeline run. Its display text becomes the
/// document's `error_reason`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Document has no storage_path")]
    MissingStoragePath,

    #[error("Failed to read document file: {0}")]
    Blob(#[source] anyhow::Error),

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("Parser task failed: {0}")]
    ParserTask(String),

    #[error("{0}")]
    Normalize(#[from] NormalizeError),

    #[error("Document produced {found} chunks (max {max})")]
    TooManyChunks { found: usize, max: usize },

    #[error("Embedding failed: {0}")]
    Embedding(#[source] anyhow::Error),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Storage error: {0}")]
    Store(#[source] anyhow::Error),
}
