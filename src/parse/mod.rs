//! Format parsers: raw upload bytes to ordered [`TextUnit`]s.
//!
//! Each parser returns units in document order with their positional
//! metadata (page number or row index). Parsers never panic on bad input;
//! they return a [`ParseError`] and the orchestrator marks the document
//! failed.

pub mod csv;
pub mod pdf;

use crate::error::ParseError;
use crate::models::{FileType, TextUnit};

/// Parse `bytes` as `file_type`.
///
/// `filename` supplies the entity name for CSV row serialization;
/// `max_csv_rows` is the row ceiling enforced while parsing CSV.
pub fn parse_document(
    file_type: FileType,
    bytes: &[u8],
    filename: &str,
    max_csv_rows: usize,
) -> Result<Vec<TextUnit>, ParseError> {
    match file_type {
        FileType::Pdf => pdf::parse_pdf(bytes),
        FileType::Csv => {
            let entity = csv::entity_from_filename(filename);
            csv::parse_csv(bytes, &entity, max_csv_rows)
        }
    }
}

/// [`parse_document`] on tokio's blocking pool.
///
/// PDF extraction is CPU-bound and can hold a thread for seconds on a large
/// file; async callers must not run it on a runtime worker.
pub async fn parse_document_blocking(
    file_type: FileType,
    bytes: Vec<u8>,
    filename: String,
    max_csv_rows: usize,
) -> Result<Result<Vec<TextUnit>, ParseError>, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || parse_document(file_type, &bytes, &filename, max_csv_rows))
        .await
}
