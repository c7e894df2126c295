//! Upload validation, run before any document state is created.

use crate::config::IngestionConfig;
use crate::error::{ParseError, UploadError};
use crate::models::FileType;
use crate::parse;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_EXCEL_CSV: &str = "application/vnd.ms-excel";
pub const MIME_TEXT: &str = "text/plain";

const ALLOWED_TYPES: &[&str] = &[MIME_PDF, MIME_CSV, MIME_EXCEL_CSV, MIME_TEXT];

/// Resolve the document type from the declared MIME type, falling back to
/// the filename extension when the client sent none.
pub fn detect_file_type(content_type: Option<&str>, filename: &str) -> Result<FileType, UploadError> {
    let mime = content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty() && ct != "application/octet-stream");

    match mime {
        Some(ct) => {
            if !ALLOWED_TYPES.contains(&ct.as_str()) {
                return Err(UploadError::UnsupportedType);
            }
            if ct.contains("pdf") {
                Ok(FileType::Pdf)
            } else {
                Ok(FileType::Csv)
            }
        }
        None => {
            let lower = filename.to_ascii_lowercase();
            if lower.ends_with(".pdf") {
                Ok(FileType::Pdf)
            } else if lower.ends_with(".csv") {
                Ok(FileType::Csv)
            } else {
                Err(UploadError::UnsupportedType)
            }
        }
    }
}

/// Check size, type, and the format-specific row/page ceilings.
///
/// Parses the file once to enforce the ceilings, so malformed input is
/// rejected here with its parse error instead of failing later.
pub fn validate_upload(
    config: &IngestionConfig,
    bytes: &[u8],
    content_type: Option<&str>,
    filename: &str,
) -> Result<FileType, UploadError> {
    if bytes.len() > config.max_file_bytes {
        return Err(UploadError::FileTooLarge {
            size: bytes.len(),
            max: config.max_file_bytes,
        });
    }

    let file_type = detect_file_type(content_type, filename)?;

    if bytes.is_empty() {
        return Err(UploadError::EmptyFile);
    }

    match file_type {
        FileType::Csv => {
            parse::parse_document(file_type, bytes, filename, config.max_csv_rows)?;
        }
        FileType::Pdf => {
            let pages = parse::pdf::page_count(bytes)?;
            if pages > config.max_pdf_pages {
                return Err(ParseError::TooManyPages {
                    found: pages,
                    max: config.max_pdf_pages,
                }
                .into());
            }
        }
    }

    Ok(file_type)
}
