//! PDF text extraction, one unit per page.

use crate::error::ParseError;
use crate::models::{ChunkMetadata, TextUnit};

/// How far into the file the `%PDF-` header may appear.
const HEADER_SEARCH_BYTES: usize = 1024;

/// Extract per-page text and normalize its whitespace.
///
/// Pages that are blank after normalization are dropped; surviving pages keep
/// their original 1-based page number.
pub fn parse_pdf(bytes: &[u8]) -> Result<Vec<TextUnit>, ParseError> {
    let encrypted = has_encrypt_marker(bytes);
    let raw_pages = extract_pages(bytes, encrypted)?;

    let units: Vec<TextUnit> = raw_pages
        .iter()
        .enumerate()
        .filter_map(|(i, raw)| {
            let text = normalize_whitespace(raw);
            if text.is_empty() {
                None
            } else {
                Some(TextUnit {
                    text,
                    position: ChunkMetadata::Page {
                        page_number: (i + 1) as u32,
                    },
                })
            }
        })
        .collect();

    if units.is_empty() {
        // An encrypted file that decodes to nothing needs a password.
        if encrypted {
            return Err(ParseError::EncryptedPdf);
        }
        return Err(ParseError::EmptyText);
    }

    Ok(units)
}

/// Number of pages in the document, including blank ones.
pub fn page_count(bytes: &[u8]) -> Result<usize, ParseError> {
    extract_pages(bytes, has_encrypt_marker(bytes)).map(|pages| pages.len())
}

fn extract_pages(bytes: &[u8], encrypted: bool) -> Result<Vec<String>, ParseError> {
    let header_window = &bytes[..bytes.len().min(HEADER_SEARCH_BYTES)];
    if !header_window.windows(5).any(|w| w == b"%PDF-") {
        return Err(ParseError::InvalidPdf("missing %PDF header".to_string()));
    }

    // pdf-extract panics on some malformed inputs instead of returning Err.
    let outcome =
        std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes));

    let message = match outcome {
        Ok(Ok(pages)) => return Ok(pages),
        Ok(Err(e)) => e.to_string(),
        Err(_) => "parser aborted on malformed input".to_string(),
    };

    let lowered = message.to_lowercase();
    if encrypted || lowered.contains("encrypt") || lowered.contains("password") {
        Err(ParseError::EncryptedPdf)
    } else {
        Err(ParseError::InvalidPdf(message))
    }
}

fn has_encrypt_marker(bytes: &[u8]) -> bool {
    bytes.windows(8).any(|w| w == b"/Encrypt")
}

/// Collapse intra-paragraph whitespace and keep paragraph breaks.
///
/// Runs of spaces and tabs become one space, single line breaks inside a
/// paragraph become a space, and one or more blank lines become `\n\n`.
pub fn normalize_whitespace(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in unified.split('\n') {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(collapse(&current));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(collapse(&current));
    }

    paragraphs.retain(|p| !p.is_empty());
    paragraphs.join("\n\n")
}

fn collapse(lines: &[&str]) -> String {
    lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}
