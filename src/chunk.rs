//! Retrieval chunker.
//!
//! CSV rows map one-to-one onto chunks. PDF pages are split on paragraph
//! boundaries (`\n\n`) and greedily packed into chunks between a soft
//! minimum and a hard maximum size. Oversized paragraphs are split at
//! sentence boundaries first, and oversized sentences at whitespace.
//! A chunk never spans two pages; `chunk_index` runs across the whole
//! document starting at 0.

use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::{Chunk, FileType, TextUnit};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

const PARAGRAPH_JOIN: &str = "\n\n";
const SENTENCE_JOIN: &str = " ";

/// Split normalized units into chunks with contiguous indices starting at 0.
pub fn chunk_units(
    units: &[TextUnit],
    file_type: FileType,
    document_id: &str,
    conversation_id: &str,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut next_index: i64 = 0;
    let mut emit = |text: &str, unit: &TextUnit| {
        chunks.push(Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            conversation_id: conversation_id.to_string(),
            chunk_index: next_index,
            content: text.to_string(),
            metadata: unit.position,
        });
        next_index += 1;
    };

    match file_type {
        FileType::Csv => {
            for unit in units {
                let text = unit.text.trim();
                if !text.is_empty() {
                    emit(text, unit);
                }
            }
        }
        FileType::Pdf => {
            let min_chars = config.min_tokens * CHARS_PER_TOKEN;
            let max_chars = config.max_tokens.max(1) * CHARS_PER_TOKEN;
            for unit in units {
                for text in pack_page(&unit.text, min_chars, max_chars) {
                    emit(&text, unit);
                }
            }
        }
    }

    chunks
}

/// A piece of page text and the separator that precedes it inside a chunk.
struct Piece {
    text: String,
    join: &'static str,
}

fn pack_page(text: &str, min_chars: usize, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;

    for piece in split_page(text, max_chars) {
        let piece_chars = piece.text.chars().count();
        let join_chars = if buf.is_empty() { 0 } else { piece.join.len() };

        if !buf.is_empty() && buf_chars + join_chars + piece_chars > max_chars {
            out.push(std::mem::take(&mut buf));
            buf_chars = 0;
        }

        if !buf.is_empty() {
            buf.push_str(piece.join);
            buf_chars += piece.join.len();
        }
        buf.push_str(&piece.text);
        buf_chars += piece_chars;

        if buf_chars >= min_chars {
            out.push(std::mem::take(&mut buf));
            buf_chars = 0;
        }
    }

    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

/// Paragraphs, with any paragraph over `max_chars` broken into sentence
/// pieces that each fit.
fn split_page(text: &str, max_chars: usize) -> Vec<Piece> {
    let unified = text.replace("\r\n", "\n");
    let mut pieces = Vec::new();

    for para in unified.split(PARAGRAPH_JOIN) {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        if para.chars().count() <= max_chars {
            pieces.push(Piece {
                text: para.to_string(),
                join: PARAGRAPH_JOIN,
            });
            continue;
        }

        let mut first = true;
        for sentence in para.split_sentence_bounds() {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            for part in split_sentence(sentence, max_chars) {
                pieces.push(Piece {
                    text: part,
                    join: if first { PARAGRAPH_JOIN } else { SENTENCE_JOIN },
                });
                first = false;
            }
        }
    }

    pieces
}

/// Hard-split a sentence at whitespace so each part fits in `max_chars`.
/// A single word longer than the limit is cut at character boundaries.
fn split_sentence(sentence: &str, max_chars: usize) -> Vec<String> {
    if sentence.chars().count() <= max_chars {
        return vec![sentence.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for word in sentence.split_whitespace() {
        let word_chars = word.chars().count();

        if word_chars > max_chars {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            let letters: Vec<char> = word.chars().collect();
            for slice in letters.chunks(max_chars) {
                parts.push(slice.iter().collect());
            }
            continue;
        }

        let needed = if current.is_empty() {
            word_chars
        } else {
            current_chars + 1 + word_chars
        };
        if needed > max_chars {
            parts.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_chars += 1;
        }
        current.push_str(word);
        current_chars += word_chars;
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
