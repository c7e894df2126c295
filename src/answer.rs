//! Retrieval-augmented answers over a conversation's ready documents.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::app::App;
use crate::error::AnswerError;
use crate::llm::ChatMessage;
use crate::models::{ChunkMatch, Role, Source};

pub const NO_DOCUMENTS_ANSWER: &str = "Please upload a document to this conversation first. \
     Questions can only be answered once a document has finished processing.";

pub const NO_MATCH_ANSWER: &str =
    "I could not find relevant information in the uploaded document to answer that question.";

const SYSTEM_PROMPT: &str = "\
You answer questions about a user's document.
Use only the information in the provided context.
If the context does not contain the answer, say that the document does not contain that information.
Do not use outside knowledge and do not guess.";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,
}

/// Answer `question` from the conversation's ready documents.
///
/// The question is recorded before anything else runs, and the reply is
/// recorded as an assistant message on every successful path.
pub async fn answer(app: &App, conversation_id: &str, question: &str) -> Result<Answer, AnswerError> {
    let question = question.trim();
    if question.is_empty() {
        return Err(AnswerError::EmptyQuestion);
    }
    if !app.store.conversation_exists(conversation_id).await? {
        return Err(AnswerError::ConversationNotFound(conversation_id.to_string()));
    }

    app.store
        .add_message(conversation_id, Role::User, question)
        .await?;

    let ready_ids = app.store.ready_document_ids(conversation_id).await?;
    if ready_ids.is_empty() {
        return reply(app, conversation_id, NO_DOCUMENTS_ANSWER.to_string(), Vec::new()).await;
    }

    let retrieval = &app.config.retrieval;
    let key = query_cache_key(
        question,
        &ready_ids,
        app.chat.model_name(),
        retrieval.temperature,
        retrieval.match_count,
    );
    if let Some(cached) = app.store.get_cached_answer(&key).await? {
        tracing::debug!(conversation_id, "query cache hit");
        return reply(app, conversation_id, cached, Vec::new()).await;
    }

    let query_vec = app
        .embedder
        .embed_query(question)
        .await
        .map_err(|e| AnswerError::Internal(e.into()))?;
    let matches = app
        .store
        .search_chunks(
            conversation_id,
            &query_vec,
            retrieval.match_threshold,
            retrieval.match_count,
        )
        .await?;

    if matches.is_empty() {
        tracing::info!(conversation_id, "no chunks above similarity threshold");
        return reply(app, conversation_id, NO_MATCH_ANSWER.to_string(), Vec::new()).await;
    }

    let sources: Vec<Source> = matches
        .iter()
        .map(|m| Source {
            document_id: m.document_id.clone(),
            chunk_id: m.chunk_id.clone(),
            similarity: m.similarity,
        })
        .collect();

    let context = build_context(&matches, retrieval.max_chunk_chars, retrieval.max_context_chars);
    let messages = [
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!("Context:\n{}\n\nQuestion: {}", context, question)),
    ];

    let text = match app.chat.complete(&messages, retrieval.temperature).await {
        Ok(text) if !text.is_empty() => {
            if let Err(e) = app.store.put_cached_answer(&key, &text).await {
                tracing::warn!(conversation_id, error = %e, "failed to cache answer");
            }
            text
        }
        Ok(_) => {
            tracing::warn!(conversation_id, "model returned an empty answer; replying with excerpt");
            excerpt_answer(&matches, retrieval.max_chunk_chars)
        }
        Err(e) => {
            tracing::warn!(conversation_id, error = %e, "answer generation failed; replying with excerpt");
            excerpt_answer(&matches, retrieval.max_chunk_chars)
        }
    };

    tracing::info!(
        conversation_id,
        matches = matches.len(),
        top_similarity = matches[0].similarity,
        "answered"
    );
    reply(app, conversation_id, text, sources).await
}

async fn reply(
    app: &App,
    conversation_id: &str,
    text: String,
    sources: Vec<Source>,
) -> Result<Answer, AnswerError> {
    app.store
        .add_message(conversation_id, Role::Assistant, &text)
        .await?;
    Ok(Answer {
        answer: text,
        sources,
    })
}

/// Cache key over everything that changes the answer.
pub fn query_cache_key(
    question: &str,
    ready_ids: &[String],
    model: &str,
    temperature: f32,
    match_count: usize,
) -> String {
    let mut ids = ready_ids.to_vec();
    ids.sort();
    let material = serde_json::json!({
        "question": question,
        "documents": ids,
        "model": model,
        "temperature": temperature,
        "match_count": match_count,
    });
    format!("{:x}", Sha256::digest(material.to_string().as_bytes()))
}

/// Matched chunks, most similar first, each cut to `max_chunk_chars` and
/// together kept within `max_context_chars`. The first chunk is always
/// included.
pub fn build_context(matches: &[ChunkMatch], max_chunk_chars: usize, max_context_chars: usize) -> String {
    let mut context = String::new();
    let mut used = 0usize;

    for m in matches {
        let piece = truncate_chars(m.content.trim(), max_chunk_chars);
        let piece_chars = piece.chars().count();
        let sep_chars = if context.is_empty() {
            0
        } else {
            CONTEXT_SEPARATOR.len()
        };

        if !context.is_empty() && used + sep_chars + piece_chars > max_context_chars {
            break;
        }
        if !context.is_empty() {
            context.push_str(CONTEXT_SEPARATOR);
        }
        context.push_str(piece);
        used += sep_chars + piece_chars;
    }

    context
}

fn excerpt_answer(matches: &[ChunkMatch], max_chunk_chars: usize) -> String {
    let excerpt = matches
        .first()
        .map(|m| truncate_chars(m.content.trim(), max_chunk_chars))
        .unwrap_or_default();
    format!(
        "I couldn't generate an answer right now. The most relevant passage in the document is:\n\n{}",
        excerpt
    )
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}
