//! # docqa
//!
//! Upload a PDF or CSV into a conversation, turn it into a semantically
//! normalized, embedded chunk store, and ask questions answered only from
//! that document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────┐   ┌─────────┐
//! │  Upload  │──▶│ Parse PDF/CSV│──▶│ Normalize  │──▶│  Chunk  │
//! │ validate │   │  per page/row│   │ LLM + cache│   │         │
//! └──────────┘   └──────────────┘   └────────────┘   └────┬────┘
//!                                                         ▼
//!      ┌──────────┐        ┌──────────────────┐      ┌─────────┐
//!      │  Answer  │◀───────│ SQLite chunks +  │◀─────│  Embed  │
//!      │ RAG chat │        │ vectors (cosine) │      │ batched │
//!      └──────────┘        └──────────────────┘      └─────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] / [`migrate`] | Connection pool and schema |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors for upload, parsing, normalization, pipeline |
//! | [`parse`] | PDF and CSV parsers |
//! | [`validate`] | Upload validation |
//! | [`cache`] | Two-tier semantic cache |
//! | [`normalize`] | Semantic normalizer |
//! | [`chunk`] | Retrieval chunker |
//! | [`embedding`] | Embedding providers, batching, vector utilities |
//! | [`llm`] | Chat-completion providers |
//! | [`store`] | SQLite store, status transitions, similarity search |
//! | [`storage`] | Blob storage |
//! | [`app`] | Shared application handle |
//! | [`ingest`] | Upload and pipeline orchestration |
//! | [`answer`] | Retrieval and answer assembly |
//! | [`server`] | HTTP API |

pub mod answer;
pub mod app;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod parse;
pub mod server;
pub mod storage;
pub mod store;
pub mod validate;
