//! # docqa CLI
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa init` | Create the SQLite database and run schema migrations |
//! | `docqa serve` | Start the HTTP API |
//! | `docqa conversation create\|list\|delete` | Manage conversations |
//! | `docqa upload <file> --conversation <id>` | Upload and process a document |
//! | `docqa status <document-id>` | Show a document's status |
//! | `docqa documents --conversation <id>` | List a conversation's documents |
//! | `docqa process <document-id>` | Run the pipeline for a `processing` document |
//! | `docqa recover` | Re-run documents whose worker died |
//! | `docqa fail <document-id>` | Operator force-fail |
//! | `docqa ask --conversation <id> "<question>"` | Ask a question |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docqa::answer::answer;
use docqa::app::App;
use docqa::config::{load_config, Config};
use docqa::ingest::{self, ProcessOutcome};
use docqa::store::{format_ts_iso, SqliteStore};
use docqa::{db, migrate, server};

/// Document question answering over uploaded PDF and CSV files.
#[derive(Parser)]
#[command(name = "docqa", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Manage conversations.
    Conversation {
        #[command(subcommand)]
        action: ConversationAction,
    },

    /// Upload a file into a conversation and process it to completion.
    Upload {
        /// Path to a PDF or CSV file.
        file: PathBuf,

        /// Conversation to attach the document to.
        #[arg(long)]
        conversation: String,

        /// MIME type to declare. Inferred from the extension when omitted.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Show a document's status.
    Status {
        /// Document ID.
        id: String,
    },

    /// List documents of a conversation.
    Documents {
        #[arg(long)]
        conversation: String,
    },

    /// Run the pipeline for a document stuck in `processing`.
    Process {
        /// Document ID.
        id: String,
    },

    /// Re-run every `processing` document with no live worker.
    Recover,

    /// Mark an `uploading` or `processing` document as failed.
    Fail {
        /// Document ID.
        id: String,
    },

    /// Ask a question about a conversation's document.
    Ask {
        #[arg(long)]
        conversation: String,

        question: String,
    },
}

#[derive(Subcommand)]
enum ConversationAction {
    /// Create a conversation and print its ID.
    Create,
    /// List conversations, newest first.
    List,
    /// Soft-delete a conversation.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let app = open_app(&cfg).await?;
            server::run_server(app).await?;
        }
        Commands::Conversation { action } => {
            let store = open_store(&cfg).await?;
            match action {
                ConversationAction::Create => {
                    let conversation = store.create_conversation().await?;
                    println!("{}", conversation.id);
                }
                ConversationAction::List => {
                    let conversations = store.list_conversations().await?;
                    if conversations.is_empty() {
                        println!("No conversations.");
                    }
                    for c in conversations {
                        println!("{}  {}", c.id, format_ts_iso(c.created_at));
                    }
                }
                ConversationAction::Delete { id } => {
                    if !store.soft_delete_conversation(&id).await? {
                        bail!("conversation not found: {}", id);
                    }
                    println!("Deleted conversation {}", id);
                }
            }
        }
        Commands::Upload {
            file,
            conversation,
            content_type,
        } => {
            let app = open_app(&cfg).await?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());

            let document = ingest::accept_upload(
                &app,
                &conversation,
                &filename,
                content_type.as_deref(),
                &bytes,
            )
            .await?;
            println!("uploaded {} ({})", document.id, document.file_type);

            let outcome = ingest::process_document(&app, &document.id).await?;
            println!("  {}", outcome);
            if let ProcessOutcome::Failed { .. } | ProcessOutcome::Exhausted = outcome {
                std::process::exit(1);
            }
        }
        Commands::Status { id } => {
            let store = open_store(&cfg).await?;
            let document = store
                .get_document(&id)
                .await?
                .with_context(|| format!("document not found: {}", id))?;
            println!("id:           {}", document.id);
            println!("conversation: {}", document.conversation_id);
            println!("filename:     {}", document.filename);
            println!("type:         {}", document.file_type);
            println!("status:       {}", document.status);
            println!("attempts:     {}", document.processing_attempts);
            println!("created:      {}", format_ts_iso(document.created_at));
            if let Some(reason) = document.error_reason {
                println!("error:        {}", reason);
            }
        }
        Commands::Documents { conversation } => {
            let store = open_store(&cfg).await?;
            let documents = store.list_documents(&conversation).await?;
            if documents.is_empty() {
                println!("No documents.");
            }
            for d in documents {
                println!(
                    "{}  {:<10}  {:<4}  {}",
                    d.id,
                    d.status.as_str(),
                    d.file_type.as_str(),
                    d.filename
                );
            }
        }
        Commands::Process { id } => {
            let app = open_app(&cfg).await?;
            let outcome = ingest::process_document(&app, &id).await?;
            println!("{}: {}", id, outcome);
        }
        Commands::Recover => {
            let app = open_app(&cfg).await?;
            let results = ingest::recover(&app).await?;
            if results.is_empty() {
                println!("Nothing to recover.");
            }
            for (id, outcome) in results {
                println!("{}: {}", id, outcome);
            }
        }
        Commands::Fail { id } => {
            let store = open_store(&cfg).await?;
            if !ingest::force_fail(&store, &id).await? {
                bail!("document {} is not uploading or processing", id);
            }
            println!("Marked {} as failed.", id);
        }
        Commands::Ask {
            conversation,
            question,
        } => {
            let app = open_app(&cfg).await?;
            let result = answer(&app, &conversation, &question).await?;
            println!("{}", result.answer);
            if !result.sources.is_empty() {
                println!();
                println!("Sources:");
                for s in result.sources {
                    println!("  {:.3}  {}  {}", s.similarity, s.document_id, s.chunk_id);
                }
            }
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> Result<SqliteStore> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    Ok(SqliteStore::new(pool))
}

async fn open_app(cfg: &Config) -> Result<App> {
    let app = App::from_config(cfg).await?;
    migrate::run_migrations(app.store.pool()).await?;
    Ok(app)
}
