//! # Groundwork CLI (`gw`)
//!
//! The `gw` binary drives the evidence store and the version ledger. Every
//! command prints JSON on stdout; logs go to stderr (`RUST_LOG` controls
//! the level, default `info`).
//!
//! ## Usage
//!
//! ```bash
//! gw --config ./config/gw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gw init` | Create the SQLite database and run schema migrations |
//! | `gw ingest --title T --file F` | Split a document into segments and activate it |
//! | `gw docs` | List documents with segment counts |
//! | `gw remove <doc-id>` | Delete a document and its segments |
//! | `gw working-set add\|remove\|list` | Manage the active document set |
//! | `gw search "<query>"` | Show the evidence retrieval would select |
//! | `gw generate "<prompt>"` | Draft a new message (`--stream` for events) |
//! | `gw refine <id> "<instruction>"` | Append a refined version |
//! | `gw edit <id> "<text>"` | Append a directly edited version |
//! | `gw status <id> draft\|finalized` | Set the message status |
//! | `gw show <id>` | Full version history |
//! | `gw list` | Messages with their latest version |
//! | `gw eval <id>` | Grounding report; exit 0 pass, 1 fail, 2 error |

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use groundwork::config;
use groundwork::error::LedgerError;
use groundwork::ingest::{self, NewDocument};
use groundwork::ledger::Ledger;
use groundwork::migrate;
use groundwork::report;
use groundwork::stream::{stream_generate, StreamEvent};
use groundwork_core::models::MessageStatus;
use groundwork_core::retrieve::retrieve;

/// Groundwork CLI: evidence-grounded message drafting with citation
/// verification and versioned history.
#[derive(Parser)]
#[command(
    name = "gw",
    about = "Groundwork: evidence-grounded message drafting",
    version,
    long_about = "Groundwork retrieves evidence from ingested documents, generates claims \
    with citations, drops every claim its citations do not support, and records each \
    draft, refinement, and edit as an immutable version."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gw.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest a plain-text document and add it to the working set.
    Ingest {
        #[arg(long)]
        title: String,

        /// File holding the document body.
        #[arg(long)]
        file: PathBuf,

        /// Identifier in an external bibliographic service (e.g. a PMID).
        #[arg(long)]
        external_id: Option<String>,

        #[arg(long, default_value = "upload")]
        source: String,
    },

    /// List documents with segment counts and working-set membership.
    Docs,

    /// Delete a document, its segments, and its working-set entry.
    Remove { id: String },

    /// Manage the working set.
    WorkingSet {
        #[command(subcommand)]
        action: WorkingSetAction,
    },

    /// Show the evidence segments retrieval selects for a query.
    Search {
        query: String,

        /// Restrict to these documents (repeatable). Defaults to the working set.
        #[arg(long = "doc")]
        docs: Vec<String>,

        #[arg(long)]
        top_k: Option<i64>,
    },

    /// Draft a new message from evidence.
    Generate {
        prompt: String,

        /// Documents to draw evidence from (repeatable). Defaults to the working set.
        #[arg(long = "doc")]
        docs: Vec<String>,

        #[arg(long)]
        top_k: Option<i64>,

        /// Print pipeline events as JSON lines while generating.
        #[arg(long)]
        stream: bool,
    },

    /// Append a refined version to a draft message.
    Refine {
        id: String,
        instruction: String,

        /// Documents to draw evidence from (repeatable). Defaults to the working set.
        #[arg(long = "doc")]
        docs: Vec<String>,

        #[arg(long)]
        top_k: Option<i64>,
    },

    /// Replace a message's text directly.
    Edit { id: String, text: String },

    /// Set a message's status (`draft` or `finalized`).
    Status { id: String, status: String },

    /// Show a message with its full version history.
    Show { id: String },

    /// List messages with their latest version.
    List,

    /// Report how well the latest version's claims are grounded.
    ///
    /// Exits 0 when no claim was dropped, 1 otherwise, 2 when the message
    /// is missing or has no versions.
    Eval { id: String },
}

#[derive(Subcommand)]
enum WorkingSetAction {
    Add { id: String },
    Remove { id: String },
    List,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Explicit document ids, or the working set when none were given.
async fn resolve_docs(ledger: &Ledger, docs: Vec<String>) -> Result<Vec<String>> {
    if docs.is_empty() {
        ledger.store().working_set().await
    } else {
        Ok(docs)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        print_json(&serde_json::json!({ "initialized": cfg.db.path }))?;
        return Ok(());
    }

    let ledger = Ledger::open(&cfg).await?;
    let store = ledger.store().clone();

    match cli.command {
        Commands::Init => {}
        Commands::Ingest {
            title,
            file,
            external_id,
            source,
        } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let outcome = ingest::ingest_document(
                store.as_ref(),
                NewDocument {
                    title,
                    body,
                    external_id,
                    source,
                },
                cfg.chunking.max_chars,
            )
            .await?;
            print_json(&serde_json::json!({
                "id": outcome.document.id,
                "external_id": outcome.document.external_id,
                "title": outcome.document.title,
                "segment_count": outcome.segment_count,
                "created": outcome.created,
            }))?;
        }
        Commands::Docs => {
            print_json(&ingest::list_documents(store.as_ref()).await?)?;
        }
        Commands::Remove { id } => {
            if !ingest::remove_document(store.as_ref(), &id).await? {
                return Err(LedgerError::document_not_found(&id).into());
            }
            print_json(&serde_json::json!({ "removed": id }))?;
        }
        Commands::WorkingSet { action } => match action {
            WorkingSetAction::Add { id } => {
                if store.get_document(&id).await?.is_none() {
                    return Err(LedgerError::document_not_found(&id).into());
                }
                store.add_to_working_set(&id).await?;
                print_json(&store.working_set().await?)?;
            }
            WorkingSetAction::Remove { id } => {
                store.remove_from_working_set(&id).await?;
                print_json(&store.working_set().await?)?;
            }
            WorkingSetAction::List => {
                print_json(&store.working_set().await?)?;
            }
        },
        Commands::Search { query, docs, top_k } => {
            let docs = resolve_docs(&ledger, docs).await?;
            let top_k = top_k.unwrap_or(cfg.retrieval.top_k);
            print_json(&retrieve(store.as_ref(), &query, &docs, top_k).await?)?;
        }
        Commands::Generate {
            prompt,
            docs,
            top_k,
            stream,
        } => {
            let docs = resolve_docs(&ledger, docs).await?;
            if stream {
                let mut rx = stream_generate(ledger.clone(), prompt, docs, top_k);
                let mut failed = None;
                while let Some(event) = rx.recv().await {
                    println!("{}", serde_json::to_string(&event)?);
                    if let StreamEvent::Error { message } = event {
                        failed = Some(message);
                    }
                }
                if let Some(message) = failed {
                    bail!(message);
                }
            } else {
                print_json(&ledger.generate(&prompt, &docs, top_k).await?)?;
            }
        }
        Commands::Refine {
            id,
            instruction,
            docs,
            top_k,
        } => {
            print_json(&ledger.refine(&id, &instruction, &docs, top_k).await?)?;
        }
        Commands::Edit { id, text } => {
            print_json(&ledger.edit(&id, &text).await?)?;
        }
        Commands::Status { id, status } => {
            let status = MessageStatus::parse(&status).ok_or_else(|| {
                anyhow::anyhow!("Unknown status: '{}'. Must be draft or finalized.", status)
            })?;
            print_json(&ledger.set_status(&id, status).await?)?;
        }
        Commands::Show { id } => {
            print_json(&ledger.get(&id).await?)?;
        }
        Commands::List => {
            print_json(&ledger.list().await?)?;
        }
        Commands::Eval { id } => {
            let report = match ledger.get(&id).await {
                Ok(detail) => report::evaluate(&detail),
                Err(e) => Err(e.into()),
            };
            match report {
                Ok(report) => {
                    print_json(&report)?;
                    std::process::exit(if report.pass { 0 } else { 1 });
                }
                Err(e) => {
                    print_json(&serde_json::json!({ "error": e.to_string() }))?;
                    std::process::exit(2);
                }
            }
        }
    }

    Ok(())
}
