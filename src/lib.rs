//! # Groundwork
//!
//! Evidence-grounded message drafting. Groundwork retrieves evidence
//! segments from a local document store, asks a generation backend for
//! claims with citations, drops every claim its citations do not
//! substantiate, and keeps an immutable version history for each message.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌──────────┐   ┌──────────┐
//! │ Retriever │──▶│  Backend  │──▶│ Verifier │──▶│  Ledger  │
//! │  FTS5     │   │ OpenAI /  │   │ overlap  │   │ versions │
//! └─────┬─────┘   │  fixed    │   └──────────┘   └────┬─────┘
//!       │         └───────────┘                       │
//!       └──────────────── SQLite ◀────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gw init
//! gw ingest --title "Metformin review" --file review.txt
//! gw generate "Summarize metformin's effect on glucose"
//! gw refine <message-id> "Make it shorter"
//! gw status <message-id> finalized
//! gw eval <message-id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store trait |
//! | [`ingest`] | Document ingestion and working-set management |
//! | [`generation`] | Generation backends and prompts |
//! | [`ledger`] | Generate, refine, edit, and status operations |
//! | [`stream`] | Streaming generation pipeline |
//! | [`report`] | Grounding report for a message |
//! | [`error`] | Ledger error type |
//!
//! Data models, segment splitting, verification, and retrieval live in
//! the `groundwork-core` crate.

pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod report;
pub mod sqlite_store;
pub mod stream;
