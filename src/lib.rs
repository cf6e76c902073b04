//! # Channel Archive
//!
//! Archives chat channels: the transcript exporter renders a channel, the
//! rendering is uploaded to object storage, and the channel is moved into an
//! archive category. A second pipeline ingests structured transcripts into
//! SQLite and pushes the messages into a vector index for search.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐
//! trigger ──▶│ Orchestrator │──▶ status ledger (text, newest first)
//!            └──────┬───────┘
//!        ┌──────────┴───────────┐
//!        ▼                      ▼
//!  local: Export(json)    remote: Export(html)
//!        → Ingest               → Upload (S3)
//!        → Index                → Relocate (chat)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`ledger`] | Status ledger and readiness |
//! | [`jobs`] | Persisted job records |
//! | [`store`] | Message store |
//! | [`ingest`] | Transcript ingestion |
//! | [`exporter`] | Exporter subprocess |
//! | [`index`] | Indexing stage and vector backends |
//! | [`namer`] | Key and channel-name collision resolution |
//! | [`storage`] | S3-compatible object store |
//! | [`chat`] | Chat platform client |
//! | [`relocate`] | Archive-category move |
//! | [`pipeline`] | Orchestrator |
//! | [`server`] | HTTP trigger |

pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod exporter;
pub mod index;
pub mod ingest;
pub mod jobs;
pub mod ledger;
pub mod mask;
pub mod migrate;
pub mod models;
pub mod namer;
pub mod pipeline;
pub mod relocate;
pub mod server;
pub mod storage;
pub mod store;
