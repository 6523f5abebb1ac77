//! # Feedback Harness
//!
//! A local-first knowledge base for customer feedback. An external
//! analyzer turns conversations, tickets and suggestions into opportunity
//! candidates with embeddings; Feedback Harness deduplicates them into
//! canonical opportunities, keeps the provenance of every merge, and
//! serves search and lookup over the result.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────────┐   ┌──────────┐
//! │ JSONL file  │──▶│ ingest       │──▶│ KnowledgeBase  │──▶│  SQLite  │
//! │ (analyzer)  │   │ cap + embed  │   │ dedup + merge  │   │          │
//! └─────────────┘   └──────────────┘   └───────┬────────┘   └──────────┘
//!                                              │
//!                            ┌─────────────────┤
//!                            ▼                 ▼
//!                       ┌──────────┐     ┌──────────┐
//!                       │   CLI    │     │   HTTP   │
//!                       │  (fbx)   │     │  (JSON)  │
//!                       └──────────┘     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fbx init                          # create database, record settings
//! fbx ingest analyzed.jsonl         # dedup + merge analyzer output
//! fbx search "login" --min-severity high
//! fbx get <id>                      # opportunity + provenance
//! fbx serve                         # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` trait |
//! | [`kb`] | Single-writer knowledge base service |
//! | [`embedding`] | Embedding providers |
//! | [`ingest`] | JSONL ingestion pipeline |
//! | [`search`], [`get`], [`items`], [`stats`] | CLI commands |
//! | [`server`] | HTTP API |
//! | [`logging`] | tracing subscriber setup |
//!
//! The runtime-free pieces (data model, dedup decision, search ranking)
//! live in the `feedback-harness-core` crate.

pub mod config;
pub mod db;
pub mod embedding;
pub mod get;
pub mod ingest;
pub mod items;
pub mod kb;
pub mod logging;
pub mod migrate;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;
