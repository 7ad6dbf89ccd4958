//! # Enrichment Harness
//!
//! An AI-assisted data enrichment pipeline. For each enrichment module the
//! pipeline retrieves reference context, asks a text-generation backend for a
//! batch of structured records, parses the reply, and reconciles each record
//! against the live schema of a relational store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ ContextStore │──▶│ Orchestrator │──▶│  Dispatcher  │──▶ backend
//! │  FTS5 / mem  │   │  per module  │   │ ded/cloud/lo │
//! └──────────────┘   └──────┬───────┘   └──────────────┘
//!                           │ parse
//!                           ▼
//!                    ┌──────────────┐   ┌──────────────┐
//!                    │ SchemaProbe  │──▶│ Reconciler   │──▶ SQLite
//!                    └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! enrich init                        # create database
//! enrich ingest corpus.jsonl         # load retrieval context
//! enrich backends                    # show which backend is active
//! enrich run companies --count 5     # enrich one module
//! enrich serve                       # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Core data types |
//! | [`context`] | Retrieval store |
//! | [`backend`] | Backend registry and selection |
//! | [`sigv4`] | Request signing for the managed-cloud backend |
//! | [`dispatch`] | Generation calls and health checks |
//! | [`parser`] | Extraction of record arrays from replies |
//! | [`schema`] | Live table column inspection |
//! | [`persist`] | Schema-aware record writes |
//! | [`modules`] | Per-module handler specs |
//! | [`orchestrator`] | Module runs and batch runs |
//! | [`chat`] | Retrieval-grounded question answering |
//! | [`server`] | HTTP API |

pub mod backend;
pub mod chat;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod migrate;
pub mod models;
pub mod modules;
pub mod orchestrator;
pub mod parser;
pub mod persist;
pub mod schema;
pub mod server;
pub mod sigv4;
