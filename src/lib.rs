//! # OCA Harvest
//!
//! Harvests scholarly records from three upstream repositories, keeps one
//! durable raw copy per record with per-attempt error accounting, projects
//! the raw copies into a search engine, and serves faceted search and
//! indicator queries over the curated indices.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Harvesters  │──▶│ RecordStore  │──▶│ Indexing    │──▶│   Bronze     │
//! │ OAI/Couch/DV │   │ SQLite + log │   │ Projector   │   │ Transformer  │
//! └──────────────┘   └──────────────┘   └─────┬───────┘   └──────┬───────┘
//!                                             ▼                  ▼
//!                                       raw_* indices      curated indices
//!                                                                │
//!                                   ┌────────────────────────────┤
//!                                   ▼                            ▼
//!                             ┌──────────┐                ┌────────────┐
//!                             │ Gateway  │                │ Indicators │
//!                             └──────────┘                └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! oca init                       # create database
//! oca indices create-raw         # create raw indices
//! oca harvest preprints          # OAI-PMH
//! oca harvest books              # CouchDB _changes
//! oca harvest datasets           # Dataverse search API
//! oca serve                      # HTTP gateway
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Records, statuses, error logs, scripts |
//! | [`store`] | Record persistence and lifecycle events |
//! | [`error_context`] | Per-attempt error collection |
//! | [`harvest`] | Harvester trait and shared persistence |
//! | [`indexing`] | Raw-index projection |
//! | [`bronze`] | Raw to curated reindex scripts |
//! | [`indicator`] | Grouped-count indicators and chart payloads |
//! | [`gateway`] | Faceted search with filter-excluded aggregations |
//! | [`search_backend`] | Search engine abstraction |
//! | [`server`] | HTTP gateway |

pub mod bronze;
pub mod config;
pub mod db;
pub mod error;
pub mod error_context;
pub mod events;
pub mod field_registry;
pub mod filter_cache;
pub mod gateway;
pub mod gateway_query;
pub mod harvest;
pub mod harvest_books;
pub mod harvest_datasets;
pub mod harvest_preprints;
pub mod http;
pub mod indexing;
pub mod indicator;
pub mod migrate;
pub mod models;
pub mod oai;
pub mod oai_dc;
pub mod pipeline;
pub mod progress;
pub mod search_backend;
pub mod server;
pub mod sources;
pub mod stats;
pub mod store;
