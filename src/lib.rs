//! # bibmirror
//!
//! A locally queryable, faceted-search mirror of a remotely hosted
//! bibliographic library, kept eventually consistent through a
//! unidirectional, resumable, three-stage synchronization pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │ Remote API  │──▶│ Cache Store │──▶│ Index Store │──▶│ Attachments │
//! │ (read-only) │   │  (SQLite)   │   │ (generation │   │ (MD5 recon- │
//! │             │   │             │   │   swap)     │   │  ciliation) │
//! └─────────────┘   └─────────────┘   └──────┬──────┘   └─────────────┘
//!                                            │
//!                              ┌─────────────┤
//!                              ▼             ▼
//!                         ┌──────────┐  ┌──────────┐
//!                         │   CLI    │  │   HTTP   │
//!                         │  (bibm)  │  │ (search) │
//!                         └──────────┘  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! bibm init                     # create the cache database
//! bibm sync all                 # cache + index + attachments
//! bibm sync cache --full        # force a full cache sweep
//! bibm search "medieval falconry" --sort relevance
//! bibm serve                    # start the query/monitoring server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Remote entities, typed item layer, index documents |
//! | [`remote`] | Read-only remote API client with retry/backoff |
//! | [`cache`] | Durable entity cache and sync state |
//! | [`sync`] | Cache synchronizer (full/incremental, tombstones) |
//! | [`extract`] | Extractor pipeline: cached subtree → index document |
//! | [`build`] | Index build orchestration, two-phase relation inversion |
//! | [`index`] | Generation-based search index store |
//! | [`query`] | Ranked search with facet filters |
//! | [`attachments`] | Manifest-driven attachment reconciliation |
//! | [`pipeline`] | Stage ordering, run lock, monitoring record |
//! | [`server`] | HTTP query and monitoring server |

pub mod analyze;
pub mod attachments;
pub mod build;
pub mod cache;
pub mod clean;
pub mod config;
pub mod error;
pub mod extract;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod remote;
pub mod server;
pub mod stats;
pub mod sync;
