//! # SailSync
//!
//! Reconciles cruise provider feeds into a canonical catalog and serves
//! sailing search over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────┐   ┌──────────┐
//! │ Feed        │──▶│ validate → resolve →      │──▶│  SQLite   │
//! │ dir / HTTP  │   │ upsert  (sync run)        │   │  (WAL)    │
//! └─────────────┘   └──────────────────────────┘   └────┬─────┘
//!                                                        │
//!                                    ┌───────────────────┤
//!                                    ▼                   ▼
//!                               ┌──────────┐       ┌──────────┐
//!                               │   CLI    │       │   HTTP   │
//!                               │(sailsync)│       │  (axum)  │
//!                               └──────────┘       └──────────┘
//! ```
//!
//! The record pipeline, search semantics, and coverage model live in
//! `sailsync-core`; this crate supplies storage, feeds, and the surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store traits |
//! | [`feed`] | Directory and HTTP feed sources |
//! | [`credentials`] | Provider credential sources |
//! | [`ingest`] | Sync run orchestration |
//! | [`progress`] | Sync progress reporting |
//! | [`runs`] | `sync`, `runs`, and `run` commands |
//! | [`coverage`] | `coverage` and `review` commands |
//! | [`search`] | `search` and `sailing` commands |
//! | [`server`] | HTTP API |

pub mod config;
pub mod coverage;
pub mod credentials;
pub mod db;
pub mod feed;
pub mod ingest;
pub mod migrate;
pub mod progress;
pub mod runs;
pub mod search;
pub mod server;
pub mod sqlite_store;
