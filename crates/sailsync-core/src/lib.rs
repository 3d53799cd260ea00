//! # SailSync Core
//!
//! Domain logic for SailSync: feed records, canonical entity resolution,
//! sailing upserts, search semantics, coverage reporting, and the store
//! abstraction.
//!
//! This crate contains no sqlx, filesystem, or HTTP code. The application
//! crate supplies a SQLite-backed store; [`store::memory::InMemoryStore`]
//! backs tests and embedded use.
//!
//! # Pipeline
//!
//! ```text
//! raw bytes ──► feed::parse_record ──► feed::validate
//!                                           │
//!                                           ▼
//!                          resolve::resolve_refs (stubs as needed)
//!                                           │
//!                                           ▼
//!                           upsert::upsert (one transaction)
//! ```

pub mod coverage;
pub mod error;
pub mod feed;
pub mod models;
pub mod resolve;
pub mod search;
pub mod store;
pub mod upsert;
