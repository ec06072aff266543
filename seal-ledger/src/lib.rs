//! Sealed audit ledger
//!
//! Periodically seals new rows of append-only relational tables into
//! hash-chained, Merkle-rooted blocks, and serves inclusion receipts for
//! individual rows.
//!
//! # Architecture
//!
//! - **Two ledgers**: settlement (wallet transactions, trade fills) and audit
//!   (security logs), each with its own chain, cursors, lock and action log
//! - **Single sealer**: a lease-based lock document with a heartbeat keeps one
//!   producer per ledger
//! - **Merkle tree**: every block commits to its items; receipts carry the path
//! - **Back-pointers**: sealed rows point at their block; the reconciler
//!   repairs pointers a failed write left behind

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]
//!
//! # Invariants
//!
//! - Heights are contiguous from 1; block 1 links to `sha256("GENESIS")`
//! - A row is sealed at most once: cursors only move forward
//! - Items within a block are ordered by `(createdAt, source, sourceId)`
//! - Blocks are never rewritten; finalization only records who and when

pub mod actions;
pub mod canonical;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod merkle;
pub mod metrics;
pub mod receipt;
pub mod reconciler;
pub mod scheduler;
pub mod sealer;
pub mod store;
pub mod types;
pub mod verify;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use lock::UnlockRequest;
pub use receipt::{Receipt, Requester};
pub use sealer::{CommitOutcome, CommitRequest, CommitSummary};
pub use types::{Block, BlockStatus, Item, LedgerKind, RequestMeta, Source};
