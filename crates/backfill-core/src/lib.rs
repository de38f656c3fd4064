//! backfill-core: Core library for backfill
//!
//! This crate replays historical records from an append-only store into the
//! downstream event stream, without triggering the side effects reserved for
//! live ingestion (alerts, regression detection, counters).
//!
//! # Architecture
//!
//! ```text
//! Config → Orchestrator → Window → RangeIterator (pages)
//!                                        ↓
//!                               Enricher (1 lookup per entity type per page)
//!                                        ↓
//!                           fingerprint → StreamPublisher (one record at a time)
//! ```
//!
//! # Modules
//!
//! - `model`: records, containers, groups, windows, pages
//! - `source`: upstream data source boundary and the SQLite backend
//! - `range`: keyset-paginated traversal of a fixed window
//! - `enrich`: batched container/group resolution
//! - `fingerprint`: primary hash derivation
//! - `publish`: downstream event stream boundary and sinks
//! - `orchestrator`: run state machine, skip switch, progress, failure context
//! - `config`: TOML configuration with environment overrides
//! - `logging`: structured logging setup
//! - `error`: error taxonomy with operator remediation
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod enrich;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod publish;
pub mod range;
pub mod source;

pub use error::{Error, Result};
pub use orchestrator::{BackfillFailure, BackfillOrchestrator, BackfillReport, BackfillState};
