//! # `LaminarDB` Committed Item List
//!
//! Per-core sharded staging list sitting in front of the write-ahead log.
//! Transactions stage log items here; a background push periodically drains
//! everything staged so far into one commit context for the log writer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ScaleController                        │
//! │                    sequence (parity → active)                │
//! │                                                              │
//! │   ┌───────────────────────┐     ┌───────────────────────┐    │
//! │   │   GenerationShard 0   │     │   GenerationShard 1   │    │
//! │   │  ┌──────┐ ┌──────┐    │     │  ┌──────┐ ┌──────┐    │    │
//! │   │  │core 0│ │core 1│ …  │     │  │core 0│ │core 1│ …  │    │
//! │   │  └──┬───┘ └──┬───┘    │     │  └──────┘ └──────┘    │    │
//! │   │     └───┬────┘        │     │                       │    │
//! │   │   space_counter       │     │   space_counter       │    │
//! │   │   is_empty            │     │   is_empty            │    │
//! │   └─────────┬─────────────┘     └───────────────────────┘    │
//! │             │ push: gather every core                        │
//! │             ▼                                                │
//! │       CommitContext ───────────────► log writer              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Commits append to their core's slot in generation `sequence & 1` and only
//! touch shared atomics when their local byte count crosses a bucket of
//! `1 << stride` bytes. A push locks the active generation out, advances the
//! sequence so commits flow into the other generation, and merges every core
//! slot into a [`CommitContext`].
//!
//! ## Example
//!
//! ```rust
//! use laminar_cil::{CilConfig, LogGeometry, ScaleController, TransactionDelta};
//!
//! let config = CilConfig::builder().num_cores(4).per_core(256).build().unwrap();
//! let cil: ScaleController<&str, u64> =
//!     ScaleController::initialize(&LogGeometry::new(2048, 32256), config).unwrap();
//!
//! let receipt = cil
//!     .commit(0, TransactionDelta::new().item("inode 42", 176, 2).busy(7))
//!     .unwrap();
//! assert!(receipt.first);
//!
//! let ctx = cil.push();
//! assert_eq!(ctx.items, vec!["inode 42"]);
//! assert_eq!(ctx.busy_extents, vec![7]);
//! cil.teardown();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod controller;
mod error;
pub mod generation;
pub mod padded;
pub mod space;
pub mod store;

pub use config::{CilConfig, CilConfigBuilder, CilMode, LogGeometry, LogHandle};
pub use context::{CommitContext, ShardContext, Ticket, TransactionDelta};
pub use controller::{CommitReceipt, ScaleController};
pub use error::{CilError, CommitRejected};
pub use generation::{DrainGuard, GenerationShard, GenerationStats};
pub use space::SpaceUpdate;

/// Result type for laminar-cil operations
pub type Result<T> = std::result::Result<T, CilError>;
