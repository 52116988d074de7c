//! plotsync - collaborative data-flow synchronization server.
//!
//! Several AR headsets, tablets and a tracking service share one workspace of
//! plots (2D views over a tabular dataset), links (directed data-flow edges
//! between plots) and filters (polygons drawn on a plot). The server holds the
//! authoritative state, recomputes derived datasets along the link graph and
//! pushes field-level diffs to every connected client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Protocol Gateway                         │
//! │    framed TCP (native)  │  framed TCP (tracker)  │  WebSocket   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ AdapterEvent
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                             Engine                              │
//! │     router │ Dataflow │ Filter │ Color │ admin commands         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Entity Store                           │
//! │          Plot │ Link │ Filter │ Client │ change bus             │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Storage worker (SQLite thread)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core`] - Configuration, errors, runtime, timers
//! - [`store`] - Entity Store
//! - [`storage`] - Relational backing store
//! - [`adapters`] - Protocol Gateway transports and client registry
//! - [`net`] - TCP listener
//! - [`engine`] - Event loop and recompute engines
//! - [`cli`] - CLI commands
//!
//! # Key Invariants
//!
//! - A plot is recomputed only after every upstream plot in the same cascade.
//! - A structural change cancels the running cascade; its remaining plots are
//!   rescheduled.
//! - Each connected component of the plot graph has at most one colorer.
//! - Each registered connection produces exactly one disconnect.

// Core infrastructure
pub mod core;

// Entity cache and persistence
pub mod storage;
pub mod store;

// Protocol gateway
pub mod adapters;
pub mod net;

// Event loop
pub mod engine;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use engine::Engine;
