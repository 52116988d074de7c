//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Component startup and shutdown
//! - [`time`] - Coalescing windows and deadline queues
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
