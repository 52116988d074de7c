//! Networking layer.
//!
//! - [`tcp`] - TCP listener abstraction shared by the protocol gateways

pub mod tcp;
