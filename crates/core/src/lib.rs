//! Shipdesk Core - Shared shipping domain types.
//!
//! This crate provides the types shared by the Shipdesk components:
//! - `admin` - Carrier integration, persistence and HTTP routes
//! - `cli` - Command-line tools for migrations and carrier diagnostics
//!
//! # Architecture
//!
//! The core crate contains only types and validation - no I/O, no database
//! access, no HTTP clients. Order data arriving from the shop is converted into
//! these strongly-typed values at the boundary, before anything reaches the
//! carrier client.
//!
//! # Modules
//!
//! - [`types`] - IDs, money, shipment descriptions and label statuses

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
