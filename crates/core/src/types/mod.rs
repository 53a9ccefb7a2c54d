//! Core types for Shipdesk.
//!
//! This module provides type-safe wrappers for shipping domain concepts.

pub mod id;
pub mod price;
pub mod shipment;
pub mod status;

pub use id::*;
pub use price::{CurrencyCode, Price, PriceParseError};
pub use shipment::{Address, Package, PostalCode, ShipmentError, ShipmentRequest};
pub use status::*;
