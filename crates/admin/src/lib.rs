//! Shipdesk Admin library.
//!
//! This crate provides the admin functionality as a library,
//! allowing it to be tested and reused.
//!
//! # Security
//!
//! This crate holds the carrier account credentials, which can buy labels
//! against the prepaid balance. Only deploy on private infrastructure.
//!
//! # Modules
//!
//! - [`melhor_envio`] - Carrier integration (tokens, quotes, labels)
//! - [`db`] - `PostgreSQL` persistence for tokens and labels
//! - [`routes`] - Axum HTTP handlers

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod db;
pub mod error;
pub mod melhor_envio;
pub mod routes;
pub mod state;
