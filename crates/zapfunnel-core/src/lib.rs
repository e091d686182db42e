//! Core domain + application logic for the payment-triggered funnel engine.
//!
//! This crate is intentionally framework-agnostic. The messaging gateway and
//! the HTTP webhook surface live behind ports (traits) implemented in adapter
//! crates.

pub mod config;
pub mod contacts;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod events;
pub mod funnel;
pub mod gateway;
pub mod identity;
pub mod idempotency;
pub mod logging;
pub mod snapshot;
pub mod stats;
pub mod store;

pub use errors::{Error, Result};
