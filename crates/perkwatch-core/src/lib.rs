//! Core types and trait definitions for the perkwatch partner ledger.
//!
//! This crate is deliberately free of database and I/O dependencies.
//! All other crates depend on it; the status state machine lives here so it
//! can be unit-tested in isolation from storage.

pub mod bank;
pub mod category;
pub mod digest;
pub mod error;
pub mod partner;
pub mod store;
pub mod transition;

pub use error::{Error, Result};
