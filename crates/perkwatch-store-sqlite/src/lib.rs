//! SQLite backend for the perkwatch partner ledger.
//!
//! Implements [`perkwatch_core::store::PartnerStore`] on top of a single
//! SQLite file (WAL mode). Each reconciliation pass runs in one transaction
//! and either fully commits or fully rolls back.

mod encode;
mod error;
mod schema;
mod store;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use store::SqliteStore;
