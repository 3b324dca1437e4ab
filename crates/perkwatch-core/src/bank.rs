//! Bank — immutable reference entity owning a loyalty programme.
//!
//! Banks are created by configuration and never mutated by the engine; they
//! exist so ledger rows and digests can carry a display name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bank {
  pub bank_id:     i64,
  pub name:        String,
  pub loyalty_url: String,
  pub created_at:  DateTime<Utc>,
}

/// Input to [`crate::store::PartnerStore::add_bank`].
#[derive(Debug, Clone)]
pub struct NewBank {
  pub name:        String,
  pub loyalty_url: String,
}
