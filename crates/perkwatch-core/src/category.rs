//! Versioned categories.
//!
//! `(bank_id, name)` logically identifies a category; each version gets its
//! own id. A new version is cut only when the source URL or the observed
//! partner count changes, so old category ids stay valid foreign keys for
//! historical ledger rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted version of a category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryVersion {
  pub category_id:    i64,
  pub bank_id:        i64,
  pub name:           String,
  pub url:            String,
  pub partners_count: Option<i64>,
  pub checked_at:     DateTime<Utc>,
}

/// What a scrape pass saw for a category; input to
/// [`crate::store::PartnerStore::resolve_category`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryObservation {
  pub name:           String,
  pub url:            String,
  pub partners_count: Option<i64>,
}

impl CategoryObservation {
  /// Whether `latest` already describes this observation, i.e. no new
  /// version is needed.
  pub fn matches(&self, latest: &CategoryVersion) -> bool {
    self.url == latest.url && self.partners_count == latest.partners_count
  }
}
