//! Change digest types and grouping.
//!
//! The digest is the human-facing feed of same-day changes: which partners
//! appeared, changed their offer, or are going away. The store produces a
//! flat, ordered list of [`ChangeEvent`]s; grouping for presentation is a
//! pure function over that list and carries no extra state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::partner::OfferPayload;

// ─── Events ──────────────────────────────────────────────────────────────────

/// The consumer-facing classification of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
  /// First ever observation of the partner.
  New,
  /// The partner's offer payload changed.
  Updated,
  /// The partner entered its deletion grace period.
  Deleted,
}

/// One reportable change, denormalised with display names so the
/// presentation layer needs no further lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub bank_name:     String,
  pub category_name: String,
  pub partner_name:  String,
  pub payload:       OfferPayload,
  pub kind:          ChangeKind,
  pub checked_at:    DateTime<Utc>,
}

// ─── Grouping ────────────────────────────────────────────────────────────────

/// Events of one category within one bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryChanges {
  pub category_name: String,
  pub events:        Vec<ChangeEvent>,
}

/// Events of one bank, grouped by category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankChanges {
  pub bank_name:  String,
  pub categories: Vec<CategoryChanges>,
}

/// Group a flat change feed by bank, then category, preserving the input
/// order (the store already orders by bank name, category name, partner
/// name).
pub fn group_changes(events: Vec<ChangeEvent>) -> Vec<BankChanges> {
  let mut banks: Vec<BankChanges> = Vec::new();

  for event in events {
    let bank = match banks.last_mut() {
      Some(b) if b.bank_name == event.bank_name => b,
      _ => {
        banks.push(BankChanges {
          bank_name:  event.bank_name.clone(),
          categories: Vec::new(),
        });
        banks.last_mut().expect("just pushed")
      }
    };

    let category = match bank.categories.last_mut() {
      Some(c) if c.category_name == event.category_name => c,
      _ => {
        bank.categories.push(CategoryChanges {
          category_name: event.category_name.clone(),
          events:        Vec::new(),
        });
        bank.categories.last_mut().expect("just pushed")
      }
    };

    category.events.push(event);
  }

  banks
}
