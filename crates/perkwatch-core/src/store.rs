//! The `PartnerStore` trait and the reconcile request/summary types.
//!
//! The trait is implemented by storage backends (e.g.
//! `perkwatch-store-sqlite`). Callers (CLI, schedulers, bots) depend on this
//! abstraction, not on any concrete backend.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  bank::{Bank, NewBank},
  category::{CategoryObservation, CategoryVersion},
  digest::ChangeEvent,
  partner::{OfferPayload, PartnerRecord, ScrapedPartner},
};

// ─── Reconcile I/O ───────────────────────────────────────────────────────────

/// One freshly scraped snapshot for a `(bank, category)` scope.
/// `category_id` must already be resolved via
/// [`PartnerStore::resolve_category`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRequest {
  pub bank_id:     i64,
  pub category_id: i64,
  pub partners:    Vec<ScrapedPartner>,
}

/// What a reconciliation pass did to the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
  /// Rows appended with status `new` (first ever observation).
  pub inserted:     u64,
  /// Rows appended with status `live` because the payload changed.
  pub updated:      u64,
  /// Rows appended with status `live` for partners coming back from
  /// grace or deletion.
  pub resurrected:  u64,
  /// In-place `ready` → `live` flips (unchanged re-confirmations).
  pub confirmed:    u64,
  /// Rows entering the deletion grace period (`new_delete`).
  pub soft_deleted: u64,
  /// Rows finally marked `delete`.
  pub hard_deleted: u64,
}

impl ReconcileSummary {
  /// Whether the pass changed anything a digest consumer would care about.
  pub fn has_changes(&self) -> bool {
    self.inserted + self.updated + self.resurrected
      + self.soft_deleted + self.hard_deleted
      > 0
  }
}

// ─── Search ──────────────────────────────────────────────────────────────────

/// One match of a partner name search, denormalised with display names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerHit {
  pub bank_name:     String,
  pub category_name: String,
  pub partner_name:  String,
  pub payload:       OfferPayload,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a perkwatch storage backend.
///
/// The partner ledger is append-mostly: the only in-place mutations are the
/// status transitions performed inside a reconciliation pass, and each pass
/// is atomic. Implementations must serialise passes per
/// `(bank_id, category_id)`; passes over different scopes may overlap.
///
/// All methods return `Send` futures so the trait can be used from
/// multi-threaded async runtimes.
pub trait PartnerStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Banks ─────────────────────────────────────────────────────────────

  /// Register a bank. Reference data; never touched by reconciliation.
  fn add_bank(
    &self,
    input: NewBank,
  ) -> impl Future<Output = Result<Bank, Self::Error>> + Send + '_;

  /// Retrieve a bank by id. Returns `None` if not found.
  fn get_bank(
    &self,
    bank_id: i64,
  ) -> impl Future<Output = Result<Option<Bank>, Self::Error>> + Send + '_;

  /// All banks, ordered by name.
  fn list_banks(
    &self,
  ) -> impl Future<Output = Result<Vec<Bank>, Self::Error>> + Send + '_;

  // ── Categories ────────────────────────────────────────────────────────

  /// Resolve a category observation to a version id, cutting a new version
  /// when the URL or partner count differs from the latest one.
  fn resolve_category(
    &self,
    bank_id: i64,
    observation: CategoryObservation,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  /// The latest version of every category of a bank, ordered by name.
  fn latest_categories(
    &self,
    bank_id: i64,
  ) -> impl Future<Output = Result<Vec<CategoryVersion>, Self::Error>> + Send + '_;

  // ── Reconciliation ────────────────────────────────────────────────────

  /// Merge one scraped snapshot into the ledger; fully commits or fully
  /// rolls back. Re-running with the same snapshot is idempotent.
  fn reconcile(
    &self,
    request: ReconcileRequest,
  ) -> impl Future<Output = Result<ReconcileSummary, Self::Error>> + Send + '_;

  /// Best-effort housekeeping: physically remove the history of partners
  /// whose current status is `delete`. Returns the number of rows removed.
  /// Never required for correctness.
  fn purge_deleted(
    &self,
    bank_id: i64,
    category_id: i64,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Current rows in an active status (`new`/`live`) for a scope, ordered
  /// by partner name.
  fn active_partners(
    &self,
    bank_id: i64,
    category_id: i64,
  ) -> impl Future<Output = Result<Vec<PartnerRecord>, Self::Error>> + Send + '_;

  /// Active partners across all scopes whose name contains `query` under
  /// [`crate::partner::normalize_name`] matching, ordered by bank name,
  /// category name, partner name. A query that normalises to the empty
  /// string matches nothing.
  fn search_partners(
    &self,
    query: String,
  ) -> impl Future<Output = Result<Vec<PartnerHit>, Self::Error>> + Send + '_;

  /// The change feed: one event per key whose current row changed at or
  /// after `since`. An empty window yields an empty list, never an error.
  fn changes_since(
    &self,
    since: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<ChangeEvent>, Self::Error>> + Send + '_;
}
