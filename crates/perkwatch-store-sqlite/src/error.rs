//! Error type for `perkwatch-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] perkwatch_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// Reconciliation was asked to run against an unregistered bank.
  #[error("bank not found: {0}")]
  BankNotFound(i64),

  #[error("category not found: {0}")]
  CategoryNotFound(i64),

  /// More than one current row exists for a ledger key. The schema makes
  /// this unreachable through this store; seeing it means the database was
  /// tampered with or written by something else, and the pass is rejected
  /// rather than silently picking a row.
  #[error(
    "data integrity violation: {count} current rows for partner {partner_name:?} \
     in bank {bank_id} category {category_id}"
  )]
  CurrentRowConflict {
    bank_id:      i64,
    category_id:  i64,
    partner_name: String,
    count:        usize,
  },
}

impl Error {
  /// `true` when the failing call rejected its input before touching the
  /// database, `false` when a transaction was started and rolled back.
  /// Either way the same call is safe to retry verbatim.
  pub fn is_rejected_before_write(&self) -> bool {
    matches!(self, Self::BankNotFound(_) | Self::CategoryNotFound(_))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
