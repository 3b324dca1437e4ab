//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! All timestamps are RFC 3339 UTC strings with microsecond precision and a
//! trailing `Z`. The fixed format keeps lexicographic string comparison in
//! SQL consistent with chronological order, which the digest window filter
//! relies on.

use chrono::{DateTime, SecondsFormat, Utc};
use perkwatch_core::{
  bank::Bank,
  category::CategoryVersion,
  digest::{ChangeEvent, ChangeKind},
  partner::{OfferPayload, PartnerRecord, PartnerStatus},
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

/// Variant of [`decode_dt`] usable inside rusqlite row-mapping closures.
pub fn dt_from_sql(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| {
      rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(e),
      )
    })
}

// ─── PartnerStatus ───────────────────────────────────────────────────────────

/// Variant of [`PartnerStatus::parse`] usable inside rusqlite row-mapping
/// closures.
pub fn status_from_sql(idx: usize, s: &str) -> rusqlite::Result<PartnerStatus> {
  PartnerStatus::parse(s).map_err(|e| {
    rusqlite::Error::FromSqlConversionFailure(
      idx,
      rusqlite::types::Type::Text,
      Box::new(e),
    )
  })
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read directly from a `banks` row.
pub struct RawBank {
  pub bank_id:     i64,
  pub name:        String,
  pub loyalty_url: String,
  pub created_at:  String,
}

impl RawBank {
  pub fn into_bank(self) -> Result<Bank> {
    Ok(Bank {
      bank_id:     self.bank_id,
      name:        self.name,
      loyalty_url: self.loyalty_url,
      created_at:  decode_dt(&self.created_at)?,
    })
  }
}

/// Raw strings read directly from a `categories` row.
pub struct RawCategory {
  pub category_id:    i64,
  pub bank_id:        i64,
  pub name:           String,
  pub url:            String,
  pub partners_count: Option<i64>,
  pub checked_at:     String,
}

impl RawCategory {
  pub fn into_version(self) -> Result<CategoryVersion> {
    Ok(CategoryVersion {
      category_id:    self.category_id,
      bank_id:        self.bank_id,
      name:           self.name,
      url:            self.url,
      partners_count: self.partners_count,
      checked_at:     decode_dt(&self.checked_at)?,
    })
  }
}

/// Raw strings read directly from a `partners` row.
pub struct RawPartner {
  pub partner_id:    i64,
  pub bank_id:       i64,
  pub category_id:   i64,
  pub partner_name:  String,
  pub partner_bonus: Option<String>,
  pub partner_link:  Option<String>,
  pub checked_at:    String,
  pub status:        String,
  pub is_current:    bool,
}

impl RawPartner {
  pub fn into_record(self) -> Result<PartnerRecord> {
    Ok(PartnerRecord {
      partner_id:   self.partner_id,
      bank_id:      self.bank_id,
      category_id:  self.category_id,
      partner_name: self.partner_name,
      payload:      OfferPayload::new(
        self.partner_bonus.as_deref(),
        self.partner_link.as_deref(),
      ),
      checked_at:   decode_dt(&self.checked_at)?,
      status:       PartnerStatus::parse(&self.status)?,
      current:      self.is_current,
    })
  }
}

/// One candidate row of the change feed, joined with display names and the
/// key's immediately preceding ledger row.
pub struct RawChange {
  pub bank_name:     String,
  pub category_name: String,
  pub partner_name:  String,
  pub partner_bonus: Option<String>,
  pub partner_link:  Option<String>,
  pub checked_at:    String,
  pub status:        String,
  pub prev_exists:   bool,
  pub prev_bonus:    Option<String>,
  pub prev_link:     Option<String>,
}

impl RawChange {
  /// Classify the row for the digest; returns `None` for rows that are not
  /// reportable (`live` without a payload change, `ready`, `delete`).
  pub fn into_event(self) -> Result<Option<ChangeEvent>> {
    let payload = OfferPayload::new(
      self.partner_bonus.as_deref(),
      self.partner_link.as_deref(),
    );

    let kind = match PartnerStatus::parse(&self.status)? {
      PartnerStatus::New => ChangeKind::New,
      PartnerStatus::NewDelete => ChangeKind::Deleted,
      PartnerStatus::Live => {
        let prev = OfferPayload::new(
          self.prev_bonus.as_deref(),
          self.prev_link.as_deref(),
        );
        if self.prev_exists && prev != payload {
          ChangeKind::Updated
        } else {
          // Reconfirmation flip or resurrection with an unchanged offer.
          return Ok(None);
        }
      }
      PartnerStatus::Ready | PartnerStatus::Delete => return Ok(None),
    };

    Ok(Some(ChangeEvent {
      bank_name: self.bank_name,
      category_name: self.category_name,
      partner_name: self.partner_name,
      payload,
      kind,
      checked_at: decode_dt(&self.checked_at)?,
    }))
  }
}
