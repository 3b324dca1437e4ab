//! Partner types — the unit of history in the perkwatch ledger.
//!
//! A partner observation is an append-mostly ledger row. Rows are never
//! rewritten except for in-place status transitions performed by the
//! reconciliation engine; everything else is expressed by appending a new
//! row and moving the current pointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Status ──────────────────────────────────────────────────────────────────

/// Lifecycle status of a ledger row. The string form is what lands in the
/// `status` column.
///
/// A partner begins at `New`, cycles between `Live` (confirmed present) and
/// `Ready` (pending re-confirmation during an in-flight pass), and ends at
/// `Delete` after enough consecutive passes without an observation — unless
/// it reappears first, in which case it is resurrected to `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerStatus {
  /// First ever observation of this partner key.
  New,
  /// Confirmed present as of the latest completed pass.
  Live,
  /// Awaiting re-confirmation; only exists mid-pass.
  Ready,
  /// Missed one pass — grace period, still surfaced as "going away".
  NewDelete,
  /// Missed enough passes to be considered gone.
  Delete,
}

impl PartnerStatus {
  /// The string stored in the `status` column.
  pub fn as_str(self) -> &'static str {
    match self {
      Self::New => "new",
      Self::Live => "live",
      Self::Ready => "ready",
      Self::NewDelete => "new_delete",
      Self::Delete => "delete",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "new" => Ok(Self::New),
      "live" => Ok(Self::Live),
      "ready" => Ok(Self::Ready),
      "new_delete" => Ok(Self::NewDelete),
      "delete" => Ok(Self::Delete),
      other => Err(Error::UnknownStatus(other.to_owned())),
    }
  }

  /// Whether a row in this status counts as present in active listings.
  pub fn is_active(self) -> bool { matches!(self, Self::New | Self::Live) }
}

// ─── Offer payload ───────────────────────────────────────────────────────────

/// The free-form offer details of an observation. Treated as opaque: the
/// engine only ever compares payloads for equality.
///
/// Construction normalises both fields — whitespace is trimmed and the empty
/// string collapses to `None` — so `""`, `"  "` and absent all compare equal
/// and cannot cause spurious status churn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
  pub bonus: Option<String>,
  pub link:  Option<String>,
}

impl OfferPayload {
  pub fn new(bonus: Option<&str>, link: Option<&str>) -> Self {
    Self { bonus: normalize_opt(bonus), link: normalize_opt(link) }
  }
}

fn normalize_opt(s: Option<&str>) -> Option<String> {
  match s.map(str::trim) {
    None | Some("") => None,
    Some(t) => Some(t.to_owned()),
  }
}

// ─── Scraped input ───────────────────────────────────────────────────────────

/// One raw tuple emitted by a scrape adapter. Untrusted input: the name may
/// be blank and the same tuple may appear several times in one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedPartner {
  pub name:  String,
  #[serde(default)]
  pub bonus: Option<String>,
  #[serde(default)]
  pub link:  Option<String>,
}

impl ScrapedPartner {
  pub fn payload(&self) -> OfferPayload {
    OfferPayload::new(self.bonus.as_deref(), self.link.as_deref())
  }
}

/// A snapshot entry after validation: non-empty trimmed name, normalised
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
  pub name:    String,
  pub payload: OfferPayload,
}

/// Validate and deduplicate a raw snapshot.
///
/// Entries with an empty (post-trim) name are silently dropped. Duplicates
/// by `(name, bonus, link)` keep their first occurrence; order is otherwise
/// preserved.
pub fn dedup_snapshot(raw: &[ScrapedPartner]) -> Vec<SnapshotEntry> {
  let mut seen: Vec<SnapshotEntry> = Vec::with_capacity(raw.len());
  for p in raw {
    let name = p.name.trim();
    if name.is_empty() {
      continue;
    }
    let entry = SnapshotEntry { name: name.to_owned(), payload: p.payload() };
    if !seen.contains(&entry) {
      seen.push(entry);
    }
  }
  seen
}

// ─── Name search ─────────────────────────────────────────────────────────────

/// Normalise a partner name for search matching: lowercase, fold `ё` to
/// `е`, strip whitespace, guillemets and common punctuation. "Кофе-Хауз"
/// and "кофехауз" compare equal.
pub fn normalize_name(text: &str) -> String {
  text
    .chars()
    .flat_map(char::to_lowercase)
    .filter_map(|c| match c {
      'ё' => Some('е'),
      '«' | '»' | '-' | '.' | ',' => None,
      c if c.is_whitespace() => None,
      c => Some(c),
    })
    .collect()
}

// ─── Ledger row ──────────────────────────────────────────────────────────────

/// A row of the partner ledger. `current` marks exactly one row per
/// `(bank_id, category_id, partner_name)` key; that row's status is the
/// partner's present lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerRecord {
  pub partner_id:   i64,
  pub bank_id:      i64,
  pub category_id:  i64,
  pub partner_name: String,
  pub payload:      OfferPayload,
  pub checked_at:   DateTime<Utc>,
  pub status:       PartnerStatus,
  pub current:      bool,
}
