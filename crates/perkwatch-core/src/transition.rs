//! The reconciliation status machine, free of any storage concern.
//!
//! Every status change the engine can make is decided here, in three pure
//! functions matching the three mutation phases of a pass:
//!
//! 1. [`mark_pending`] — flip confirmed rows to `Ready` before matching.
//! 2. [`observe`] — decide what to do for one incoming snapshot entry.
//! 3. [`sweep`] — settle rows that were not re-confirmed.
//!
//! Storage backends translate the returned decisions into row updates and
//! inserts inside a single transaction.

use serde::{Deserialize, Serialize};

use crate::partner::PartnerStatus;

// ─── Policy ──────────────────────────────────────────────────────────────────

/// How many absent passes a partner survives before hard deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GracePolicy {
  /// One pass of grace: absent rows go `new_delete` first, `delete` on the
  /// next absent pass. Absorbs transient scrape failures.
  #[default]
  OnePass,
  /// No grace: absent rows go straight to `delete`.
  Immediate,
}

// ─── Phase 1: mark pending ───────────────────────────────────────────────────

/// Status change applied to every current row of the scope before matching:
/// "I expect to re-confirm you this pass; if I don't, you are missing."
///
/// Rows already in grace or deleted are left alone — they are logically gone
/// and only come back through resurrection in [`observe`].
pub fn mark_pending(status: PartnerStatus) -> Option<PartnerStatus> {
  match status {
    PartnerStatus::New | PartnerStatus::Live => Some(PartnerStatus::Ready),
    PartnerStatus::Ready | PartnerStatus::NewDelete | PartnerStatus::Delete => {
      None
    }
  }
}

// ─── Phase 2: observe ────────────────────────────────────────────────────────

/// What the engine must do for one incoming snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveAction {
  /// No current row for the key: append a row with status `new`.
  AppendNew,
  /// Append a row with status `live`; `resurrected` distinguishes a partner
  /// coming back from grace/deletion from a plain payload change.
  AppendLive { resurrected: bool },
  /// Re-confirmation of unchanged data: flip the current row back to `live`
  /// in place. No new row, no event.
  FlipLive,
  /// Current row is already `live` with an identical payload (tolerated
  /// mid-pass); nothing to do.
  Keep,
}

/// Decide the action for one snapshot entry.
///
/// `current` is the key's current row, if any, as `(status, payload_matches)`
/// where `payload_matches` is normalised payload equality against the
/// incoming entry.
pub fn observe(current: Option<(PartnerStatus, bool)>) -> ObserveAction {
  match current {
    None => ObserveAction::AppendNew,
    // A partner in grace or deleted that shows up again is resurrected with
    // a fresh row, even when the payload is unchanged — the reappearance
    // itself is the event.
    Some((PartnerStatus::NewDelete | PartnerStatus::Delete, _)) => {
      ObserveAction::AppendLive { resurrected: true }
    }
    Some((PartnerStatus::Live, true)) => ObserveAction::Keep,
    Some((PartnerStatus::Ready | PartnerStatus::New, true)) => {
      ObserveAction::FlipLive
    }
    Some((_, false)) => ObserveAction::AppendLive { resurrected: false },
  }
}

// ─── Phase 3: sweep ──────────────────────────────────────────────────────────

/// Settle one row that was not re-confirmed this pass.
///
/// Callers must advance `NewDelete` rows before demoting `Ready` rows;
/// otherwise a row demoted to `new_delete` in this pass would be advanced to
/// `delete` in the same pass, skipping its grace period.
pub fn sweep(
  status: PartnerStatus,
  policy: GracePolicy,
) -> Option<PartnerStatus> {
  match (status, policy) {
    (PartnerStatus::NewDelete, _) => Some(PartnerStatus::Delete),
    (PartnerStatus::Ready, GracePolicy::OnePass) => {
      Some(PartnerStatus::NewDelete)
    }
    (PartnerStatus::Ready, GracePolicy::Immediate) => {
      Some(PartnerStatus::Delete)
    }
    _ => None,
  }
}
