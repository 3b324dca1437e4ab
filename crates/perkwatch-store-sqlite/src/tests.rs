//! Integration tests for `SqliteStore` against an in-memory database.

use chrono::{Duration, Utc};
use perkwatch_core::{
  bank::NewBank,
  category::CategoryObservation,
  digest::ChangeKind,
  partner::{PartnerStatus, ScrapedPartner},
  store::{PartnerStore, ReconcileRequest},
  transition::GracePolicy,
};

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

/// Register a bank and resolve one category for it.
async fn scope(s: &SqliteStore) -> (i64, i64) {
  let bank = s
    .add_bank(NewBank {
      name:        "Alfa".into(),
      loyalty_url: "https://alfa.example/loyalty".into(),
    })
    .await
    .unwrap();
  let category_id = s
    .resolve_category(bank.bank_id, CategoryObservation {
      name:           "Food".into(),
      url:            "https://alfa.example/loyalty/food".into(),
      partners_count: None,
    })
    .await
    .unwrap();
  (bank.bank_id, category_id)
}

fn partner(name: &str, bonus: &str, link: &str) -> ScrapedPartner {
  ScrapedPartner {
    name:  name.into(),
    bonus: Some(bonus.into()),
    link:  Some(link.into()),
  }
}

async fn pass(
  s: &SqliteStore,
  bank_id: i64,
  category_id: i64,
  partners: Vec<ScrapedPartner>,
) -> perkwatch_core::store::ReconcileSummary {
  s.reconcile(ReconcileRequest { bank_id, category_id, partners })
    .await
    .unwrap()
}

fn yesterday() -> chrono::DateTime<Utc> { Utc::now() - Duration::days(1) }

// ─── Banks ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn add_and_get_bank() {
  let s = store().await;
  let bank = s
    .add_bank(NewBank {
      name:        "Beta".into(),
      loyalty_url: "https://beta.example".into(),
    })
    .await
    .unwrap();

  let fetched = s.get_bank(bank.bank_id).await.unwrap().unwrap();
  assert_eq!(fetched.name, "Beta");
  assert_eq!(fetched.loyalty_url, "https://beta.example");
}

#[tokio::test]
async fn get_bank_missing_returns_none() {
  let s = store().await;
  assert!(s.get_bank(404).await.unwrap().is_none());
}

#[tokio::test]
async fn list_banks_ordered_by_name() {
  let s = store().await;
  for name in ["Zeta", "Alfa", "Mid"] {
    s.add_bank(NewBank {
      name:        name.into(),
      loyalty_url: "https://x.example".into(),
    })
    .await
    .unwrap();
  }

  let names: Vec<_> = s
    .list_banks()
    .await
    .unwrap()
    .into_iter()
    .map(|b| b.name)
    .collect();
  assert_eq!(names, ["Alfa", "Mid", "Zeta"]);
}

// ─── Category versioning ─────────────────────────────────────────────────────

#[tokio::test]
async fn resolve_category_reuses_unchanged_version() {
  let s = store().await;
  let (bank_id, _) = scope(&s).await;

  let obs = CategoryObservation {
    name:           "Travel".into(),
    url:            "https://alfa.example/travel".into(),
    partners_count: Some(7),
  };

  let first = s.resolve_category(bank_id, obs.clone()).await.unwrap();
  let second = s.resolve_category(bank_id, obs).await.unwrap();
  assert_eq!(first, second);
}

#[tokio::test]
async fn resolve_category_cuts_new_version_on_change() {
  let s = store().await;
  let (bank_id, _) = scope(&s).await;

  let obs = CategoryObservation {
    name:           "Travel".into(),
    url:            "https://alfa.example/travel".into(),
    partners_count: Some(7),
  };
  let v1 = s.resolve_category(bank_id, obs.clone()).await.unwrap();

  let v2 = s
    .resolve_category(bank_id, CategoryObservation {
      partners_count: Some(8),
      ..obs.clone()
    })
    .await
    .unwrap();
  assert_ne!(v1, v2);

  let v3 = s
    .resolve_category(bank_id, CategoryObservation {
      url: "https://alfa.example/travel2".into(),
      partners_count: Some(8),
      ..obs
    })
    .await
    .unwrap();
  assert_ne!(v2, v3);
}

#[tokio::test]
async fn latest_categories_one_version_per_name() {
  let s = store().await;
  let (bank_id, _) = scope(&s).await;

  let obs = CategoryObservation {
    name:           "Travel".into(),
    url:            "https://alfa.example/travel".into(),
    partners_count: Some(1),
  };
  s.resolve_category(bank_id, obs.clone()).await.unwrap();
  let latest_id = s
    .resolve_category(bank_id, CategoryObservation {
      partners_count: Some(2),
      ..obs
    })
    .await
    .unwrap();

  let categories = s.latest_categories(bank_id).await.unwrap();
  // "Food" from scope() plus one "Travel", not two.
  assert_eq!(categories.len(), 2);
  assert_eq!(categories[0].name, "Food");
  assert_eq!(categories[1].name, "Travel");
  assert_eq!(categories[1].category_id, latest_id);
  assert_eq!(categories[1].partners_count, Some(2));
}

#[tokio::test]
async fn resolve_category_for_unknown_bank_is_rejected() {
  let s = store().await;
  let err = s
    .resolve_category(404, CategoryObservation {
      name:           "Food".into(),
      url:            "https://x.example".into(),
      partners_count: None,
    })
    .await
    .unwrap_err();
  assert!(matches!(err, Error::BankNotFound(404)));
  assert!(err.is_rejected_before_write());
}

// ─── Reconciliation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn first_observation_inserts_new_row() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;

  let summary =
    pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  assert_eq!(summary.inserted, 1);
  assert_eq!(summary.updated, 0);
  assert_eq!(summary.resurrected, 0);

  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history.len(), 1);
  assert_eq!(history[0].status, PartnerStatus::New);
  assert!(history[0].current);
  assert_eq!(history[0].payload.bonus.as_deref(), Some("10%"));
}

#[tokio::test]
async fn identical_pass_is_idempotent() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  let snapshot = vec![partner("A", "10%", "x"), partner("B", "5%", "y")];

  pass(&s, bank_id, category_id, snapshot.clone()).await;
  let second = pass(&s, bank_id, category_id, snapshot).await;

  // Only ready → live flips on the second call, no new rows.
  assert_eq!(second.inserted, 0);
  assert_eq!(second.updated, 0);
  assert_eq!(second.resurrected, 0);
  assert_eq!(second.confirmed, 2);
  assert!(!second.has_changes());

  for name in ["A", "B"] {
    let history = s.history(bank_id, category_id, name).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PartnerStatus::Live);
  }
}

#[tokio::test]
async fn unchanged_reconfirmation_flips_in_place() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;

  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  let third =
    pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;

  assert_eq!(third.confirmed, 1);
  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history.len(), 1);
  assert_eq!(history[0].status, PartnerStatus::Live);
}

#[tokio::test]
async fn absence_takes_two_passes_to_delete() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;

  let first_absent = pass(&s, bank_id, category_id, vec![]).await;
  assert_eq!(first_absent.soft_deleted, 1);
  assert_eq!(first_absent.hard_deleted, 0);

  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history.len(), 1);
  assert_eq!(history[0].status, PartnerStatus::NewDelete);
  assert!(s.active_partners(bank_id, category_id).await.unwrap().is_empty());

  let second_absent = pass(&s, bank_id, category_id, vec![]).await;
  assert_eq!(second_absent.soft_deleted, 0);
  assert_eq!(second_absent.hard_deleted, 1);

  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history[0].status, PartnerStatus::Delete);
}

#[tokio::test]
async fn absent_partner_stays_gone_after_hard_delete() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![]).await;
  pass(&s, bank_id, category_id, vec![]).await;

  // Further absent passes must not touch the deleted row.
  let third_absent = pass(&s, bank_id, category_id, vec![]).await;
  assert!(!third_absent.has_changes());

  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history.len(), 1);
  assert_eq!(history[0].status, PartnerStatus::Delete);
}

#[tokio::test]
async fn resurrection_from_grace_period() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![]).await;

  let back = pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  assert_eq!(back.resurrected, 1);
  assert_eq!(back.inserted, 0);

  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[0].status, PartnerStatus::NewDelete);
  assert!(!history[0].current);
  assert_eq!(history[1].status, PartnerStatus::Live);
  assert!(history[1].current);
}

#[tokio::test]
async fn resurrection_from_hard_delete() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![]).await;
  pass(&s, bank_id, category_id, vec![]).await;

  let back = pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  assert_eq!(back.resurrected, 1);

  let active = s.active_partners(bank_id, category_id).await.unwrap();
  assert_eq!(active.len(), 1);
  assert_eq!(active[0].partner_name, "A");
  assert_eq!(active[0].status, PartnerStatus::Live);
}

#[tokio::test]
async fn payload_change_appends_live_row() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;

  let changed =
    pass(&s, bank_id, category_id, vec![partner("A", "20%", "x")]).await;
  assert_eq!(changed.updated, 1);
  assert_eq!(changed.inserted, 0);

  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[0].payload.bonus.as_deref(), Some("10%"));
  assert!(!history[0].current);
  assert_eq!(history[1].payload.bonus.as_deref(), Some("20%"));
  assert_eq!(history[1].status, PartnerStatus::Live);
  assert!(history[1].current);
}

#[tokio::test]
async fn in_batch_duplicates_collapse() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;

  let summary = pass(&s, bank_id, category_id, vec![
    partner("A", "10%", "x"),
    partner("A", "10%", "x"),
    partner("A", "10%", "x"),
  ])
  .await;
  assert_eq!(summary.inserted, 1);

  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn entries_without_a_name_are_skipped() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;

  let summary = pass(&s, bank_id, category_id, vec![
    partner("", "10%", "x"),
    partner("   ", "5%", "y"),
  ])
  .await;
  assert!(!summary.has_changes());
  assert!(s.active_partners(bank_id, category_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn blank_and_absent_payload_fields_compare_equal() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;

  pass(&s, bank_id, category_id, vec![ScrapedPartner {
    name:  "A".into(),
    bonus: Some("".into()),
    link:  None,
  }])
  .await;
  let second = pass(&s, bank_id, category_id, vec![ScrapedPartner {
    name:  "A".into(),
    bonus: None,
    link:  Some("  ".into()),
  }])
  .await;

  // No spurious payload-change row.
  assert_eq!(second.updated, 0);
  assert_eq!(second.confirmed, 1);
  assert_eq!(s.history(bank_id, category_id, "A").await.unwrap().len(), 1);
}

#[tokio::test]
async fn immediate_policy_skips_grace_period() {
  let s = store().await.with_policy(GracePolicy::Immediate);
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;

  let absent = pass(&s, bank_id, category_id, vec![]).await;
  assert_eq!(absent.soft_deleted, 0);
  assert_eq!(absent.hard_deleted, 1);

  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history[0].status, PartnerStatus::Delete);
}

#[tokio::test]
async fn scopes_do_not_interfere() {
  let s = store().await;
  let (bank_id, food) = scope(&s).await;
  let travel = s
    .resolve_category(bank_id, CategoryObservation {
      name:           "Travel".into(),
      url:            "https://alfa.example/travel".into(),
      partners_count: None,
    })
    .await
    .unwrap();

  pass(&s, bank_id, food, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, travel, vec![partner("B", "5%", "y")]).await;

  // An empty pass over Travel must not sweep Food's partners.
  pass(&s, bank_id, travel, vec![]).await;

  let food_active = s.active_partners(bank_id, food).await.unwrap();
  assert_eq!(food_active.len(), 1);
  assert_eq!(food_active[0].partner_name, "A");

  let travel_history = s.history(bank_id, travel, "B").await.unwrap();
  assert_eq!(travel_history[0].status, PartnerStatus::NewDelete);
}

#[tokio::test]
async fn single_current_row_survives_many_passes() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;

  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![partner("A", "20%", "x")]).await;
  pass(&s, bank_id, category_id, vec![]).await;
  pass(&s, bank_id, category_id, vec![partner("A", "30%", "x")]).await;
  pass(&s, bank_id, category_id, vec![partner("A", "30%", "x")]).await;

  let history = s.history(bank_id, category_id, "A").await.unwrap();
  assert_eq!(history.len(), 3);
  assert_eq!(history.iter().filter(|r| r.current).count(), 1);
  let current = history.last().unwrap();
  assert_eq!(current.status, PartnerStatus::Live);
  assert_eq!(current.payload.bonus.as_deref(), Some("30%"));

  // checked_at strictly increases along the history.
  for pair in history.windows(2) {
    assert!(pair[0].checked_at < pair[1].checked_at);
  }
}

#[tokio::test]
async fn reconcile_unknown_scope_is_rejected() {
  let s = store().await;

  let err = s
    .reconcile(ReconcileRequest {
      bank_id:     404,
      category_id: 404,
      partners:    vec![partner("A", "10%", "x")],
    })
    .await
    .unwrap_err();
  assert!(matches!(err, Error::BankNotFound(404)));
  assert!(err.is_rejected_before_write());

  let (bank_id, _) = scope(&s).await;
  let err = s
    .reconcile(ReconcileRequest {
      bank_id,
      category_id: 404,
      partners: vec![],
    })
    .await
    .unwrap_err();
  assert!(matches!(err, Error::CategoryNotFound(404)));
}

// ─── Partner search ──────────────────────────────────────────────────────────

#[tokio::test]
async fn search_ignores_case_spacing_and_punctuation() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![
    partner("Кофе-Хауз", "10%", "x"),
    partner("Алёнка", "5%", "y"),
  ])
  .await;

  let hits = s.search_partners("кофе хауз".into()).await.unwrap();
  assert_eq!(hits.len(), 1);
  assert_eq!(hits[0].partner_name, "Кофе-Хауз");
  assert_eq!(hits[0].bank_name, "Alfa");
  assert_eq!(hits[0].category_name, "Food");
  assert_eq!(hits[0].payload.bonus.as_deref(), Some("10%"));

  // Substring match after normalisation; ё folds to е.
  let hits = s.search_partners("АЛЕНК".into()).await.unwrap();
  assert_eq!(hits.len(), 1);
  assert_eq!(hits[0].partner_name, "Алёнка");
}

#[tokio::test]
async fn search_orders_hits_by_scope_then_name() {
  let s = store().await;
  let (bank_id, food) = scope(&s).await;
  let travel = s
    .resolve_category(bank_id, CategoryObservation {
      name:           "Travel".into(),
      url:            "https://alfa.example/travel".into(),
      partners_count: None,
    })
    .await
    .unwrap();

  pass(&s, bank_id, travel, vec![partner("Кофейня №1", "2%", "z")]).await;
  pass(&s, bank_id, food, vec![partner("Кофе-Хауз", "10%", "x")]).await;

  let hits = s.search_partners("кофе".into()).await.unwrap();
  assert_eq!(hits.len(), 2);
  assert_eq!(hits[0].category_name, "Food");
  assert_eq!(hits[0].partner_name, "Кофе-Хауз");
  assert_eq!(hits[1].category_name, "Travel");
  assert_eq!(hits[1].partner_name, "Кофейня №1");
}

#[tokio::test]
async fn search_skips_partners_going_away() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![]).await;

  assert!(s.search_partners("A".into()).await.unwrap().is_empty());
}

#[tokio::test]
async fn search_blank_query_matches_nothing() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;

  assert!(s.search_partners(" -., ".into()).await.unwrap().is_empty());
}

// ─── Change digest ───────────────────────────────────────────────────────────

#[tokio::test]
async fn digest_reports_new_partner() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;

  let events = s.changes_since(yesterday()).await.unwrap();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].kind, ChangeKind::New);
  assert_eq!(events[0].bank_name, "Alfa");
  assert_eq!(events[0].category_name, "Food");
  assert_eq!(events[0].partner_name, "A");
  assert_eq!(events[0].payload.bonus.as_deref(), Some("10%"));
}

#[tokio::test]
async fn digest_reports_payload_change_as_updated() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![partner("A", "20%", "x")]).await;

  let events = s.changes_since(yesterday()).await.unwrap();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].kind, ChangeKind::Updated);
  assert_eq!(events[0].payload.bonus.as_deref(), Some("20%"));
}

#[tokio::test]
async fn digest_reports_grace_period_as_deleted() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![]).await;

  let events = s.changes_since(yesterday()).await.unwrap();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].kind, ChangeKind::Deleted);
}

#[tokio::test]
async fn digest_is_silent_about_reconfirmations() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;

  // The second pass only flipped the row back to live; nothing to report
  // (the initial "new" row has been re-confirmed and is steady state now).
  let events = s.changes_since(yesterday()).await.unwrap();
  assert!(events.is_empty());
}

#[tokio::test]
async fn digest_emits_one_event_per_key() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;
  pass(&s, bank_id, category_id, vec![partner("A", "20%", "x")]).await;
  pass(&s, bank_id, category_id, vec![partner("A", "30%", "x")]).await;

  let events = s.changes_since(yesterday()).await.unwrap();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].payload.bonus.as_deref(), Some("30%"));
}

#[tokio::test]
async fn digest_empty_window_is_not_an_error() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;

  let events = s.changes_since(Utc::now() + Duration::hours(1)).await.unwrap();
  assert!(events.is_empty());
}

// ─── Housekeeping ────────────────────────────────────────────────────────────

#[tokio::test]
async fn purge_removes_hard_deleted_history() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![
    partner("A", "10%", "x"),
    partner("B", "5%", "y"),
  ])
  .await;
  pass(&s, bank_id, category_id, vec![partner("B", "5%", "y")]).await;
  pass(&s, bank_id, category_id, vec![partner("B", "5%", "y")]).await;

  // A is hard-deleted now; B is alive.
  let removed = s.purge_deleted(bank_id, category_id).await.unwrap();
  assert_eq!(removed, 1);
  assert!(s.history(bank_id, category_id, "A").await.unwrap().is_empty());
  assert_eq!(s.history(bank_id, category_id, "B").await.unwrap().len(), 1);

  // After a purge the partner reads as never seen.
  let back = pass(&s, bank_id, category_id, vec![
    partner("A", "10%", "x"),
    partner("B", "5%", "y"),
  ])
  .await;
  assert_eq!(back.inserted, 1);
  assert_eq!(back.resurrected, 0);
}

#[tokio::test]
async fn purge_without_deleted_rows_is_a_no_op() {
  let s = store().await;
  let (bank_id, category_id) = scope(&s).await;
  pass(&s, bank_id, category_id, vec![partner("A", "10%", "x")]).await;

  assert_eq!(s.purge_deleted(bank_id, category_id).await.unwrap(), 0);
  assert_eq!(s.history(bank_id, category_id, "A").await.unwrap().len(), 1);
}
