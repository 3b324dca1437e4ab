//! [`SqliteStore`] — the SQLite implementation of [`PartnerStore`].

use std::{
  collections::HashMap,
  path::Path,
  sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension as _, params};

use perkwatch_core::{
  bank::{Bank, NewBank},
  category::{CategoryObservation, CategoryVersion},
  digest::ChangeEvent,
  partner::{
    OfferPayload, PartnerRecord, PartnerStatus, SnapshotEntry, dedup_snapshot,
    normalize_name,
  },
  store::{PartnerHit, PartnerStore, ReconcileRequest, ReconcileSummary},
  transition::{self, GracePolicy, ObserveAction},
};

use crate::{
  Error, Result,
  encode::{
    RawBank, RawCategory, RawChange, RawPartner, dt_from_sql, encode_dt,
    status_from_sql,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

type ScopeLocks = Mutex<HashMap<(i64, i64), Arc<tokio::sync::Mutex<()>>>>;

/// A partner ledger backed by a single SQLite file.
///
/// Cloning is cheap — the inner connection and lock registry are
/// reference-counted. Reconciliation passes over the same
/// `(bank_id, category_id)` scope are serialised through a per-scope async
/// mutex; passes over different scopes only contend on the connection.
#[derive(Clone)]
pub struct SqliteStore {
  conn:   tokio_rusqlite::Connection,
  policy: GracePolicy,
  locks:  Arc<ScopeLocks>,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::with_conn(conn).await
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::with_conn(conn).await
  }

  async fn with_conn(conn: tokio_rusqlite::Connection) -> Result<Self> {
    let store = Self {
      conn,
      policy: GracePolicy::default(),
      locks: Arc::new(Mutex::new(HashMap::new())),
    };
    store.init_schema().await?;
    Ok(store)
  }

  /// Replace the deletion grace policy (default: one pass of grace).
  pub fn with_policy(mut self, policy: GracePolicy) -> Self {
    self.policy = policy;
    self
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  fn scope_lock(
    &self,
    bank_id: i64,
    category_id: i64,
  ) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self
      .locks
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner);
    locks.entry((bank_id, category_id)).or_default().clone()
  }

  /// Every ledger row ever recorded for one key, oldest first. The last row
  /// is the current one.
  pub async fn history(
    &self,
    bank_id: i64,
    category_id: i64,
    partner_name: &str,
  ) -> Result<Vec<PartnerRecord>> {
    let name = partner_name.to_owned();
    let raws: Vec<RawPartner> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT partner_id, bank_id, category_id, partner_name,
                  partner_bonus, partner_link, checked_at, status, is_current
           FROM partners
           WHERE bank_id = ?1 AND category_id = ?2 AND partner_name = ?3
           ORDER BY partner_id",
        )?;
        let rows = stmt
          .query_map(params![bank_id, category_id, name], |row| {
            Ok(RawPartner {
              partner_id:    row.get(0)?,
              bank_id:       row.get(1)?,
              category_id:   row.get(2)?,
              partner_name:  row.get(3)?,
              partner_bonus: row.get(4)?,
              partner_link:  row.get(5)?,
              checked_at:    row.get(6)?,
              status:        row.get(7)?,
              is_current:    row.get(8)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawPartner::into_record).collect()
  }
}

// ─── Reconciliation pass ─────────────────────────────────────────────────────

/// The current row of one ledger key, tracked in memory for the duration of
/// a pass so every transition goes through `perkwatch_core::transition`.
struct CurrentRow {
  partner_id: i64,
  payload:    OfferPayload,
  status:     PartnerStatus,
  checked_at: DateTime<Utc>,
}

/// Result of the transactional part of a pass, carried out of the
/// connection closure and mapped to [`Error`] at the boundary.
enum PassOutcome {
  Done(ReconcileSummary),
  BankMissing,
  CategoryMissing,
  Conflict { partner_name: String, count: usize },
}

/// `checked_at` must be strictly increasing per key; when the wall clock has
/// not moved past the previous row, step one microsecond beyond it.
fn bump_monotonic(
  pass_at: DateTime<Utc>,
  prev: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
  match prev {
    Some(p) if pass_at <= p => p + Duration::microseconds(1),
    _ => pass_at,
  }
}

/// Append a ledger row carrying the current pointer. The previous current
/// row of the key, if any, must already be demoted.
fn insert_row(
  tx: &rusqlite::Transaction<'_>,
  bank_id: i64,
  category_id: i64,
  name: &str,
  payload: &OfferPayload,
  checked_at: DateTime<Utc>,
  status: PartnerStatus,
) -> rusqlite::Result<i64> {
  tx.execute(
    "INSERT INTO partners (
       bank_id, category_id, partner_name, partner_bonus, partner_link,
       checked_at, status, is_current
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
    params![
      bank_id,
      category_id,
      name,
      payload.bonus,
      payload.link,
      encode_dt(checked_at),
      status.as_str(),
    ],
  )?;
  Ok(tx.last_insert_rowid())
}

/// Execute the three phases of a reconciliation pass inside `tx`.
/// The caller commits on [`PassOutcome::Done`] and lets the transaction
/// drop (roll back) otherwise.
fn run_pass(
  tx: &rusqlite::Transaction<'_>,
  bank_id: i64,
  category_id: i64,
  entries: &[SnapshotEntry],
  policy: GracePolicy,
  pass_at: DateTime<Utc>,
) -> rusqlite::Result<PassOutcome> {
  let mut summary = ReconcileSummary::default();

  // Load the current row of every key in scope.
  let mut rows: HashMap<String, CurrentRow> = HashMap::new();
  {
    let mut stmt = tx.prepare(
      "SELECT partner_id, partner_name, partner_bonus, partner_link,
              status, checked_at
       FROM partners
       WHERE bank_id = ?1 AND category_id = ?2 AND is_current = 1",
    )?;
    let mapped = stmt.query_map(params![bank_id, category_id], |row| {
      let bonus: Option<String> = row.get(2)?;
      let link: Option<String> = row.get(3)?;
      let status: String = row.get(4)?;
      let checked_at: String = row.get(5)?;
      Ok((row.get::<_, String>(1)?, CurrentRow {
        partner_id: row.get(0)?,
        payload:    OfferPayload::new(bonus.as_deref(), link.as_deref()),
        status:     status_from_sql(4, &status)?,
        checked_at: dt_from_sql(5, &checked_at)?,
      }))
    })?;

    for item in mapped {
      let (name, row) = item?;
      if rows.insert(name.clone(), row).is_some() {
        // Unreachable through this store (partial unique index), but fail
        // loudly instead of picking a row if the data got here otherwise.
        return Ok(PassOutcome::Conflict { partner_name: name, count: 2 });
      }
    }
  }

  // Phase 1: mark confirmed rows pending re-confirmation.
  for row in rows.values_mut() {
    if let Some(next) = transition::mark_pending(row.status) {
      tx.execute(
        "UPDATE partners SET status = ?1 WHERE partner_id = ?2",
        params![next.as_str(), row.partner_id],
      )?;
      row.status = next;
    }
  }

  // Phase 2: match the snapshot against the current rows.
  for entry in entries {
    let observed = rows
      .get(&entry.name)
      .map(|row| (row.status, row.payload == entry.payload));

    match transition::observe(observed) {
      ObserveAction::Keep => {}
      ObserveAction::FlipLive => {
        if let Some(row) = rows.get_mut(&entry.name) {
          tx.execute(
            "UPDATE partners SET status = 'live' WHERE partner_id = ?1",
            params![row.partner_id],
          )?;
          row.status = PartnerStatus::Live;
          summary.confirmed += 1;
        }
      }
      ObserveAction::AppendNew => {
        let at = bump_monotonic(pass_at, None);
        let id = insert_row(
          tx,
          bank_id,
          category_id,
          &entry.name,
          &entry.payload,
          at,
          PartnerStatus::New,
        )?;
        rows.insert(entry.name.clone(), CurrentRow {
          partner_id: id,
          payload:    entry.payload.clone(),
          status:     PartnerStatus::New,
          checked_at: at,
        });
        summary.inserted += 1;
      }
      ObserveAction::AppendLive { resurrected } => {
        let Some(prev) = rows.get(&entry.name) else {
          // observe only returns AppendLive for keys with a current row.
          continue;
        };
        tx.execute(
          "UPDATE partners SET is_current = 0 WHERE partner_id = ?1",
          params![prev.partner_id],
        )?;
        let at = bump_monotonic(pass_at, Some(prev.checked_at));
        let id = insert_row(
          tx,
          bank_id,
          category_id,
          &entry.name,
          &entry.payload,
          at,
          PartnerStatus::Live,
        )?;
        rows.insert(entry.name.clone(), CurrentRow {
          partner_id: id,
          payload:    entry.payload.clone(),
          status:     PartnerStatus::Live,
          checked_at: at,
        });
        if resurrected {
          summary.resurrected += 1;
        } else {
          summary.updated += 1;
        }
      }
    }
  }

  // Phase 3: settle rows that were not re-confirmed. Rows already in grace
  // advance first, so a row demoted in this pass cannot be hard-deleted in
  // the same pass.
  for phase in [PartnerStatus::NewDelete, PartnerStatus::Ready] {
    for row in rows.values_mut() {
      if row.status != phase {
        continue;
      }
      if let Some(next) = transition::sweep(row.status, policy) {
        let at = bump_monotonic(pass_at, Some(row.checked_at));
        tx.execute(
          "UPDATE partners SET status = ?1, checked_at = ?2
           WHERE partner_id = ?3",
          params![next.as_str(), encode_dt(at), row.partner_id],
        )?;
        row.status = next;
        row.checked_at = at;
        match next {
          PartnerStatus::NewDelete => summary.soft_deleted += 1,
          PartnerStatus::Delete => summary.hard_deleted += 1,
          _ => {}
        }
      }
    }
  }

  Ok(PassOutcome::Done(summary))
}

fn row_exists(
  conn: &rusqlite::Connection,
  sql: &str,
  id: i64,
) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row(sql, params![id], |_| Ok(true))
      .optional()?
      .unwrap_or(false),
  )
}

// ─── Category resolution outcome ─────────────────────────────────────────────

enum ResolveOutcome {
  Existing(i64),
  Created(i64),
  BankMissing,
}

// ─── PartnerStore impl ───────────────────────────────────────────────────────

impl PartnerStore for SqliteStore {
  type Error = Error;

  // ── Banks ─────────────────────────────────────────────────────────────────

  async fn add_bank(&self, input: NewBank) -> Result<Bank> {
    let created_at = Utc::now();
    let name = input.name.clone();
    let loyalty_url = input.loyalty_url.clone();
    let at_str = encode_dt(created_at);

    let bank_id: i64 = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO banks (name, loyalty_url, created_at)
           VALUES (?1, ?2, ?3)",
          params![name, loyalty_url, at_str],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Bank {
      bank_id,
      name: input.name,
      loyalty_url: input.loyalty_url,
      created_at,
    })
  }

  async fn get_bank(&self, bank_id: i64) -> Result<Option<Bank>> {
    let raw: Option<RawBank> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT bank_id, name, loyalty_url, created_at
               FROM banks WHERE bank_id = ?1",
              params![bank_id],
              |row| {
                Ok(RawBank {
                  bank_id:     row.get(0)?,
                  name:        row.get(1)?,
                  loyalty_url: row.get(2)?,
                  created_at:  row.get(3)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawBank::into_bank).transpose()
  }

  async fn list_banks(&self) -> Result<Vec<Bank>> {
    let raws: Vec<RawBank> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT bank_id, name, loyalty_url, created_at
           FROM banks ORDER BY name",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawBank {
              bank_id:     row.get(0)?,
              name:        row.get(1)?,
              loyalty_url: row.get(2)?,
              created_at:  row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawBank::into_bank).collect()
  }

  // ── Categories ────────────────────────────────────────────────────────────

  async fn resolve_category(
    &self,
    bank_id: i64,
    observation: CategoryObservation,
  ) -> Result<i64> {
    let obs = observation;
    let at_str = encode_dt(Utc::now());

    let outcome = self
      .conn
      .call(move |conn| {
        if !row_exists(conn, "SELECT 1 FROM banks WHERE bank_id = ?1", bank_id)?
        {
          return Ok(ResolveOutcome::BankMissing);
        }

        // Version ids grow monotonically, so the greatest id is the latest
        // version — no timestamp comparison involved.
        let latest: Option<CategoryVersion> = conn
          .query_row(
            "SELECT category_id, bank_id, name, url, partners_count,
                    checked_at
             FROM categories
             WHERE bank_id = ?1 AND name = ?2
             ORDER BY category_id DESC
             LIMIT 1",
            params![bank_id, obs.name],
            |row| {
              let checked_at: String = row.get(5)?;
              Ok(CategoryVersion {
                category_id:    row.get(0)?,
                bank_id:        row.get(1)?,
                name:           row.get(2)?,
                url:            row.get(3)?,
                partners_count: row.get(4)?,
                checked_at:     dt_from_sql(5, &checked_at)?,
              })
            },
          )
          .optional()?;

        if let Some(latest) = &latest {
          if obs.matches(latest) {
            return Ok(ResolveOutcome::Existing(latest.category_id));
          }
        }

        conn.execute(
          "INSERT INTO categories (bank_id, name, url, partners_count,
                                   checked_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          params![bank_id, obs.name, obs.url, obs.partners_count, at_str],
        )?;
        Ok(ResolveOutcome::Created(conn.last_insert_rowid()))
      })
      .await?;

    match outcome {
      ResolveOutcome::Existing(id) => Ok(id),
      ResolveOutcome::Created(id) => {
        tracing::debug!(bank_id, category_id = id, "new category version");
        Ok(id)
      }
      ResolveOutcome::BankMissing => Err(Error::BankNotFound(bank_id)),
    }
  }

  async fn latest_categories(
    &self,
    bank_id: i64,
  ) -> Result<Vec<CategoryVersion>> {
    let raws: Vec<RawCategory> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT category_id, bank_id, name, url, partners_count, checked_at
           FROM categories
           WHERE bank_id = ?1
             AND category_id IN (
               SELECT MAX(category_id) FROM categories
               WHERE bank_id = ?1 GROUP BY name
             )
           ORDER BY name",
        )?;
        let rows = stmt
          .query_map(params![bank_id], |row| {
            Ok(RawCategory {
              category_id:    row.get(0)?,
              bank_id:        row.get(1)?,
              name:           row.get(2)?,
              url:            row.get(3)?,
              partners_count: row.get(4)?,
              checked_at:     row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawCategory::into_version).collect()
  }

  // ── Reconciliation ────────────────────────────────────────────────────────

  async fn reconcile(
    &self,
    request: ReconcileRequest,
  ) -> Result<ReconcileSummary> {
    let bank_id = request.bank_id;
    let category_id = request.category_id;

    // Serialise passes per scope; concurrent passes over the same scope
    // would race on the mark-pending / sweep steps.
    let lock = self.scope_lock(bank_id, category_id);
    let _guard = lock.lock().await;

    let entries = dedup_snapshot(&request.partners);
    tracing::debug!(
      bank_id,
      category_id,
      snapshot = request.partners.len(),
      deduped = entries.len(),
      "starting reconciliation pass"
    );

    let policy = self.policy;
    let outcome = self
      .conn
      .call(move |conn| {
        if !row_exists(conn, "SELECT 1 FROM banks WHERE bank_id = ?1", bank_id)?
        {
          return Ok(PassOutcome::BankMissing);
        }
        if !row_exists(
          conn,
          "SELECT 1 FROM categories WHERE category_id = ?1",
          category_id,
        )? {
          return Ok(PassOutcome::CategoryMissing);
        }

        let tx = conn.transaction()?;
        let outcome =
          run_pass(&tx, bank_id, category_id, &entries, policy, Utc::now())?;
        // Anything but Done drops the transaction, rolling the pass back.
        if matches!(outcome, PassOutcome::Done(_)) {
          tx.commit()?;
        }
        Ok(outcome)
      })
      .await?;

    match outcome {
      PassOutcome::Done(summary) => {
        tracing::info!(
          bank_id,
          category_id,
          inserted = summary.inserted,
          updated = summary.updated,
          resurrected = summary.resurrected,
          confirmed = summary.confirmed,
          soft_deleted = summary.soft_deleted,
          hard_deleted = summary.hard_deleted,
          "reconciliation pass committed"
        );
        Ok(summary)
      }
      PassOutcome::BankMissing => Err(Error::BankNotFound(bank_id)),
      PassOutcome::CategoryMissing => Err(Error::CategoryNotFound(category_id)),
      PassOutcome::Conflict { partner_name, count } => {
        Err(Error::CurrentRowConflict {
          bank_id,
          category_id,
          partner_name,
          count,
        })
      }
    }
  }

  async fn purge_deleted(&self, bank_id: i64, category_id: i64) -> Result<u64> {
    let lock = self.scope_lock(bank_id, category_id);
    let _guard = lock.lock().await;

    let removed: usize = self
      .conn
      .call(move |conn| {
        // The whole history of a hard-deleted key goes; removing only the
        // current row would promote stale history back to "current".
        Ok(conn.execute(
          "DELETE FROM partners
           WHERE bank_id = ?1 AND category_id = ?2
             AND partner_name IN (
               SELECT partner_name FROM partners
               WHERE bank_id = ?1 AND category_id = ?2
                 AND is_current = 1 AND status = 'delete'
             )",
          params![bank_id, category_id],
        )?)
      })
      .await?;

    if removed > 0 {
      tracing::debug!(bank_id, category_id, removed, "purged deleted partners");
    }
    Ok(removed as u64)
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  async fn active_partners(
    &self,
    bank_id: i64,
    category_id: i64,
  ) -> Result<Vec<PartnerRecord>> {
    let raws: Vec<RawPartner> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT partner_id, bank_id, category_id, partner_name,
                  partner_bonus, partner_link, checked_at, status, is_current
           FROM partners
           WHERE bank_id = ?1 AND category_id = ?2
             AND is_current = 1 AND status IN ('new', 'live')
           ORDER BY partner_name",
        )?;
        let rows = stmt
          .query_map(params![bank_id, category_id], |row| {
            Ok(RawPartner {
              partner_id:    row.get(0)?,
              bank_id:       row.get(1)?,
              category_id:   row.get(2)?,
              partner_name:  row.get(3)?,
              partner_bonus: row.get(4)?,
              partner_link:  row.get(5)?,
              checked_at:    row.get(6)?,
              status:        row.get(7)?,
              is_current:    row.get(8)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawPartner::into_record).collect()
  }

  async fn search_partners(&self, query: String) -> Result<Vec<PartnerHit>> {
    let needle = normalize_name(&query);
    if needle.is_empty() {
      return Ok(Vec::new());
    }

    // The normalisation is not expressible as a SQL LIKE pattern, so the
    // (small) active set is fetched ordered and filtered here.
    let hits: Vec<PartnerHit> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT b.name, c.name, p.partner_name, p.partner_bonus,
                  p.partner_link
           FROM partners p
           JOIN banks b ON b.bank_id = p.bank_id
           JOIN categories c ON c.category_id = p.category_id
           WHERE p.is_current = 1 AND p.status IN ('new', 'live')
           ORDER BY b.name, c.name, p.partner_name",
        )?;
        let rows = stmt
          .query_map([], |row| {
            let bonus: Option<String> = row.get(3)?;
            let link: Option<String> = row.get(4)?;
            Ok(PartnerHit {
              bank_name:     row.get(0)?,
              category_name: row.get(1)?,
              partner_name:  row.get(2)?,
              payload:       OfferPayload::new(bonus.as_deref(), link.as_deref()),
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    Ok(
      hits
        .into_iter()
        .filter(|hit| normalize_name(&hit.partner_name).contains(&needle))
        .collect(),
    )
  }

  async fn changes_since(
    &self,
    since: DateTime<Utc>,
  ) -> Result<Vec<ChangeEvent>> {
    let since_str = encode_dt(since);

    let raws: Vec<RawChange> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT b.name, c.name, p.partner_name, p.partner_bonus,
                  p.partner_link, p.checked_at, p.status,
                  prev.partner_id IS NOT NULL,
                  prev.partner_bonus, prev.partner_link
           FROM partners p
           JOIN banks b ON b.bank_id = p.bank_id
           JOIN categories c ON c.category_id = p.category_id
           LEFT JOIN partners prev ON prev.partner_id = (
             SELECT p2.partner_id FROM partners p2
             WHERE p2.bank_id = p.bank_id
               AND p2.category_id = p.category_id
               AND p2.partner_name = p.partner_name
               AND p2.partner_id < p.partner_id
             ORDER BY p2.partner_id DESC
             LIMIT 1
           )
           WHERE p.is_current = 1
             AND p.checked_at >= ?1
             AND p.status IN ('new', 'live', 'new_delete')
           ORDER BY b.name, c.name, p.partner_name",
        )?;
        let rows = stmt
          .query_map(params![since_str], |row| {
            Ok(RawChange {
              bank_name:     row.get(0)?,
              category_name: row.get(1)?,
              partner_name:  row.get(2)?,
              partner_bonus: row.get(3)?,
              partner_link:  row.get(4)?,
              checked_at:    row.get(5)?,
              status:        row.get(6)?,
              prev_exists:   row.get(7)?,
              prev_bonus:    row.get(8)?,
              prev_link:     row.get(9)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    let mut events = Vec::with_capacity(raws.len());
    for raw in raws {
      if let Some(event) = raw.into_event()? {
        events.push(event);
      }
    }
    Ok(events)
  }
}
