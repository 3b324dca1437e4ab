//! SQL schema for the perkwatch SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE ... IF NOT EXISTS`.
///
/// The `is_current` flag is the materialised "current row" pointer: exactly
/// one row per `(bank_id, category_id, partner_name)` carries it, enforced
/// by the partial unique index. Every query that needs "the latest row"
/// filters on the flag instead of re-deriving `MAX(checked_at)`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS banks (
    bank_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    loyalty_url TEXT NOT NULL,
    created_at  TEXT NOT NULL            -- ISO 8601 UTC
);

-- Category versions are append-only: a changed url or partner count cuts a
-- new version; old ids stay valid for historical partner rows.
CREATE TABLE IF NOT EXISTS categories (
    category_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    bank_id        INTEGER NOT NULL REFERENCES banks(bank_id),
    name           TEXT NOT NULL,
    url            TEXT NOT NULL,
    partners_count INTEGER,
    checked_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS categories_bank_name_idx
    ON categories(bank_id, name, checked_at);

-- The partner ledger. Append-mostly: rows are inserted, their status fields
-- are transitioned in place by reconciliation passes, and nothing else is
-- ever updated. Physical deletes happen only through purge housekeeping.
CREATE TABLE IF NOT EXISTS partners (
    partner_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    bank_id       INTEGER NOT NULL REFERENCES banks(bank_id),
    category_id   INTEGER NOT NULL REFERENCES categories(category_id),
    partner_name  TEXT NOT NULL,
    partner_bonus TEXT,
    partner_link  TEXT,
    checked_at    TEXT NOT NULL,
    status        TEXT NOT NULL
        CHECK (status IN ('new','live','ready','new_delete','delete')),
    is_current    INTEGER NOT NULL DEFAULT 1
);

-- At most one current row per ledger key; a duplicate is a constraint
-- violation, not a silent ambiguity.
CREATE UNIQUE INDEX IF NOT EXISTS partners_current_key_idx
    ON partners(bank_id, category_id, partner_name)
    WHERE is_current = 1;

CREATE INDEX IF NOT EXISTS partners_scope_idx
    ON partners(bank_id, category_id, partner_name);
CREATE INDEX IF NOT EXISTS partners_checked_idx
    ON partners(checked_at);

PRAGMA user_version = 1;
";
