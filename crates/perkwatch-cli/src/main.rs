//! perkwatch command-line front end.
//!
//! Thin operational surface over the partner ledger: registers banks, feeds
//! scraped snapshots into the reconciliation engine, and prints the change
//! digest. Scraping itself happens elsewhere; snapshots arrive as JSON files
//! of `[{ "name": ..., "bonus": ..., "link": ... }]` objects.
//!
//! Reads `perkwatch.toml` (or the path given with `--config`); every setting
//! can be overridden with a `PERKWATCH_`-prefixed environment variable.

use std::path::PathBuf;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use perkwatch_core::{
  bank::NewBank,
  category::CategoryObservation,
  digest::{ChangeKind, group_changes},
  partner::ScrapedPartner,
  store::{PartnerStore, ReconcileRequest},
  transition::GracePolicy,
};
use perkwatch_store_sqlite::SqliteStore;

// ─── Configuration ───────────────────────────────────────────────────────────

fn default_db_path() -> String { "perkwatch.db".into() }

#[derive(Debug, Deserialize)]
struct Settings {
  #[serde(default = "default_db_path")]
  db_path: String,
  #[serde(default)]
  grace:   GracePolicy,
}

// ─── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(author, version, about = "perkwatch partner ledger")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "perkwatch.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Register a bank.
  AddBank {
    name:        String,
    loyalty_url: String,
  },
  /// List registered banks.
  Banks,
  /// Show the latest category versions of a bank.
  Categories { bank_id: i64 },
  /// Merge one scraped snapshot into the ledger.
  Reconcile {
    bank_id: i64,
    /// Category display name.
    #[arg(long)]
    category: String,
    /// Category source URL.
    #[arg(long)]
    url: String,
    /// JSON snapshot file produced by a scrape adapter.
    snapshot: PathBuf,
  },
  /// Print the change digest.
  Digest {
    /// Start of the reporting window (RFC 3339); defaults to midnight UTC.
    #[arg(long)]
    since: Option<DateTime<Utc>>,
  },
  /// Search active partners by name, across all banks.
  Search { query: String },
  /// List active partners of a category.
  Active {
    bank_id:     i64,
    category_id: i64,
  },
  /// Remove the history of hard-deleted partners in a category.
  Purge {
    bank_id:     i64,
    category_id: i64,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings: Settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("PERKWATCH"))
    .build()
    .context("failed to read config")?
    .try_deserialize()
    .context("invalid config")?;

  let store = SqliteStore::open(&settings.db_path)
    .await
    .with_context(|| format!("failed to open {}", settings.db_path))?
    .with_policy(settings.grace);
  tracing::debug!(db = %settings.db_path, "store opened");

  match cli.command {
    Command::AddBank { name, loyalty_url } => {
      let bank = store.add_bank(NewBank { name, loyalty_url }).await?;
      println!("added bank {} ({})", bank.bank_id, bank.name);
    }

    Command::Banks => {
      for bank in store.list_banks().await? {
        println!("{:>4}  {}  {}", bank.bank_id, bank.name, bank.loyalty_url);
      }
    }

    Command::Categories { bank_id } => {
      for category in store.latest_categories(bank_id).await? {
        println!(
          "{:>4}  {}  {}  ({} partners)",
          category.category_id,
          category.name,
          category.url,
          category
            .partners_count
            .map_or_else(|| "?".into(), |n| n.to_string()),
        );
      }
    }

    Command::Reconcile { bank_id, category, url, snapshot } => {
      let raw = std::fs::read_to_string(&snapshot)
        .with_context(|| format!("failed to read {}", snapshot.display()))?;
      let partners: Vec<ScrapedPartner> =
        serde_json::from_str(&raw).context("invalid snapshot JSON")?;

      let category_id = store
        .resolve_category(bank_id, CategoryObservation {
          name: category,
          url,
          partners_count: Some(partners.len() as i64),
        })
        .await?;

      let summary = store
        .reconcile(ReconcileRequest { bank_id, category_id, partners })
        .await?;
      println!(
        "category {category_id}: {} new, {} updated, {} resurrected, \
         {} confirmed, {} going away, {} deleted",
        summary.inserted,
        summary.updated,
        summary.resurrected,
        summary.confirmed,
        summary.soft_deleted,
        summary.hard_deleted,
      );
    }

    Command::Digest { since } => {
      let since = match since {
        Some(ts) => ts,
        None => midnight_utc(),
      };
      let events = store.changes_since(since).await?;
      if events.is_empty() {
        println!("no changes since {since}");
        return Ok(());
      }
      for bank in group_changes(events) {
        println!("{}", bank.bank_name);
        for category in bank.categories {
          println!("  {}", category.category_name);
          for event in category.events {
            let marker = match event.kind {
              ChangeKind::New => '+',
              ChangeKind::Updated => '~',
              ChangeKind::Deleted => '-',
            };
            let bonus = event.payload.bonus.as_deref().unwrap_or("—");
            match event.payload.link.as_deref() {
              Some(link) => {
                println!("    {marker} {} — {bonus} ({link})", event.partner_name)
              }
              None => println!("    {marker} {} — {bonus}", event.partner_name),
            }
          }
        }
      }
    }

    Command::Search { query } => {
      for hit in store.search_partners(query).await? {
        let bonus = hit.payload.bonus.as_deref().unwrap_or("—");
        println!(
          "{} / {} / {}  {bonus}",
          hit.bank_name, hit.category_name, hit.partner_name,
        );
      }
    }

    Command::Active { bank_id, category_id } => {
      for record in store.active_partners(bank_id, category_id).await? {
        let bonus = record.payload.bonus.as_deref().unwrap_or("—");
        println!("{}  {}", record.partner_name, bonus);
      }
    }

    Command::Purge { bank_id, category_id } => {
      let removed = store.purge_deleted(bank_id, category_id).await?;
      println!("purged {removed} ledger rows");
    }
  }

  Ok(())
}

fn midnight_utc() -> DateTime<Utc> {
  Utc::now()
    .date_naive()
    .and_hms_opt(0, 0, 0)
    .unwrap_or_default()
    .and_utc()
}
