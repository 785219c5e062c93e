#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ration_core::{
    format_day, per_category_share, validate_content, AllocationOutcome, IssuancePolicy,
    IssuedRecord, UserId,
};
use rusqlite::{params, Connection, TransactionBehavior};
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime};

const RATION_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  content TEXT NOT NULL UNIQUE CHECK (
    length(content) BETWEEN 1 AND 255
    AND substr(content, 1, 1) <> '-'
  ),
  category TEXT GENERATED ALWAYS AS (
    CASE
      WHEN instr(content, '-') = 0 THEN content
      ELSE substr(content, 1, instr(content, '-') - 1)
    END
  ) VIRTUAL,
  reserved_user TEXT CHECK (
    reserved_user IS NULL OR length(reserved_user) BETWEEN 1 AND 64
  ),
  reserved_day TEXT CHECK (
    reserved_day IS NULL
    OR reserved_day GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]'
  ),
  CHECK ((reserved_user IS NULL) = (reserved_day IS NULL))
);

CREATE TRIGGER IF NOT EXISTS trg_records_reservation_no_update
BEFORE UPDATE OF reserved_user, reserved_day ON records
WHEN OLD.reserved_user IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'record reservations are final');
END;

CREATE TRIGGER IF NOT EXISTS trg_records_content_no_update
BEFORE UPDATE OF content ON records
BEGIN
  SELECT RAISE(FAIL, 'record content is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_records_reserved_no_delete
BEFORE DELETE ON records
WHEN OLD.reserved_user IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'reserved records are ledger entries');
END;

CREATE INDEX IF NOT EXISTS idx_records_unassigned_category
  ON records(category) WHERE reserved_user IS NULL;
CREATE INDEX IF NOT EXISTS idx_records_ledger
  ON records(reserved_user, reserved_day);
";

pub struct RecordStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SeedReport {
    pub inserted: usize,
    pub duplicates: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CategoryInventory {
    pub category: String,
    pub total: u32,
    pub unassigned: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct InventoryReport {
    pub categories: Vec<CategoryInventory>,
    pub live_categories: Vec<String>,
    pub daily_quota: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerReport {
    pub user_id: String,
    pub day: String,
    pub issued: u32,
    pub contents: Vec<String>,
}

impl RecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RATION_V1)
            .context("failed to apply records schema")?;

        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format migration timestamp")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RATION_MIGRATION_VERSION, now],
            )
            .context("failed to register records schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        let table_present = self
            .conn
            .prepare(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
            )
            .context("failed to probe schema_migrations")?
            .exists([])
            .context("failed to probe schema_migrations")?;
        if !table_present {
            return Ok(None);
        }

        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .context("failed to read schema version")?;
        Ok(version)
    }

    pub fn seed_records<I, S>(&mut self, contents: I) -> Result<SeedReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inserted = 0usize;
        let mut duplicates = Vec::new();

        let tx = self
            .conn
            .transaction()
            .context("failed to start seed transaction")?;
        {
            let mut stmt = tx
                .prepare("INSERT OR IGNORE INTO records(content) VALUES (?1)")
                .context("failed to prepare seed statement")?;
            for content in contents {
                let content = content.as_ref();
                validate_content(content).map_err(|err| anyhow!(err.to_string()))?;
                let changed = stmt
                    .execute(params![content])
                    .with_context(|| format!("failed to insert record {content}"))?;
                if changed == 0 {
                    duplicates.push(content.to_string());
                } else {
                    inserted += 1;
                }
            }
        }
        tx.commit().context("failed to commit seed transaction")?;

        Ok(SeedReport {
            inserted,
            duplicates,
        })
    }

    pub fn discover_categories(&self, window: u32) -> Result<BTreeSet<String>> {
        discover_categories_in(&self.conn, window)
    }

    pub fn issued_count(&self, user: &UserId, day: Date) -> Result<u32> {
        let day_key = format_day(day).map_err(|err| anyhow!(err.to_string()))?;
        issued_count_in(&self.conn, user, &day_key)
    }

    /// Runs one allocation for `user` on `day`: discover categories, derive
    /// the quota, reserve up to one share per category. All reads and writes
    /// happen inside a single immediate transaction, so two concurrent
    /// requests can never reserve the same record or overdraw a ledger.
    pub fn issue(
        &mut self,
        user: &UserId,
        day: Date,
        policy: &IssuancePolicy,
    ) -> Result<AllocationOutcome> {
        policy.validate().map_err(|err| anyhow!(err.to_string()))?;
        let day_key = format_day(day).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start allocation transaction")?;

        let categories = discover_categories_in(&tx, policy.discovery_window)?;
        let category_count =
            u32::try_from(categories.len()).context("category count exceeds u32 range")?;
        let quota = policy.daily_quota(category_count);

        // An empty catalogue yields quota zero, so the first request
        // already sits at the ceiling.
        let issued_before = issued_count_in(&tx, user, &day_key)?;
        if issued_before >= quota {
            return Ok(AllocationOutcome::LimitReached);
        }

        let remaining = quota - issued_before;
        let share = per_category_share(remaining, category_count);

        let mut records = Vec::new();
        for category in &categories {
            reserve_in_category(&tx, user, &day_key, category, share, &mut records)?;
        }

        if records.is_empty() {
            return Ok(AllocationOutcome::NoRecordsAvailable);
        }

        tx.commit()
            .context("failed to commit allocation transaction")?;
        Ok(AllocationOutcome::Issued { records })
    }

    pub fn inventory(&self, policy: &IssuancePolicy) -> Result<InventoryReport> {
        policy.validate().map_err(|err| anyhow!(err.to_string()))?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT category,
                        COUNT(*),
                        SUM(CASE WHEN reserved_user IS NULL THEN 1 ELSE 0 END)
                 FROM records
                 GROUP BY category
                 ORDER BY category ASC",
            )
            .context("failed to prepare inventory query")?;

        let rows = stmt.query_map([], |row| {
            let category: String = row.get(0)?;
            let total: i64 = row.get(1)?;
            let unassigned: i64 = row.get(2)?;
            Ok((category, total, unassigned))
        })?;

        let mut categories = Vec::new();
        for row in rows {
            let (category, total, unassigned) = row.context("failed to read inventory row")?;
            categories.push(CategoryInventory {
                category,
                total: u32::try_from(total)
                    .with_context(|| format!("invalid record total: {total}"))?,
                unassigned: u32::try_from(unassigned)
                    .with_context(|| format!("invalid unassigned count: {unassigned}"))?,
            });
        }

        let live = discover_categories_in(&self.conn, policy.discovery_window)?;
        let live_count = u32::try_from(live.len()).context("category count exceeds u32 range")?;
        let daily_quota = policy.daily_quota(live_count);

        Ok(InventoryReport {
            categories,
            live_categories: live.into_iter().collect(),
            daily_quota,
        })
    }

    pub fn ledger(&self, user: &UserId, day: Date) -> Result<LedgerReport> {
        let day_key = format_day(day).map_err(|err| anyhow!(err.to_string()))?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT content FROM records
                 WHERE reserved_user = ?1 AND reserved_day = ?2
                 ORDER BY id ASC",
            )
            .context("failed to prepare ledger query")?;

        let rows = stmt.query_map(params![user.as_str(), day_key], |row| {
            row.get::<_, String>(0)
        })?;

        let mut contents = Vec::new();
        for row in rows {
            contents.push(row.context("failed to read ledger row")?);
        }

        let issued = u32::try_from(contents.len()).context("ledger size exceeds u32 range")?;

        Ok(LedgerReport {
            user_id: user.as_str().to_string(),
            day: day_key,
            issued,
            contents,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn discover_categories_in(conn: &Connection, window: u32) -> Result<BTreeSet<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT category FROM (
                 SELECT category FROM records ORDER BY id DESC LIMIT ?1
             )",
        )
        .context("failed to prepare category discovery")?;

    let rows = stmt.query_map(params![window], |row| row.get::<_, String>(0))?;

    let mut categories = BTreeSet::new();
    for row in rows {
        categories.insert(row.context("failed to read category row")?);
    }
    Ok(categories)
}

fn issued_count_in(conn: &Connection, user: &UserId, day_key: &str) -> Result<u32> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM records WHERE reserved_user = ?1 AND reserved_day = ?2",
            params![user.as_str(), day_key],
            |row| row.get(0),
        )
        .context("failed to count issued records")?;
    u32::try_from(count).with_context(|| format!("invalid issued count: {count}"))
}

fn reserve_in_category(
    conn: &Connection,
    user: &UserId,
    day_key: &str,
    category: &str,
    share: u32,
    issued: &mut Vec<IssuedRecord>,
) -> Result<()> {
    if share == 0 {
        return Ok(());
    }

    // The subquery only sees unassigned rows, so the reservation-final
    // trigger never fires on this path.
    let mut stmt = conn
        .prepare(
            "UPDATE records
             SET reserved_user = ?1, reserved_day = ?2
             WHERE id IN (
                 SELECT id FROM records
                 WHERE category = ?3 AND reserved_user IS NULL
                 ORDER BY RANDOM()
                 LIMIT ?4
             )
             RETURNING id, category, content",
        )
        .context("failed to prepare reservation statement")?;

    let rows = stmt.query_map(params![user.as_str(), day_key, category, share], |row| {
        Ok(IssuedRecord {
            id: row.get(0)?,
            category: row.get(1)?,
            content: row.get(2)?,
        })
    })?;

    for row in rows {
        issued.push(row.context("failed to read reserved record")?);
    }

    Ok(())
}
