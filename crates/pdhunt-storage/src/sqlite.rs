//! SQLite-backed store for postings, PIs, the PI watchlist and per-source
//! run outcomes.
//!
//! Timestamps are stored as fixed-width RFC 3339 text so lexical comparison in
//! SQL matches chronological order.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use pdhunt_core::{JobPosting, PiRecord, PipelineError, Region, Tier};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("creating database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostingFilter {
    pub region: Option<Region>,
    pub max_tier: Option<Tier>,
    pub min_score: Option<f64>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PiFilter {
    pub recommended_only: bool,
    pub seeds_only: bool,
    pub min_score: Option<f64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRunStatus {
    Succeeded,
    /// Some pages were harvested before the source failed.
    Partial,
    Failed,
}

impl SourceRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceRunStatus::Succeeded => "ok",
            SourceRunStatus::Partial => "partial",
            SourceRunStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ok" => Some(SourceRunStatus::Succeeded),
            "partial" => Some(SourceRunStatus::Partial),
            "failed" => Some(SourceRunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRunRecord {
    pub run_id: Uuid,
    pub source_id: String,
    pub status: SourceRunStatus,
    pub found: u32,
    pub inserted: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchEntry {
    pub pi_name: String,
    pub institution: Option<String>,
    pub lab_url: Option<String>,
    pub added_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_content_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("{column} '{raw}': {err}")))
}

fn decode_count(value: Option<i64>) -> Option<u32> {
    value.map(|v| u32::try_from(v.max(0)).unwrap_or(u32::MAX))
}

fn row_to_posting(row: &SqliteRow) -> Result<JobPosting, StoreError> {
    let region_raw: String = row.try_get("region")?;
    let region = Region::parse(&region_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown region '{region_raw}'")))?;
    let tier_raw: i64 = row.try_get("tier")?;
    let tier = u8::try_from(tier_raw)
        .ok()
        .and_then(Tier::new)
        .unwrap_or(Tier::UNRANKED);
    let discovered_at: String = row.try_get("discovered_at")?;
    let last_seen_at: String = row.try_get("last_seen_at")?;

    Ok(JobPosting {
        identity_key: row.try_get("identity_key")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        institution: row.try_get("institution")?,
        country: row.try_get("country")?,
        region,
        tier,
        field: row.try_get("field")?,
        description: row.try_get("description")?,
        salary: row.try_get("salary")?,
        duration: row.try_get("duration")?,
        url: row.try_get("url")?,
        posted_date: row.try_get("posted_date")?,
        deadline: row.try_get("deadline")?,
        pi_name: row.try_get("pi_name")?,
        match_score: row.try_get("match_score")?,
        discovered_at: decode_ts(&discovered_at, "discovered_at")?,
        last_seen_at: decode_ts(&last_seen_at, "last_seen_at")?,
    })
}

fn row_to_pi(row: &SqliteRow) -> Result<PiRecord, StoreError> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let is_seed: i64 = row.try_get("is_seed")?;
    let is_recommended: i64 = row.try_get("is_recommended")?;

    Ok(PiRecord {
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        affiliation: row.try_get("affiliation")?,
        is_seed: is_seed != 0,
        is_recommended: is_recommended != 0,
        recommendation_score: row.try_get("recommendation_score")?,
        discovered_via: row.try_get("discovered_via")?,
        paper_count: decode_count(row.try_get("paper_count")?),
        citation_count: decode_count(row.try_get("citation_count")?),
        h_index: decode_count(row.try_get("h_index")?),
        created_at: decode_ts(&created_at, "created_at")?,
        updated_at: decode_ts(&updated_at, "updated_at")?,
    })
}

fn row_to_source_run(row: &SqliteRow) -> Result<SourceRunRecord, StoreError> {
    let run_id: String = row.try_get("run_id")?;
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let finished_at: String = row.try_get("finished_at")?;

    Ok(SourceRunRecord {
        run_id: Uuid::parse_str(&run_id)
            .map_err(|err| StoreError::Corrupt(format!("run_id '{run_id}': {err}")))?,
        source_id: row.try_get("source_id")?,
        status: SourceRunStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown source run status '{status}'")))?,
        found: decode_count(row.try_get("found")?).unwrap_or(0),
        inserted: decode_count(row.try_get("inserted")?).unwrap_or(0),
        error: row.try_get("error")?,
        started_at: decode_ts(&started_at, "started_at")?,
        finished_at: decode_ts(&finished_at, "finished_at")?,
    })
}

fn row_to_watch(row: &SqliteRow) -> Result<WatchEntry, StoreError> {
    let added_at: String = row.try_get("added_at")?;
    let last_checked_at: Option<String> = row.try_get("last_checked_at")?;

    Ok(WatchEntry {
        pi_name: row.try_get("pi_name")?,
        institution: row.try_get("institution")?,
        lab_url: row.try_get("lab_url")?,
        added_at: decode_ts(&added_at, "added_at")?,
        last_checked_at: last_checked_at
            .map(|raw| decode_ts(&raw, "last_checked_at"))
            .transpose()?,
        last_content_hash: row.try_get("last_content_hash")?,
    })
}

impl JobStore {
    /// Open (creating if needed) the database file and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Insert a new posting, or refresh the mutable fields of an existing one.
    ///
    /// Identity fields and `discovered_at` are never touched on update. Nullable
    /// columns only move to a new non-null value; scores and tiers take the
    /// latest write.
    pub async fn upsert_posting(&self, posting: &JobPosting) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO postings (
                identity_key, source_id, title, institution, country, region, tier,
                field, description, salary, duration, url, posted_date, deadline,
                pi_name, match_score, discovered_at, last_seen_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identity_key) DO NOTHING
            "#,
        )
        .bind(&posting.identity_key)
        .bind(&posting.source_id)
        .bind(&posting.title)
        .bind(posting.institution.as_deref())
        .bind(posting.country.as_deref())
        .bind(posting.region.as_str())
        .bind(i64::from(posting.tier.rank()))
        .bind(posting.field.as_deref())
        .bind(posting.description.as_deref())
        .bind(posting.salary.as_deref())
        .bind(posting.duration.as_deref())
        .bind(posting.url.as_deref())
        .bind(posting.posted_date.as_deref())
        .bind(posting.deadline.as_deref())
        .bind(posting.pi_name.as_deref())
        .bind(posting.match_score)
        .bind(encode_ts(&posting.discovered_at))
        .bind(encode_ts(&posting.last_seen_at))
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            sqlx::query(
                r#"
                UPDATE postings SET
                    region = ?,
                    tier = ?,
                    match_score = ?,
                    country = COALESCE(?, country),
                    field = COALESCE(?, field),
                    description = COALESCE(?, description),
                    salary = COALESCE(?, salary),
                    duration = COALESCE(?, duration),
                    url = COALESCE(?, url),
                    posted_date = COALESCE(?, posted_date),
                    deadline = COALESCE(?, deadline),
                    pi_name = COALESCE(?, pi_name),
                    last_seen_at = ?
                WHERE identity_key = ?
                "#,
            )
            .bind(posting.region.as_str())
            .bind(i64::from(posting.tier.rank()))
            .bind(posting.match_score)
            .bind(posting.country.as_deref())
            .bind(posting.field.as_deref())
            .bind(posting.description.as_deref())
            .bind(posting.salary.as_deref())
            .bind(posting.duration.as_deref())
            .bind(posting.url.as_deref())
            .bind(posting.posted_date.as_deref())
            .bind(posting.deadline.as_deref())
            .bind(posting.pi_name.as_deref())
            .bind(encode_ts(&posting.last_seen_at))
            .bind(&posting.identity_key)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(identity_key = %posting.identity_key, inserted, "posting upserted");
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    /// Read-merge-write of a PI record; returns the stored result.
    pub async fn upsert_pi(&self, record: &PiRecord) -> Result<PiRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT * FROM pis WHERE external_id = ?")
            .bind(&record.external_id)
            .fetch_optional(&mut *tx)
            .await?;
        let merged = match existing {
            Some(row) => row_to_pi(&row)?.merged_with(record.clone()),
            None => record.clone(),
        };

        sqlx::query(
            r#"
            INSERT INTO pis (
                external_id, name, affiliation, is_seed, is_recommended,
                recommendation_score, discovered_via, paper_count, citation_count,
                h_index, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                name = excluded.name,
                affiliation = excluded.affiliation,
                is_seed = excluded.is_seed,
                is_recommended = excluded.is_recommended,
                recommendation_score = excluded.recommendation_score,
                discovered_via = excluded.discovered_via,
                paper_count = excluded.paper_count,
                citation_count = excluded.citation_count,
                h_index = excluded.h_index,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&merged.external_id)
        .bind(&merged.name)
        .bind(merged.affiliation.as_deref())
        .bind(i64::from(merged.is_seed))
        .bind(i64::from(merged.is_recommended))
        .bind(merged.recommendation_score)
        .bind(merged.discovered_via.as_deref())
        .bind(merged.paper_count.map(i64::from))
        .bind(merged.citation_count.map(i64::from))
        .bind(merged.h_index.map(i64::from))
        .bind(encode_ts(&merged.created_at))
        .bind(encode_ts(&merged.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(merged)
    }

    pub async fn get_posting(&self, identity_key: &str) -> Result<Option<JobPosting>, StoreError> {
        sqlx::query("SELECT * FROM postings WHERE identity_key = ?")
            .bind(identity_key)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_posting)
            .transpose()
    }

    pub async fn get_pi(&self, external_id: &str) -> Result<Option<PiRecord>, StoreError> {
        sqlx::query("SELECT * FROM pis WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_pi)
            .transpose()
    }

    /// Postings ordered by tier, then score (descending), then insertion order.
    pub async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<JobPosting>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM postings WHERE 1 = 1");
        if let Some(region) = filter.region {
            qb.push(" AND region = ").push_bind(region.as_str());
        }
        if let Some(tier) = filter.max_tier {
            qb.push(" AND tier <= ").push_bind(i64::from(tier.rank()));
        }
        if let Some(min_score) = filter.min_score {
            qb.push(" AND match_score >= ").push_bind(min_score);
        }
        if let Some(since) = filter.since {
            qb.push(" AND discovered_at >= ").push_bind(encode_ts(&since));
        }
        qb.push(" ORDER BY tier ASC, match_score DESC, seq ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_posting).collect()
    }

    /// PIs ordered by recommendation score (descending), then name.
    pub async fn list_pis(&self, filter: &PiFilter) -> Result<Vec<PiRecord>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM pis WHERE 1 = 1");
        if filter.recommended_only {
            qb.push(" AND is_recommended = 1");
        }
        if filter.seeds_only {
            qb.push(" AND is_seed = 1");
        }
        if let Some(min_score) = filter.min_score {
            qb.push(" AND recommendation_score >= ").push_bind(min_score);
        }
        qb.push(" ORDER BY recommendation_score DESC, name ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_pi).collect()
    }

    /// Posting counts per region, every region present (zero when empty).
    pub async fn counts_by_region(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<Region, u64>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT region, COUNT(*) AS n FROM postings");
        if let Some(since) = since {
            qb.push(" WHERE discovered_at >= ").push_bind(encode_ts(&since));
        }
        qb.push(" GROUP BY region");

        let mut counts: BTreeMap<Region, u64> = Region::ALL.into_iter().map(|r| (r, 0)).collect();
        for row in qb.build().fetch_all(&self.pool).await? {
            let region_raw: String = row.try_get("region")?;
            let n: i64 = row.try_get("n")?;
            let region = Region::parse(&region_raw)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown region '{region_raw}'")))?;
            counts.insert(region, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    pub async fn record_source_run(&self, record: &SourceRunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_runs (
                run_id, source_id, status, found, inserted, error, started_at, finished_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.source_id)
        .bind(record.status.as_str())
        .bind(i64::from(record.found))
        .bind(i64::from(record.inserted))
        .bind(record.error.as_deref())
        .bind(encode_ts(&record.started_at))
        .bind(encode_ts(&record.finished_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn source_runs(&self, run_id: Uuid) -> Result<Vec<SourceRunRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM source_runs WHERE run_id = ? ORDER BY id ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_source_run).collect()
    }

    /// Add a PI to the watchlist. Re-adding an existing name refreshes the
    /// institution and lab URL when new values are given.
    pub async fn add_watch(
        &self,
        pi_name: &str,
        institution: Option<&str>,
        lab_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WatchEntry, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO watchlist (pi_name, institution, lab_url, added_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(pi_name) DO UPDATE SET
                institution = COALESCE(excluded.institution, watchlist.institution),
                lab_url = COALESCE(excluded.lab_url, watchlist.lab_url)
            RETURNING *
            "#,
        )
        .bind(pi_name.trim())
        .bind(institution)
        .bind(lab_url)
        .bind(encode_ts(&now))
        .fetch_one(&self.pool)
        .await?;
        row_to_watch(&row)
    }

    /// Returns whether an entry was removed.
    pub async fn remove_watch(&self, pi_name: &str) -> Result<bool, StoreError> {
        let removed = sqlx::query("DELETE FROM watchlist WHERE pi_name = ?")
            .bind(pi_name.trim())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn list_watchlist(&self) -> Result<Vec<WatchEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM watchlist ORDER BY pi_name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_watch).collect()
    }

    pub async fn record_watch_check(
        &self,
        pi_name: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE watchlist SET last_checked_at = ?, last_content_hash = ? WHERE pi_name = ?")
            .bind(encode_ts(&now))
            .bind(content_hash)
            .bind(pi_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
