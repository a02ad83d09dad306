//! Stats store: per-entity, per-day counters

mod schema;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::DatabaseConfig;

/// A stored time series, one per report type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Package,
    Resource,
    Location,
    PackageDownloads,
}

impl Stream {
    pub fn name(&self) -> &'static str {
        match self {
            Stream::Package => "package",
            Stream::Resource => "resource",
            Stream::Location => "visitorlocation",
            Stream::PackageDownloads => "package_downloads",
        }
    }

    fn latest_day_sql(&self) -> &'static str {
        // package and package_downloads share dataset_stats; each stream only
        // counts the days its own fields were written
        match self {
            Stream::Package => {
                "SELECT MAX(day) FROM dataset_stats WHERE visits > 0 OR entrances > 0"
            }
            Stream::PackageDownloads => "SELECT MAX(day) FROM dataset_stats WHERE downloads > 0",
            Stream::Resource => "SELECT MAX(day) FROM resource_stats",
            Stream::Location => "SELECT MAX(day) FROM location_stats",
        }
    }
}

/// Field-wise dataset upsert. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetCounts {
    pub visits: Option<i64>,
    pub entrances: Option<i64>,
    pub downloads: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

/// Metric dataset totals are ranked by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetMetric {
    Visits,
    Entrances,
    Downloads,
}

impl DatasetMetric {
    fn column(&self) -> &'static str {
        match self {
            DatasetMetric::Visits => "total_visits",
            DatasetMetric::Entrances => "total_entrances",
            DatasetMetric::Downloads => "total_downloads",
        }
    }
}

/// Which locations a session total covers. `!Name` means every location but `Name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationFilter {
    All,
    Only(String),
    Except(String),
}

impl LocationFilter {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => LocationFilter::All,
            Some(name) => match name.strip_prefix('!') {
                Some(rest) => LocationFilter::Except(rest.to_string()),
                None => LocationFilter::Only(name.to_string()),
            },
        }
    }
}

/// One stored dataset day
#[cfg(test)]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatasetDayStat {
    pub dataset_id: String,
    pub day: NaiveDate,
    pub visits: i64,
    pub entrances: i64,
    pub downloads: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatasetTotal {
    pub dataset_id: String,
    pub name: Option<String>,
    pub visits: i64,
    pub entrances: i64,
    pub downloads: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceTotal {
    pub resource_id: String,
    pub dataset_id: Option<String>,
    pub visits: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LocationTotal {
    pub name: String,
    pub sessions: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MonthlySessions {
    /// YYYY-MM
    pub month: String,
    pub sessions: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DailyActivity {
    pub day: NaiveDate,
    pub visits: i64,
    pub downloads: i64,
}

/// Recent activity of one dataset: the last 30 days plus all-time totals
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatasetActivity {
    pub days: Vec<DailyActivity>,
    pub total_visits: i64,
    pub total_downloads: i64,
}

/// Length of the daily series returned by [`Database::dataset_activity`]
pub const ACTIVITY_DAYS: i64 = 30;

fn parse_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// SQLite treats a negative LIMIT as "no limit"
fn sql_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(-1)
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = if config.url.starts_with("sqlite:") {
            config.url.clone()
        } else {
            format!("sqlite:{}", config.url)
        };
        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory store; every connection of a pool would
    /// otherwise see its own empty database
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Self { pool };
        db.run_migrations().await.unwrap();
        db
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_DATASET_STATS)
            .execute(&self.pool)
            .await?;
        self.evolve_dataset_stats().await?;
        sqlx::query(schema::CREATE_RESOURCE_STATS)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_LOCATIONS)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_LOCATION_STATS)
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_INDEX_DATASET_DAY)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_RESOURCE_DAY)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_LOCATION_DAY)
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_CATALOG_PACKAGE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_CATALOG_RESOURCE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Add counter columns missing from a dataset_stats table created by an
    /// older release. Existing rows get 0.
    async fn evolve_dataset_stats(&self) -> Result<()> {
        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('dataset_stats')")
                .fetch_all(&self.pool)
                .await?;

        for (column, alter) in schema::DATASET_STATS_EVOLVED_COLUMNS {
            if !columns.iter().any(|c| c == column) {
                info!("Adding column dataset_stats.{}", column);
                sqlx::query(alter).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    /// Drop and recreate every stats table. Catalog tables are left alone.
    pub async fn reset(&self) -> Result<()> {
        for table in schema::STATS_TABLES {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&self.pool)
                .await?;
        }
        self.run_migrations().await?;
        info!("Stats tables are set up");
        Ok(())
    }

    /// Start a write batch; nothing is visible until [`StatsBatch::commit`]
    pub async fn begin_batch(&self) -> sqlx::Result<StatsBatch> {
        Ok(StatsBatch {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn latest_day(&self, stream: Stream) -> sqlx::Result<Option<NaiveDate>> {
        let raw: Option<String> = sqlx::query_scalar(stream.latest_day_sql())
            .fetch_one(&self.pool)
            .await?;
        Ok(raw.as_deref().and_then(parse_day))
    }

    #[cfg(test)]
    pub async fn dataset_day(&self, dataset_id: &str, day: NaiveDate) -> Result<Option<DatasetDayStat>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT visits, entrances, downloads FROM dataset_stats WHERE dataset_id = ? AND day = ?",
        )
        .bind(dataset_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(visits, entrances, downloads)| DatasetDayStat {
            dataset_id: dataset_id.to_string(),
            day,
            visits,
            entrances,
            downloads,
        }))
    }

    #[cfg(test)]
    pub async fn resource_day(&self, resource_id: &str, day: NaiveDate) -> Result<Option<i64>> {
        let visits = sqlx::query_scalar(
            "SELECT visits FROM resource_stats WHERE resource_id = ? AND day = ?",
        )
        .bind(resource_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;
        Ok(visits)
    }

    #[cfg(test)]
    pub async fn location_day(&self, name: &str, day: NaiveDate) -> Result<Option<i64>> {
        let sessions = sqlx::query_scalar(
            r#"
            SELECT ls.sessions
            FROM location_stats ls
            JOIN locations l ON l.id = ls.location_id
            WHERE l.name = ? AND ls.day = ?
            "#,
        )
        .bind(name)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Datasets with counters summed over `[start, end]`, ranked by `sort_by`.
    /// Ties are broken by dataset id.
    pub async fn dataset_totals(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: Option<i64>,
        order: SortOrder,
        sort_by: DatasetMetric,
    ) -> Result<Vec<DatasetTotal>> {
        let sql = format!(
            r#"
            SELECT s.dataset_id,
                   MAX(COALESCE(p.title, p.name)) AS name,
                   SUM(s.visits) AS total_visits,
                   SUM(s.entrances) AS total_entrances,
                   SUM(s.downloads) AS total_downloads
            FROM dataset_stats s
            LEFT JOIN package p ON p.id = s.dataset_id
            WHERE s.day >= ? AND s.day <= ?
            GROUP BY s.dataset_id
            ORDER BY {} {}, s.dataset_id ASC
            LIMIT ?
            "#,
            sort_by.column(),
            order.sql()
        );

        let rows: Vec<(String, Option<String>, i64, i64, i64)> = sqlx::query_as(&sql)
            .bind(start)
            .bind(end)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(dataset_id, name, visits, entrances, downloads)| DatasetTotal {
                dataset_id,
                name,
                visits,
                entrances,
                downloads,
            })
            .collect())
    }

    pub async fn resource_totals(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: Option<i64>,
    ) -> Result<Vec<ResourceTotal>> {
        let rows: Vec<(String, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT s.resource_id, MAX(r.package_id), SUM(s.visits) AS total_visits
            FROM resource_stats s
            LEFT JOIN resource r ON r.id = s.resource_id
            WHERE s.day >= ? AND s.day <= ?
            GROUP BY s.resource_id
            ORDER BY total_visits DESC, s.resource_id ASC
            LIMIT ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(resource_id, dataset_id, visits)| ResourceTotal {
                resource_id,
                dataset_id,
                visits,
            })
            .collect())
    }

    /// All-time most visited datasets that are currently active and public.
    /// Visibility comes from the live catalog, so a dataset that was deleted
    /// or made private drops out while its counters stay stored.
    pub async fn top_datasets(&self, limit: i64) -> Result<Vec<DatasetTotal>> {
        let rows: Vec<(String, Option<String>, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT s.dataset_id,
                   MAX(COALESCE(p.title, p.name)),
                   SUM(s.visits) AS total_visits,
                   SUM(s.entrances),
                   SUM(s.downloads)
            FROM dataset_stats s
            JOIN package p ON p.id = s.dataset_id
            WHERE p.state = 'active' AND p.private = 0
            GROUP BY s.dataset_id
            ORDER BY total_visits DESC, s.dataset_id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(dataset_id, name, visits, entrances, downloads)| DatasetTotal {
                dataset_id,
                name,
                visits,
                entrances,
                downloads,
            })
            .collect())
    }

    /// File location of an active resource of an active, public dataset.
    /// `dataset` may be the dataset's id or name.
    pub async fn resource_url(&self, dataset: &str, resource_id: &str) -> Result<Option<String>> {
        let url: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT r.url
            FROM resource r
            JOIN package p ON p.id = r.package_id
            WHERE r.id = ? AND (p.id = ? OR p.name = ?)
              AND r.state = 'active' AND p.state = 'active' AND p.private = 0
            "#,
        )
        .bind(resource_id)
        .bind(dataset)
        .bind(dataset)
        .fetch_optional(&self.pool)
        .await?;
        Ok(url.flatten().filter(|u| !u.is_empty()))
    }

    /// All-time most downloaded resources that are active and belong to an
    /// active, public dataset
    pub async fn top_resources(&self, limit: i64) -> Result<Vec<ResourceTotal>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT s.resource_id, MAX(r.package_id), SUM(s.visits) AS total_visits
            FROM resource_stats s
            JOIN resource r ON r.id = s.resource_id
            JOIN package p ON p.id = r.package_id
            WHERE r.state = 'active' AND p.state = 'active' AND p.private = 0
            GROUP BY s.resource_id
            ORDER BY total_visits DESC, s.resource_id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(resource_id, dataset_id, visits)| ResourceTotal {
                resource_id,
                dataset_id: Some(dataset_id),
                visits,
            })
            .collect())
    }

    pub async fn top_locations(&self, limit: i64) -> Result<Vec<LocationTotal>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT l.name, SUM(ls.sessions) AS total_sessions
            FROM location_stats ls
            JOIN locations l ON l.id = ls.location_id
            GROUP BY l.id
            ORDER BY total_sessions DESC, l.name ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, sessions)| LocationTotal { name, sessions })
            .collect())
    }

    /// Sessions summed over `[start, end]` for the locations `filter` selects
    pub async fn location_sessions(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        filter: &LocationFilter,
    ) -> Result<i64> {
        let (clause, name) = match filter {
            LocationFilter::All => ("", None),
            LocationFilter::Only(name) => (" AND l.name = ?", Some(name)),
            LocationFilter::Except(name) => (" AND l.name <> ?", Some(name)),
        };
        let sql = format!(
            r#"
            SELECT COALESCE(SUM(ls.sessions), 0)
            FROM location_stats ls
            JOIN locations l ON l.id = ls.location_id
            WHERE ls.day >= ? AND ls.day <= ?{}
            "#,
            clause
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(start).bind(end);
        if let Some(name) = name {
            query = query.bind(name);
        }
        let total: i64 = query.fetch_one(&self.pool).await?;
        Ok(total)
    }

    /// Sessions per calendar month over `[start, end]`, oldest month first
    pub async fn sessions_by_month(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<MonthlySessions>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT substr(day, 1, 7) AS month, SUM(sessions)
            FROM location_stats
            WHERE day >= ? AND day <= ?
            GROUP BY month
            ORDER BY month ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(month, sessions)| MonthlySessions { month, sessions })
            .collect())
    }

    /// Daily visits and resource downloads for the 30 days before `today`
    /// (most recent first), plus all-time totals. Missing days count as zero.
    pub async fn dataset_activity(&self, dataset_id: &str, today: NaiveDate) -> Result<DatasetActivity> {
        let first = today - Duration::days(ACTIVITY_DAYS);

        let visits: Vec<(String, i64)> = sqlx::query_as(
            "SELECT day, visits FROM dataset_stats WHERE dataset_id = ? AND day >= ? AND day < ?",
        )
        .bind(dataset_id)
        .bind(first)
        .bind(today)
        .fetch_all(&self.pool)
        .await?;

        let downloads: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT s.day, SUM(s.visits)
            FROM resource_stats s
            JOIN resource r ON r.id = s.resource_id
            WHERE r.package_id = ? AND s.day >= ? AND s.day < ?
            GROUP BY s.day
            "#,
        )
        .bind(dataset_id)
        .bind(first)
        .bind(today)
        .fetch_all(&self.pool)
        .await?;

        let total_visits: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(visits), 0) FROM dataset_stats WHERE dataset_id = ?")
                .bind(dataset_id)
                .fetch_one(&self.pool)
                .await?;

        let total_downloads: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(s.visits), 0)
            FROM resource_stats s
            JOIN resource r ON r.id = s.resource_id
            WHERE r.package_id = ?
            "#,
        )
        .bind(dataset_id)
        .fetch_one(&self.pool)
        .await?;

        let mut days: Vec<DailyActivity> = (1..=ACTIVITY_DAYS)
            .map(|offset| DailyActivity {
                day: today - Duration::days(offset),
                visits: 0,
                downloads: 0,
            })
            .collect();

        for (raw, count) in visits {
            if let Some(slot) = parse_day(&raw).and_then(|d| days.iter_mut().find(|a| a.day == d)) {
                slot.visits = count;
            }
        }
        for (raw, count) in downloads {
            if let Some(slot) = parse_day(&raw).and_then(|d| days.iter_mut().find(|a| a.day == d)) {
                slot.downloads += count;
            }
        }

        Ok(DatasetActivity {
            days,
            total_visits,
            total_downloads,
        })
    }
}

/// Open write transaction over the stats tables
pub struct StatsBatch {
    tx: Transaction<'static, Sqlite>,
}

impl StatsBatch {
    /// Insert or merge one dataset day. Only the fields present in `counts`
    /// are written; the others keep their stored value (0 for a new row).
    pub async fn upsert_dataset_day(
        &mut self,
        dataset_id: &str,
        day: NaiveDate,
        counts: DatasetCounts,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dataset_stats (dataset_id, day, visits, entrances, downloads)
            VALUES (?, ?, COALESCE(?, 0), COALESCE(?, 0), COALESCE(?, 0))
            ON CONFLICT (dataset_id, day) DO UPDATE SET
                visits = COALESCE(?, dataset_stats.visits),
                entrances = COALESCE(?, dataset_stats.entrances),
                downloads = COALESCE(?, dataset_stats.downloads)
            "#,
        )
        .bind(dataset_id)
        .bind(day)
        .bind(counts.visits)
        .bind(counts.entrances)
        .bind(counts.downloads)
        .bind(counts.visits)
        .bind(counts.entrances)
        .bind(counts.downloads)
        .execute(&mut *self.tx)
        .await?;

        debug!("Dataset stats for {} on {} updated", dataset_id, day);
        Ok(())
    }

    /// Insert or replace the download count of one resource day
    pub async fn upsert_resource_day(&mut self, resource_id: &str, day: NaiveDate, visits: i64) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_stats (resource_id, day, visits)
            VALUES (?, ?, ?)
            ON CONFLICT (resource_id, day) DO UPDATE SET visits = excluded.visits
            "#,
        )
        .bind(resource_id)
        .bind(day)
        .bind(visits)
        .execute(&mut *self.tx)
        .await?;

        debug!("Resource stats for {} on {} updated", resource_id, day);
        Ok(())
    }

    /// Insert or replace the session count of one location day, creating the
    /// location in this transaction when it is new
    pub async fn upsert_location_day(&mut self, name: &str, day: NaiveDate, sessions: i64) -> sqlx::Result<()> {
        sqlx::query("INSERT INTO locations (name) VALUES (?) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&mut *self.tx)
            .await?;
        let location_id: i64 = sqlx::query_scalar("SELECT id FROM locations WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *self.tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO location_stats (location_id, day, sessions)
            VALUES (?, ?, ?)
            ON CONFLICT (location_id, day) DO UPDATE SET sessions = excluded.sessions
            "#,
        )
        .bind(location_id)
        .bind(day)
        .bind(sessions)
        .execute(&mut *self.tx)
        .await?;

        debug!("Location stats for {} on {} updated", name, day);
        Ok(())
    }

    /// Dataset id for a dataset name or id known to the catalog
    pub async fn find_dataset(&mut self, name_or_id: &str) -> sqlx::Result<Option<String>> {
        sqlx::query_scalar("SELECT id FROM package WHERE id = ? OR name = ? LIMIT 1")
            .bind(name_or_id)
            .bind(name_or_id)
            .fetch_optional(&mut *self.tx)
            .await
    }

    pub async fn resource_exists(&mut self, resource_id: &str) -> sqlx::Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM resource WHERE id = ?")
            .bind(resource_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(found.is_some())
    }

    pub async fn commit(self) -> sqlx::Result<()> {
        self.tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    async fn add_package(db: &Database, id: &str, name: &str, state: &str, private: bool) {
        sqlx::query("INSERT INTO package (id, name, title, state, private) VALUES (?, ?, ?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(format!("Title of {}", name))
            .bind(state)
            .bind(private)
            .execute(db.pool())
            .await
            .unwrap();
    }

    async fn add_resource(db: &Database, id: &str, package_id: &str, state: &str) {
        sqlx::query("INSERT INTO resource (id, package_id, state) VALUES (?, ?, ?)")
            .bind(id)
            .bind(package_id)
            .bind(state)
            .execute(db.pool())
            .await
            .unwrap();
    }

    async fn upsert(db: &Database, id: &str, d: &str, counts: DatasetCounts) {
        let mut batch = db.begin_batch().await.unwrap();
        batch.upsert_dataset_day(id, day(d), counts).await.unwrap();
        batch.commit().await.unwrap();
    }

    fn visits(v: i64) -> DatasetCounts {
        DatasetCounts {
            visits: Some(v),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dataset_upsert_merges_fields() {
        let db = Database::in_memory().await;

        upsert(&db, "d1", "2024-03-01", visits(7)).await;
        upsert(
            &db,
            "d1",
            "2024-03-01",
            DatasetCounts {
                entrances: Some(4),
                ..Default::default()
            },
        )
        .await;

        let stat = db.dataset_day("d1", day("2024-03-01")).await.unwrap().unwrap();
        assert_eq!((stat.visits, stat.entrances, stat.downloads), (7, 4, 0));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dataset_stats")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_dataset_upsert_explicit_zero_is_written() {
        let db = Database::in_memory().await;

        upsert(&db, "d1", "2024-03-01", visits(7)).await;
        upsert(&db, "d1", "2024-03-01", visits(0)).await;

        let stat = db.dataset_day("d1", day("2024-03-01")).await.unwrap().unwrap();
        assert_eq!(stat.visits, 0);
    }

    #[tokio::test]
    async fn test_resource_and_location_upserts_replace() {
        let db = Database::in_memory().await;

        let mut batch = db.begin_batch().await.unwrap();
        batch.upsert_resource_day("r1", day("2024-03-01"), 5).await.unwrap();
        batch.upsert_resource_day("r1", day("2024-03-01"), 3).await.unwrap();
        batch.upsert_location_day("Finland", day("2024-03-01"), 10).await.unwrap();
        batch.upsert_location_day("Finland", day("2024-03-01"), 12).await.unwrap();
        batch.upsert_location_day("Finland", day("2024-03-02"), 1).await.unwrap();
        batch.commit().await.unwrap();

        assert_eq!(db.resource_day("r1", day("2024-03-01")).await.unwrap(), Some(3));
        assert_eq!(db.location_day("Finland", day("2024-03-01")).await.unwrap(), Some(12));

        let locations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM locations")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(locations, 1);
    }

    #[tokio::test]
    async fn test_uncommitted_batch_is_rolled_back() {
        let db = Database::in_memory().await;

        {
            let mut batch = db.begin_batch().await.unwrap();
            batch.upsert_dataset_day("d1", day("2024-03-01"), visits(1)).await.unwrap();
            batch.upsert_location_day("Sweden", day("2024-03-01"), 2).await.unwrap();
        }

        assert_eq!(db.dataset_day("d1", day("2024-03-01")).await.unwrap(), None);
        assert_eq!(db.latest_day(Stream::Location).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latest_day_per_stream() {
        let db = Database::in_memory().await;
        assert_eq!(db.latest_day(Stream::Package).await.unwrap(), None);

        upsert(&db, "d1", "2024-03-05", visits(1)).await;
        upsert(
            &db,
            "d1",
            "2024-03-02",
            DatasetCounts {
                downloads: Some(4),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(db.latest_day(Stream::Package).await.unwrap(), Some(day("2024-03-05")));
        assert_eq!(
            db.latest_day(Stream::PackageDownloads).await.unwrap(),
            Some(day("2024-03-02"))
        );
        assert_eq!(db.latest_day(Stream::Resource).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dataset_totals_ordering_and_range() {
        let db = Database::in_memory().await;
        add_package(&db, "b", "beta", "active", false).await;

        upsert(&db, "a", "2024-03-01", visits(5)).await;
        upsert(&db, "b", "2024-03-01", visits(3)).await;
        upsert(&db, "b", "2024-03-02", visits(2)).await;
        upsert(&db, "c", "2024-03-02", visits(1)).await;
        upsert(&db, "c", "2024-04-01", visits(100)).await;

        let totals = db
            .dataset_totals(day("2024-03-01"), day("2024-03-31"), None, SortOrder::Descending, DatasetMetric::Visits)
            .await
            .unwrap();
        let ids: Vec<_> = totals.iter().map(|t| (t.dataset_id.as_str(), t.visits)).collect();
        // a and b tie on 5; the id decides
        assert_eq!(ids, vec![("a", 5), ("b", 5), ("c", 1)]);
        assert_eq!(totals[1].name.as_deref(), Some("Title of beta"));
        assert_eq!(totals[0].name, None);

        let ascending = db
            .dataset_totals(day("2024-03-01"), day("2024-03-31"), Some(2), SortOrder::Ascending, DatasetMetric::Visits)
            .await
            .unwrap();
        let ids: Vec<_> = ascending.iter().map(|t| t.dataset_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_top_datasets_hides_private_and_deleted() {
        let db = Database::in_memory().await;
        add_package(&db, "pub", "public-set", "active", false).await;
        add_package(&db, "priv", "private-set", "active", true).await;
        add_package(&db, "gone", "deleted-set", "deleted", false).await;

        upsert(&db, "pub", "2024-03-01", visits(1)).await;
        upsert(&db, "priv", "2024-03-01", visits(50)).await;
        upsert(&db, "gone", "2024-03-01", visits(70)).await;
        upsert(&db, "unknown", "2024-03-01", visits(90)).await;

        let top = db.top_datasets(10).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].dataset_id, "pub");

        // Counters outlive visibility
        assert!(db.dataset_day("priv", day("2024-03-01")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_top_resources_requires_active_public_parent() {
        let db = Database::in_memory().await;
        add_package(&db, "p1", "open", "active", false).await;
        add_package(&db, "p2", "closed", "active", true).await;
        add_resource(&db, "r1", "p1", "active").await;
        add_resource(&db, "r2", "p2", "active").await;
        add_resource(&db, "r3", "p1", "deleted").await;

        let mut batch = db.begin_batch().await.unwrap();
        batch.upsert_resource_day("r1", day("2024-03-01"), 2).await.unwrap();
        batch.upsert_resource_day("r1", day("2024-03-02"), 3).await.unwrap();
        batch.upsert_resource_day("r2", day("2024-03-01"), 9).await.unwrap();
        batch.upsert_resource_day("r3", day("2024-03-01"), 9).await.unwrap();
        batch.commit().await.unwrap();

        let top = db.top_resources(10).await.unwrap();
        assert_eq!(
            top,
            vec![ResourceTotal {
                resource_id: "r1".to_string(),
                dataset_id: Some("p1".to_string()),
                visits: 5,
            }]
        );

        let totals = db.resource_totals(day("2024-03-01"), day("2024-03-01"), None).await.unwrap();
        assert_eq!(totals.len(), 3);
    }

    #[tokio::test]
    async fn test_location_reads() {
        let db = Database::in_memory().await;
        let mut batch = db.begin_batch().await.unwrap();
        batch.upsert_location_day("Finland", day("2024-01-31"), 10).await.unwrap();
        batch.upsert_location_day("Finland", day("2024-02-01"), 20).await.unwrap();
        batch.upsert_location_day("Sweden", day("2024-02-02"), 5).await.unwrap();
        batch.commit().await.unwrap();

        let (start, end) = (day("2024-01-01"), day("2024-12-31"));
        assert_eq!(db.location_sessions(start, end, &LocationFilter::All).await.unwrap(), 35);
        assert_eq!(
            db.location_sessions(start, end, &LocationFilter::parse(Some("Finland"))).await.unwrap(),
            30
        );
        assert_eq!(
            db.location_sessions(start, end, &LocationFilter::parse(Some("!Finland"))).await.unwrap(),
            5
        );

        let monthly = db.sessions_by_month(start, end).await.unwrap();
        assert_eq!(
            monthly,
            vec![
                MonthlySessions { month: "2024-01".to_string(), sessions: 10 },
                MonthlySessions { month: "2024-02".to_string(), sessions: 25 },
            ]
        );

        let top = db.top_locations(1).await.unwrap();
        assert_eq!(top, vec![LocationTotal { name: "Finland".to_string(), sessions: 30 }]);
    }

    #[tokio::test]
    async fn test_dataset_activity_fills_missing_days() {
        let db = Database::in_memory().await;
        add_package(&db, "p1", "open", "active", false).await;
        add_resource(&db, "r1", "p1", "active").await;
        add_resource(&db, "r2", "p1", "active").await;

        upsert(&db, "p1", "2024-03-19", visits(4)).await;
        upsert(&db, "p1", "2023-01-01", visits(100)).await;
        let mut batch = db.begin_batch().await.unwrap();
        batch.upsert_resource_day("r1", day("2024-03-19"), 1).await.unwrap();
        batch.upsert_resource_day("r2", day("2024-03-19"), 2).await.unwrap();
        batch.commit().await.unwrap();

        let activity = db.dataset_activity("p1", day("2024-03-20")).await.unwrap();
        assert_eq!(activity.days.len(), ACTIVITY_DAYS as usize);
        assert_eq!(
            activity.days[0],
            DailyActivity { day: day("2024-03-19"), visits: 4, downloads: 3 }
        );
        assert!(activity.days[1..].iter().all(|d| d.visits == 0 && d.downloads == 0));
        assert_eq!(activity.total_visits, 104);
        assert_eq!(activity.total_downloads, 3);
    }

    #[tokio::test]
    async fn test_migration_adds_counter_columns_to_legacy_table() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE dataset_stats (dataset_id TEXT NOT NULL, day TEXT NOT NULL, visits INTEGER, PRIMARY KEY (dataset_id, day))")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO dataset_stats (dataset_id, day, visits) VALUES ('d1', '2020-05-05', 9)")
            .execute(&pool)
            .await
            .unwrap();

        let db = Database { pool };
        db.run_migrations().await.unwrap();

        let stat = db.dataset_day("d1", day("2020-05-05")).await.unwrap().unwrap();
        assert_eq!((stat.visits, stat.entrances, stat.downloads), (9, 0, 0));

        // Running again is a no-op
        db.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_resource_url_requires_visible_resource() {
        let db = Database::in_memory().await;
        add_package(&db, "p1", "open", "active", false).await;
        add_package(&db, "p2", "hidden", "active", true).await;
        for (id, package_id, url, state) in [
            ("r1", "p1", "https://files.example.org/a.csv", "active"),
            ("r2", "p1", "https://files.example.org/b.csv", "deleted"),
            ("r3", "p2", "https://files.example.org/c.csv", "active"),
            ("r4", "p1", "", "active"),
        ] {
            sqlx::query("INSERT INTO resource (id, package_id, url, state) VALUES (?, ?, ?, ?)")
                .bind(id)
                .bind(package_id)
                .bind(url)
                .bind(state)
                .execute(db.pool())
                .await
                .unwrap();
        }

        let by_name = db.resource_url("open", "r1").await.unwrap();
        assert_eq!(by_name.as_deref(), Some("https://files.example.org/a.csv"));
        assert_eq!(db.resource_url("p1", "r1").await.unwrap(), by_name);
        assert_eq!(db.resource_url("p2", "r1").await.unwrap(), None);
        assert_eq!(db.resource_url("p1", "r2").await.unwrap(), None);
        assert_eq!(db.resource_url("hidden", "r3").await.unwrap(), None);
        assert_eq!(db.resource_url("p1", "r4").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_wipes_stats_but_not_catalog() {
        let db = Database::in_memory().await;
        add_package(&db, "p1", "open", "active", false).await;
        upsert(&db, "p1", "2024-03-01", visits(1)).await;

        db.reset().await.unwrap();

        assert_eq!(db.latest_day(Stream::Package).await.unwrap(), None);
        let packages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM package")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(packages, 1);
    }
}
