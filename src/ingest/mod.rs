//! Incremental ingestion from the reporting API into the stats store
//!
//! Each report type is planned, queried window by window (most recent
//! first), resolved into one in-memory map and written in one transaction.
//! A failing report type is logged and skipped; the others still run.

pub mod query;
pub mod resolve;
pub mod window;

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ReportingConfig;
use crate::db::{DatasetCounts, Database, StatsBatch, Stream};
use crate::error::IngestError;
use crate::relay::DOWNLOAD_EVENT_CATEGORY;

use query::{QueryShape, ReportingApi};
use resolve::{ResolveFn, StatsMap};

/// Sessions from uptime monitors, scripted clients and bounces are not audience
const BOT_FILTERS: &[&str] = &[
    "ga:browser!@StatusCake",
    "ga:browser!@Python",
    "ga:sessionDurationBucket!=0",
    "ga:sessionDurationBucket!=1",
    "ga:sessionDurationBucket!=2",
    "ga:sessionDurationBucket!=3",
    "ga:networkDomain!=ua.es",
    "ga:networkDomain!=amazonaws.com",
    "ga:networkDomain!=kcura.com",
    "ga:networkDomain!=relativity.com",
];

/// One write derived from a resolved map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatUpsert {
    /// `ident` is a dataset name or id
    Dataset { ident: String, day: NaiveDate, counts: DatasetCounts },
    Resource { ident: String, day: NaiveDate, visits: i64 },
    Location { name: String, day: NaiveDate, sessions: i64 },
}

pub type UpsertFn = fn(StatsMap) -> Vec<StatUpsert>;

/// Everything that differs between report types
pub struct ReportSpec {
    pub stream: Stream,
    pub filters: String,
    pub dimensions: &'static str,
    pub metrics: &'static str,
    pub sort: &'static str,
    pub resolve: ResolveFn,
    pub to_upserts: UpsertFn,
}

impl ReportSpec {
    pub fn name(&self) -> &'static str {
        self.stream.name()
    }

    fn shape(&self) -> QueryShape<'_> {
        QueryShape {
            filters: &self.filters,
            dimensions: self.dimensions,
            metrics: self.metrics,
            sort: self.sort,
        }
    }
}

fn package_upserts(map: StatsMap) -> Vec<StatUpsert> {
    flatten(map, |ident, day, c| {
        Some(StatUpsert::Dataset {
            ident,
            day,
            counts: DatasetCounts {
                visits: c.visits,
                entrances: c.entrances,
                downloads: None,
            },
        })
    })
}

fn package_download_upserts(map: StatsMap) -> Vec<StatUpsert> {
    flatten(map, |ident, day, c| {
        c.downloads.map(|downloads| StatUpsert::Dataset {
            ident,
            day,
            counts: DatasetCounts {
                downloads: Some(downloads),
                ..Default::default()
            },
        })
    })
}

fn resource_upserts(map: StatsMap) -> Vec<StatUpsert> {
    flatten(map, |ident, day, c| {
        c.downloads.map(|visits| StatUpsert::Resource { ident, day, visits })
    })
}

fn location_upserts(map: StatsMap) -> Vec<StatUpsert> {
    flatten(map, |name, day, c| {
        c.sessions.map(|sessions| StatUpsert::Location { name, day, sessions })
    })
}

fn flatten(
    map: StatsMap,
    convert: impl Fn(String, NaiveDate, resolve::Counters) -> Option<StatUpsert>,
) -> Vec<StatUpsert> {
    map.into_iter()
        .flat_map(|(entity, days)| {
            days.into_iter()
                .map(move |(day, counters)| (entity.clone(), day, counters))
        })
        .filter_map(|(entity, day, counters)| convert(entity, day, counters))
        .collect()
}

/// The report types ingested on every run, in order
pub fn report_specs(resource_prefix: &str) -> Vec<ReportSpec> {
    vec![
        ReportSpec {
            stream: Stream::Package,
            filters: "ga:pagePath=~/dataset/".to_string(),
            dimensions: "ga:pagePath,ga:date",
            metrics: "ga:uniquePageviews,ga:entrances",
            sort: "-ga:uniquePageviews",
            resolve: resolve::resolve_package,
            to_upserts: package_upserts,
        },
        ReportSpec {
            stream: Stream::Resource,
            filters: format!("ga:pagePath=~/resource/;ga:pagePath=~{}", resource_prefix),
            dimensions: "ga:pagePath,ga:date",
            metrics: "ga:uniquePageviews",
            sort: "-ga:uniquePageviews",
            resolve: resolve::resolve_resource,
            to_upserts: resource_upserts,
        },
        ReportSpec {
            stream: Stream::Location,
            filters: BOT_FILTERS.join(";"),
            dimensions: "ga:country,ga:date",
            metrics: "ga:sessions",
            sort: "-ga:sessions",
            resolve: resolve::resolve_location,
            to_upserts: location_upserts,
        },
        ReportSpec {
            stream: Stream::PackageDownloads,
            filters: format!("ga:eventCategory=={}", DOWNLOAD_EVENT_CATEGORY),
            dimensions: "ga:pagePath,ga:date",
            metrics: "ga:uniqueEvents",
            sort: "-ga:uniqueEvents",
            resolve: resolve::resolve_package_downloads,
            to_upserts: package_download_upserts,
        },
    ]
}

/// What one report type did during a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub windows: usize,
    pub rows: usize,
    pub written: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct ReportOutcome {
    pub report: &'static str,
    pub result: Result<ReportSummary, IngestError>,
}

pub struct Ingestor {
    api: Arc<dyn ReportingApi>,
    db: Database,
    profile_id: String,
    page_size: u32,
    epoch: NaiveDate,
    verify_entities: bool,
    reports: Vec<ReportSpec>,
}

impl Ingestor {
    pub fn new(api: Arc<dyn ReportingApi>, db: Database, config: &ReportingConfig) -> Self {
        Self {
            api,
            db,
            profile_id: config.profile_id.clone(),
            page_size: config.page_size,
            epoch: config.epoch,
            verify_entities: config.verify_entities,
            reports: report_specs(&config.resource_prefix),
        }
    }

    /// Ingest every report type. Failures are contained per report type.
    pub async fn run(&self, explicit_start: Option<NaiveDate>, today: NaiveDate) -> Vec<ReportOutcome> {
        let mut outcomes = Vec::with_capacity(self.reports.len());

        for spec in &self.reports {
            info!(report = spec.name(), "Performing analytics query");
            let result = self.ingest_report(spec, explicit_start, today).await;
            match &result {
                Ok(summary) => info!(
                    report = spec.name(),
                    windows = summary.windows,
                    rows = summary.rows,
                    written = summary.written,
                    skipped = summary.skipped,
                    "Saved analytics query"
                ),
                Err(e) => error!(report = spec.name(), "Analytics query abandoned: {}", e),
            }
            outcomes.push(ReportOutcome {
                report: spec.name(),
                result,
            });
        }

        outcomes
    }

    async fn ingest_report(
        &self,
        spec: &ReportSpec,
        explicit_start: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<ReportSummary, IngestError> {
        let report = spec.name();
        let latest = self
            .db
            .latest_day(spec.stream)
            .await
            .map_err(|source| IngestError::Store { report, source })?;
        let windows = window::plan_windows(explicit_start, latest, today, self.epoch);
        if windows.is_empty() {
            warn!(report, "No window to query (start date after {})", today);
        }

        let mut summary = ReportSummary::default();
        let mut map = StatsMap::new();
        for window in &windows {
            let rows = query::query_window(self.api.as_ref(), &self.profile_id, spec.shape(), *window, self.page_size)
                .await
                .map_err(|source| IngestError::Query {
                    report,
                    start: window.start,
                    end: window.end,
                    source: source.into(),
                })?;
            summary.rows += (spec.resolve)(&rows, &mut map);
            summary.windows += 1;
        }

        let (written, skipped) = self
            .persist(spec, map)
            .await
            .map_err(|source| IngestError::Store { report, source })?;
        summary.written = written;
        summary.skipped = skipped;
        Ok(summary)
    }

    /// Write one report type's map in one transaction; returns (written, skipped)
    async fn persist(&self, spec: &ReportSpec, map: StatsMap) -> sqlx::Result<(usize, usize)> {
        let mut batch = self.db.begin_batch().await?;
        let (map, skipped) = if self.verify_entities {
            canonicalize(&mut batch, spec.stream, map).await?
        } else {
            (map, 0)
        };

        let mut written = 0;
        for upsert in (spec.to_upserts)(map) {
            match upsert {
                StatUpsert::Dataset { ident, day, counts } => {
                    batch.upsert_dataset_day(&ident, day, counts).await?;
                }
                StatUpsert::Resource { ident, day, visits } => {
                    batch.upsert_resource_day(&ident, day, visits).await?;
                }
                StatUpsert::Location { name, day, sessions } => {
                    batch.upsert_location_day(&name, day, sessions).await?;
                }
            }
            written += 1;
        }

        batch.commit().await?;
        Ok((written, skipped))
    }
}

/// Re-key the map by catalog id so every key naming the same entity (a
/// dataset by name and by id) is merged before anything is written.
/// Entities unknown to the catalog are dropped; the count of dropped
/// (entity, day) entries is returned with the map.
async fn canonicalize(batch: &mut StatsBatch, stream: Stream, map: StatsMap) -> sqlx::Result<(StatsMap, usize)> {
    let mut merged = StatsMap::new();
    let mut skipped = 0;

    for (ident, days) in map {
        let id = match stream {
            Stream::Package | Stream::PackageDownloads => batch.find_dataset(&ident).await?,
            Stream::Resource => {
                if batch.resource_exists(&ident).await? {
                    Some(ident.clone())
                } else {
                    None
                }
            }
            Stream::Location => Some(ident.clone()),
        };
        let Some(id) = id else {
            warn!(report = stream.name(), "Couldn't find {} in the catalog", ident);
            skipped += days.len();
            continue;
        };

        let slots = merged.entry(id).or_default();
        for (day, counters) in days {
            slots.entry(day).or_default().merge(counters);
        }
    }

    Ok((merged, skipped))
}
