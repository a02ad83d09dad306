//! Raw report rows to per-entity, per-day counters
//!
//! Rows carry the grouping dimension at position 0, the date (`YYYYMMDD`) at
//! position 1 and the requested metrics after that. Page paths are reduced to
//! the entity identifier following an anchor segment, so the same dataset
//! seen under `/fi/dataset/x`, `/data/en/dataset/x?tab=1` etc. lands on one
//! key and its values are added together.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::debug;

pub type ReportRow = Vec<String>;

/// Counters gathered for one entity on one day. Only the fields a report
/// produces are set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub visits: Option<i64>,
    pub entrances: Option<i64>,
    pub downloads: Option<i64>,
    pub sessions: Option<i64>,
}

fn add(slot: &mut Option<i64>, value: i64) {
    *slot = Some(slot.unwrap_or(0) + value);
}

impl Counters {
    /// Fold in the counters of another key naming the same entity. Summed
    /// fields add up; sessions are absolute, so a present value replaces.
    pub fn merge(&mut self, other: Counters) {
        for (slot, value) in [
            (&mut self.visits, other.visits),
            (&mut self.entrances, other.entrances),
            (&mut self.downloads, other.downloads),
        ] {
            if let Some(value) = value {
                add(slot, value);
            }
        }
        if other.sessions.is_some() {
            self.sessions = other.sessions;
        }
    }
}

/// entity -> day -> counters
pub type StatsMap = BTreeMap<String, BTreeMap<NaiveDate, Counters>>;

/// Merges rows into the map and returns how many rows were used
pub type ResolveFn = fn(&[ReportRow], &mut StatsMap) -> usize;

pub const DATASET_ANCHOR: &str = "dataset";
pub const RESOURCE_ANCHOR: &str = "resource";

/// Identifier in the path segment after `anchor`, with any query string cut
/// off. With `strict`, the identifier must also be the last segment.
pub fn entity_from_path<'a>(path: &'a str, anchor: &str, strict: bool) -> Option<&'a str> {
    let path = match path.find(['?', '&']) {
        Some(cut) => &path[..cut],
        None => path,
    };

    let mut segments = path.split('/');
    segments.find(|segment| *segment == anchor)?;
    let entity = segments.next().filter(|s| !s.is_empty())?;

    if strict && segments.any(|s| !s.is_empty()) {
        return None;
    }
    Some(entity)
}

struct ParsedRow<'a> {
    dimension: &'a str,
    day: NaiveDate,
    metrics: Vec<i64>,
}

fn parse_row(row: &ReportRow, metric_count: usize) -> Option<ParsedRow<'_>> {
    if row.len() < 2 + metric_count {
        debug!("Skipping short row {:?}", row);
        return None;
    }
    let day = match NaiveDate::parse_from_str(&row[1], "%Y%m%d") {
        Ok(day) => day,
        Err(_) => {
            debug!("Skipping row with bad date {:?}", row);
            return None;
        }
    };
    let metrics: Option<Vec<i64>> = row[2..2 + metric_count]
        .iter()
        .map(|cell| cell.trim().parse::<i64>().ok().filter(|v| *v >= 0))
        .collect();
    let Some(metrics) = metrics else {
        debug!("Skipping row with bad metrics {:?}", row);
        return None;
    };

    Some(ParsedRow {
        dimension: &row[0],
        day,
        metrics,
    })
}

fn counters_for<'m>(acc: &'m mut StatsMap, entity: &str, day: NaiveDate) -> &'m mut Counters {
    acc.entry(entity.to_string()).or_default().entry(day).or_default()
}

/// Dataset page views: metrics `[uniquePageviews, entrances]`
pub fn resolve_package(rows: &[ReportRow], acc: &mut StatsMap) -> usize {
    let mut used = 0;
    for row in rows {
        let Some(parsed) = parse_row(row, 2) else { continue };
        let Some(entity) = entity_from_path(parsed.dimension, DATASET_ANCHOR, true) else {
            continue;
        };
        let counters = counters_for(acc, entity, parsed.day);
        add(&mut counters.visits, parsed.metrics[0]);
        add(&mut counters.entrances, parsed.metrics[1]);
        used += 1;
    }
    used
}

/// Resource download pages: metrics `[uniquePageviews]`
pub fn resolve_resource(rows: &[ReportRow], acc: &mut StatsMap) -> usize {
    let mut used = 0;
    for row in rows {
        let Some(parsed) = parse_row(row, 1) else { continue };
        let Some(entity) = entity_from_path(parsed.dimension, RESOURCE_ANCHOR, false) else {
            continue;
        };
        add(&mut counters_for(acc, entity, parsed.day).downloads, parsed.metrics[0]);
        used += 1;
    }
    used
}

/// Download events attributed to the dataset in the page path: metrics `[uniqueEvents]`
pub fn resolve_package_downloads(rows: &[ReportRow], acc: &mut StatsMap) -> usize {
    let mut used = 0;
    for row in rows {
        let Some(parsed) = parse_row(row, 1) else { continue };
        let Some(entity) = entity_from_path(parsed.dimension, DATASET_ANCHOR, false) else {
            continue;
        };
        add(&mut counters_for(acc, entity, parsed.day).downloads, parsed.metrics[0]);
        used += 1;
    }
    used
}

/// Sessions per country: metrics `[sessions]`. Each row is the absolute
/// count for its day, so a later row replaces an earlier one.
pub fn resolve_location(rows: &[ReportRow], acc: &mut StatsMap) -> usize {
    let mut used = 0;
    for row in rows {
        let Some(parsed) = parse_row(row, 1) else { continue };
        let location = parsed.dimension.trim();
        if location.is_empty() {
            continue;
        }
        counters_for(acc, location, parsed.day).sessions = Some(parsed.metrics[0]);
        used += 1;
    }
    used
}
