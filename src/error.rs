//! Error types for ingestion and event relay

use chrono::NaiveDate;
use thiserror::Error;

/// Failures that abort ingestion of a single report type
#[derive(Error, Debug)]
pub enum IngestError {
    /// Transport, auth or decoding failure against the reporting API
    #[error("query for {report} window {start}..{end} failed: {source}")]
    Query {
        report: &'static str,
        start: NaiveDate,
        end: NaiveDate,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Store read or write failure; the report type's transaction is rolled back
    #[error("stats store failed for {report}: {source}")]
    Store {
        report: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Failures delivering one tracking event
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("collector request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("collector responded with HTTP {0}")]
    Status(u16),
}
