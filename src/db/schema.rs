//! Database schema definitions

pub const CREATE_DATASET_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS dataset_stats (
    dataset_id TEXT NOT NULL,
    day TEXT NOT NULL,                  -- YYYY-MM-DD
    visits INTEGER NOT NULL DEFAULT 0,
    entrances INTEGER NOT NULL DEFAULT 0,
    downloads INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (dataset_id, day)
)
"#;

pub const CREATE_RESOURCE_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS resource_stats (
    resource_id TEXT NOT NULL,
    day TEXT NOT NULL,
    visits INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (resource_id, day)
)
"#;

pub const CREATE_LOCATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
)
"#;

pub const CREATE_LOCATION_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS location_stats (
    location_id INTEGER NOT NULL REFERENCES locations(id),
    day TEXT NOT NULL,
    sessions INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (location_id, day)
)
"#;

// === INDEXES ===

// MAX(day) per stream and range scans
pub const CREATE_INDEX_DATASET_DAY: &str =
    "CREATE INDEX IF NOT EXISTS idx_dataset_stats_day ON dataset_stats(day)";

pub const CREATE_INDEX_RESOURCE_DAY: &str =
    "CREATE INDEX IF NOT EXISTS idx_resource_stats_day ON resource_stats(day)";

pub const CREATE_INDEX_LOCATION_DAY: &str =
    "CREATE INDEX IF NOT EXISTS idx_location_stats_day ON location_stats(day)";

/// Columns added to `dataset_stats` after the first release
pub const DATASET_STATS_EVOLVED_COLUMNS: &[(&str, &str)] = &[
    ("entrances", "ALTER TABLE dataset_stats ADD COLUMN entrances INTEGER NOT NULL DEFAULT 0"),
    ("downloads", "ALTER TABLE dataset_stats ADD COLUMN downloads INTEGER NOT NULL DEFAULT 0"),
];

/// Stats tables in drop order
pub const STATS_TABLES: &[&str] = &["location_stats", "locations", "resource_stats", "dataset_stats"];

// === CATALOG (owned by the host site, read here) ===

pub const CREATE_CATALOG_PACKAGE: &str = r#"
CREATE TABLE IF NOT EXISTS package (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    title TEXT,
    state TEXT NOT NULL DEFAULT 'active',
    private INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_CATALOG_RESOURCE: &str = r#"
CREATE TABLE IF NOT EXISTS resource (
    id TEXT PRIMARY KEY,
    package_id TEXT NOT NULL,
    name TEXT,
    url TEXT,
    state TEXT NOT NULL DEFAULT 'active'
)
"#;
