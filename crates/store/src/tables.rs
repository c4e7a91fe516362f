//! Table and retention-tier catalog.
//!
//! Dataset databases hold the per-sensor tables; `metadatabase` holds the
//! cross-dataset bookkeeping. Retention passes walk these fixed lists so a
//! renamed or missing table surfaces as an error instead of silently keeping
//! data forever.

use crate::{TtlSpec, TtlUnit};
use std::time::Duration;

pub const META_DB: &str = "metadatabase";

pub const IMPORTS: &str = "imports";
pub const HISTORICAL_FIRST_SEEN: &str = "historical_first_seen";
pub const FILES: &str = "files";
pub const MIN_MAX: &str = "min_max";

/// Metadata tables in the order the retention pass visits them.
pub const METADATA_TABLES: [&str; 7] = [
    IMPORTS,
    HISTORICAL_FIRST_SEEN,
    FILES,
    MIN_MAX,
    "valid_mime_types",
    "threat_intel",
    "threat_intel_feeds",
];

/// Per-dataset tables the retention pass visits.
pub const SENSOR_TABLES: [&str; 17] = [
    "conn",
    "uconn",
    "http",
    "ssl",
    "usni",
    "dns",
    "udns",
    "pdns_raw",
    "pdns",
    "mime_type_uris",
    "threat_mixtape",
    "port_info",
    "http_proto",
    "tls_proto",
    "rare_signatures",
    "big_ol_histogram",
    "exploded_dns",
];

/// Retention tiers, hottest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Raw logs and hourly/daily rollups.
    Hot,
    /// Snapshot aggregates and analysis results.
    Snapshot,
    /// First-seen identity history.
    FirstSeen,
    /// File markers for rolling imports.
    RollingFiles,
    /// Import event log.
    Imports,
}

impl Tier {
    pub fn max_age(self) -> Duration {
        match self {
            Tier::Hot => Duration::from_secs(26 * 3600),
            Tier::Snapshot => Duration::from_secs(14 * 24 * 3600),
            Tier::FirstSeen => Duration::from_secs(90 * 24 * 3600),
            Tier::RollingFiles => Duration::from_secs(180 * 24 * 3600),
            Tier::Imports => Duration::from_secs(365 * 24 * 3600),
        }
    }
}

/// One table's age-out rule.
#[derive(Debug, Clone)]
pub struct TtlRule {
    pub table: &'static str,
    pub tier: Tier,
    pub column: &'static str,
    pub unit: TtlUnit,
    pub only_rolling: bool,
}

impl TtlRule {
    pub fn spec(&self) -> TtlSpec {
        TtlSpec {
            column: self.column,
            unit: self.unit,
            max_age: self.tier.max_age(),
            only_rolling: self.only_rolling,
        }
    }
}

const fn rule(table: &'static str, tier: Tier, column: &'static str) -> TtlRule {
    TtlRule { table, tier, column, unit: TtlUnit::Seconds, only_rolling: false }
}

/// TTL rules applied to a dataset database when a rolling import creates it.
pub const DATASET_TTL_RULES: [TtlRule; 18] = [
    // raw logs age on the time of the import that wrote them
    rule("conn", Tier::Hot, "import_time"),
    rule("open_conn", Tier::Hot, "import_time"),
    rule("http", Tier::Hot, "import_time"),
    rule("open_http", Tier::Hot, "import_time"),
    rule("ssl", Tier::Hot, "import_time"),
    rule("open_ssl", Tier::Hot, "import_time"),
    rule("dns", Tier::Hot, "import_time"),
    rule("pdns_raw", Tier::Hot, "import_time"),
    // hourly rollups age on their hour bucket
    rule("uconn", Tier::Hot, "import_hour"),
    rule("usni", Tier::Hot, "import_hour"),
    rule("udns", Tier::Hot, "import_hour"),
    rule("mime_type_uris", Tier::Hot, "import_hour"),
    // daily rollup
    rule("pdns", Tier::Hot, "import_day"),
    // snapshot aggregates
    rule("big_ol_histogram", Tier::Snapshot, "import_hour"),
    rule("tls_proto", Tier::Snapshot, "import_hour"),
    rule("http_proto", Tier::Snapshot, "import_hour"),
    rule("exploded_dns", Tier::Snapshot, "import_hour"),
    rule("rare_signatures", Tier::Snapshot, "import_hour"),
];

/// Analysis results carry a microsecond timestamp.
pub const THREAT_MIXTAPE_TTL: TtlRule = TtlRule {
    table: "threat_mixtape",
    tier: Tier::Snapshot,
    column: "analyzed_at",
    unit: TtlUnit::Micros,
    only_rolling: false,
};

pub const PORT_INFO_TTL: TtlRule = rule("port_info", Tier::Snapshot, "import_hour");

/// TTL rules for the metadatabase, always in force.
pub const METADATA_TTL_RULES: [TtlRule; 3] = [
    TtlRule {
        table: HISTORICAL_FIRST_SEEN,
        tier: Tier::FirstSeen,
        column: "last_seen",
        unit: TtlUnit::Seconds,
        only_rolling: false,
    },
    TtlRule {
        table: FILES,
        tier: Tier::RollingFiles,
        column: "ts",
        unit: TtlUnit::Seconds,
        only_rolling: true,
    },
    TtlRule {
        table: IMPORTS,
        tier: Tier::Imports,
        column: "started_at",
        unit: TtlUnit::Seconds,
        only_rolling: false,
    },
];

/// How rows combine when the store merges parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeKind {
    Append,
    /// Rows sharing `keys` collapse to one, taking the minimum of `min_col`
    /// and the maximum of `max_col`.
    MinMax {
        keys: &'static [&'static str],
        min_col: &'static str,
        max_col: &'static str,
    },
}

pub fn merge_for(table: &str) -> MergeKind {
    match table {
        HISTORICAL_FIRST_SEEN => MergeKind::MinMax {
            keys: &["ip", "fqdn"],
            min_col: "first_seen",
            max_col: "last_seen",
        },
        MIN_MAX => MergeKind::MinMax {
            keys: &["database"],
            min_col: "min_ts",
            max_col: "max_ts",
        },
        _ => MergeKind::Append,
    }
}
