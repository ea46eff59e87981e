//! GTFS Reference Vocabulary
//!
//! The known GTFS feed files and their typed column sets. Ingestion uses this
//! to coerce CSV values, and the spec-lookup prompt uses the condensed
//! description so the model can reason about the standard before it sees the
//! live schema.

/// Column type in the reference schema, mapped onto SQLite storage classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "REAL",
        }
    }
}

/// One known GTFS table: feed file name and typed columns.
pub struct ReferenceTable {
    pub table: &'static str,
    pub file: &'static str,
    pub columns: &'static [(&'static str, ColumnType)],
}

use ColumnType::{Float, Integer, Text};

pub const REFERENCE_TABLES: &[ReferenceTable] = &[
    ReferenceTable {
        table: "agency",
        file: "agency.txt",
        columns: &[
            ("agency_id", Text),
            ("agency_name", Text),
            ("agency_url", Text),
            ("agency_timezone", Text),
            ("agency_lang", Text),
            ("agency_phone", Text),
            ("agency_fare_url", Text),
            ("agency_email", Text),
        ],
    },
    ReferenceTable {
        table: "stops",
        file: "stops.txt",
        columns: &[
            ("stop_id", Text),
            ("stop_code", Text),
            ("stop_name", Text),
            ("stop_desc", Text),
            ("stop_lat", Float),
            ("stop_lon", Float),
            ("zone_id", Text),
            ("stop_url", Text),
            ("location_type", Integer),
            ("parent_station", Text),
            ("stop_timezone", Text),
            ("wheelchair_boarding", Integer),
            ("level_id", Text),
            ("platform_code", Text),
        ],
    },
    ReferenceTable {
        table: "routes",
        file: "routes.txt",
        columns: &[
            ("route_id", Text),
            ("agency_id", Text),
            ("route_short_name", Text),
            ("route_long_name", Text),
            ("route_desc", Text),
            ("route_type", Integer),
            ("route_url", Text),
            ("route_color", Text),
            ("route_text_color", Text),
            ("route_sort_order", Integer),
            ("continuous_pickup", Integer),
            ("continuous_drop_off", Integer),
        ],
    },
    ReferenceTable {
        table: "trips",
        file: "trips.txt",
        columns: &[
            ("route_id", Text),
            ("service_id", Text),
            ("trip_id", Text),
            ("trip_headsign", Text),
            ("trip_short_name", Text),
            ("direction_id", Integer),
            ("block_id", Text),
            ("shape_id", Text),
            ("wheelchair_accessible", Integer),
            ("bikes_allowed", Integer),
        ],
    },
    ReferenceTable {
        table: "stop_times",
        file: "stop_times.txt",
        columns: &[
            ("trip_id", Text),
            ("arrival_time", Text),
            ("departure_time", Text),
            ("stop_id", Text),
            ("stop_sequence", Integer),
            ("stop_headsign", Text),
            ("pickup_type", Integer),
            ("drop_off_type", Integer),
            ("continuous_pickup", Integer),
            ("continuous_drop_off", Integer),
            ("shape_dist_traveled", Float),
            ("timepoint", Integer),
        ],
    },
    ReferenceTable {
        table: "calendar",
        file: "calendar.txt",
        columns: &[
            ("service_id", Text),
            ("monday", Integer),
            ("tuesday", Integer),
            ("wednesday", Integer),
            ("thursday", Integer),
            ("friday", Integer),
            ("saturday", Integer),
            ("sunday", Integer),
            ("start_date", Text),
            ("end_date", Text),
        ],
    },
    ReferenceTable {
        table: "calendar_dates",
        file: "calendar_dates.txt",
        columns: &[
            ("service_id", Text),
            ("date", Text),
            ("exception_type", Integer),
        ],
    },
    ReferenceTable {
        table: "shapes",
        file: "shapes.txt",
        columns: &[
            ("shape_id", Text),
            ("shape_pt_lat", Float),
            ("shape_pt_lon", Float),
            ("shape_pt_sequence", Integer),
            ("shape_dist_traveled", Float),
        ],
    },
    ReferenceTable {
        table: "frequencies",
        file: "frequencies.txt",
        columns: &[
            ("trip_id", Text),
            ("start_time", Text),
            ("end_time", Text),
            ("headway_secs", Integer),
            ("exact_times", Integer),
        ],
    },
    ReferenceTable {
        table: "transfers",
        file: "transfers.txt",
        columns: &[
            ("from_stop_id", Text),
            ("to_stop_id", Text),
            ("transfer_type", Integer),
            ("min_transfer_time", Integer),
        ],
    },
    ReferenceTable {
        table: "feed_info",
        file: "feed_info.txt",
        columns: &[
            ("feed_publisher_name", Text),
            ("feed_publisher_url", Text),
            ("feed_lang", Text),
            ("default_lang", Text),
            ("feed_start_date", Text),
            ("feed_end_date", Text),
            ("feed_version", Text),
            ("feed_contact_email", Text),
            ("feed_contact_url", Text),
        ],
    },
];

/// Look up the reference table for a feed file name (e.g. "stops.txt").
/// Archives sometimes nest files in a directory, so only the basename counts.
pub fn reference_for_file(member_name: &str) -> Option<&'static ReferenceTable> {
    let base = member_name.rsplit('/').next().unwrap_or(member_name);
    REFERENCE_TABLES.iter().find(|t| t.file == base)
}

pub fn reference_for_table(table: &str) -> Option<&'static ReferenceTable> {
    REFERENCE_TABLES.iter().find(|t| t.table == table)
}

/// Condensed GTFS vocabulary for the spec-lookup prompt: what each standard
/// table means, independent of what the live feed actually contains.
pub fn condensed_vocabulary() -> String {
    let mut parts = Vec::new();
    parts.push("GTFS standard tables:".to_string());
    parts.push("- agency: transit operators (agency_id, agency_name, agency_timezone)".to_string());
    parts.push("- stops: physical stop locations (stop_id, stop_name, stop_lat, stop_lon)".to_string());
    parts.push("- routes: named services (route_id, route_short_name, route_long_name, route_type, route_color)".to_string());
    parts.push("- trips: one vehicle journey along a route (trip_id, route_id, service_id, trip_headsign, direction_id)".to_string());
    parts.push("- stop_times: per-trip stop visits in sequence (trip_id, stop_id, stop_sequence, arrival_time, departure_time)".to_string());
    parts.push("- calendar / calendar_dates: which service_ids run on which days".to_string());
    parts.push("- shapes: route geometry as ordered lat/lon points (shape_id, shape_pt_sequence)".to_string());
    parts.push("- frequencies: headway-based trips (trip_id, headway_secs)".to_string());
    parts.push("- transfers: stop-to-stop transfer rules".to_string());
    parts.push("- feed_info: feed publisher metadata".to_string());
    parts.push("Quirks: times like 25:10:00 are valid (service past midnight); trips are often duplicated across service days; a route's 'last stop' is the row with the maximum stop_sequence for a trip; colors are hex strings without '#'.".to_string());
    parts.join("\n")
}
