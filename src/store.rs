//! Dataset Store
//!
//! Owns the tabular database built from an uploaded GTFS archive. Ingestion
//! replaces the active dataset wholesale; `schema()` serves a version-cached
//! snapshot with a few sample rows per table; `execute()` runs model-written
//! SQL after checking it parses as a single statement.
//!
//! Security caveat: beyond the single-statement gate nothing stops a write or
//! DDL statement. The dataset is disposable by design, so this is documented
//! rather than prevented.

use crate::error::{InsightError, Result};
use crate::events::EventBus;
use crate::gtfs::{reference_for_file, ColumnType};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Sample rows per table in a schema snapshot.
const SAMPLE_ROWS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub sql_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    /// Up to `SAMPLE_ROWS` rows, in column order.
    pub sample_rows: Vec<Vec<serde_json::Value>>,
}

/// Read-only description of the active dataset, used as model context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSchema>,
}

impl SchemaSnapshot {
    /// Render the snapshot as prompt text: one DDL-ish line per table plus
    /// its sample rows.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        for table in &self.tables {
            let cols: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.sql_type))
                .collect();
            parts.push(format!("{} ({});", table.name, cols.join(", ")));
            for row in &table.sample_rows {
                let vals: Vec<String> = row.iter().map(render_sample_value).collect();
                parts.push(format!("  sample: {}", vals.join(", ")));
            }
        }
        parts.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn render_sample_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Result of a successful query execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl RowSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Outcome of one ingest call. Partial success is reported, not fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub tables_loaded: Vec<String>,
    pub row_counts: HashMap<String, usize>,
    /// (table, reason) for members that looked like GTFS files but failed to parse.
    pub skipped: Vec<(String, String)>,
}

/// The single active dataset, backed by embedded SQLite.
///
/// The connection sits behind a `Mutex` (rusqlite connections are not `Sync`),
/// which serializes `execute`/`schema` against `ingest` — a query never
/// observes a dataset mid-replacement.
pub struct DatasetStore {
    conn: Mutex<Connection>,
    version: AtomicU64,
    schema_cache: Mutex<Option<(u64, Arc<SchemaSnapshot>)>>,
    events: EventBus,
}

impl DatasetStore {
    pub fn open(path: impl AsRef<Path>, events: EventBus) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self::with_connection(conn, events))
    }

    pub fn in_memory(events: EventBus) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::with_connection(conn, events))
    }

    fn with_connection(conn: Connection, events: EventBus) -> Self {
        Self {
            conn: Mutex::new(conn),
            version: AtomicU64::new(0),
            schema_cache: Mutex::new(None),
            events,
        }
    }

    pub fn dataset_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Ingest a GTFS zip archive, replacing the prior dataset entirely.
    ///
    /// Unknown archive members are ignored; a member that matches a known
    /// GTFS file but fails to parse is skipped and reported. Only an
    /// unreadable archive, or one with no loadable GTFS file at all, fails.
    pub fn ingest(&self, archive_bytes: &[u8]) -> Result<IngestReport> {
        self.events.publish(
            "ingest",
            format!("archive received ({} bytes)", archive_bytes.len()),
        );

        let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))
            .map_err(|e| InsightError::Ingest(format!("unreadable archive: {}", e)))?;

        // Refuse the upload before touching the prior dataset: an archive
        // with no known GTFS member must leave the active dataset intact.
        if !archive
            .file_names()
            .any(|name| reference_for_file(name).is_some())
        {
            let msg = "no valid GTFS files found in the archive".to_string();
            self.events.publish("ingest", msg.clone());
            return Err(InsightError::Ingest(msg));
        }

        let mut report = IngestReport {
            tables_loaded: Vec::new(),
            row_counts: HashMap::new(),
            skipped: Vec::new(),
        };

        let conn = self.conn.lock().unwrap();

        // Full replace: every reference table goes, whether or not the new
        // archive provides it.
        for table in crate::gtfs::REFERENCE_TABLES {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", table.table))?;
        }

        for idx in 0..archive.len() {
            let mut member = archive.by_index(idx)?;
            let member_name = member.name().to_string();
            let Some(reference) = reference_for_file(&member_name) else {
                continue;
            };

            let mut content = String::new();
            if let Err(e) = member.read_to_string(&mut content) {
                warn!("skipping {}: {}", member_name, e);
                report.skipped.push((reference.table.to_string(), e.to_string()));
                continue;
            }

            match load_table(&conn, reference.table, reference.columns, &content) {
                Ok(rows) => {
                    info!("loaded {} ({} rows)", reference.table, rows);
                    self.events
                        .publish("ingest", format!("loaded table {} ({} rows)", reference.table, rows));
                    report.tables_loaded.push(reference.table.to_string());
                    report.row_counts.insert(reference.table.to_string(), rows);
                }
                Err(e) => {
                    warn!("skipping {}: {}", reference.table, e);
                    self.events
                        .publish("ingest", format!("skipped table {}: {}", reference.table, e));
                    report.skipped.push((reference.table.to_string(), e.to_string()));
                }
            }
        }
        drop(conn);

        // The prior tables are gone either way, so the version moves and the
        // stale snapshot is never served again, even when every member
        // failed to parse.
        self.version.fetch_add(1, Ordering::SeqCst);
        *self.schema_cache.lock().unwrap() = None;

        if report.tables_loaded.is_empty() {
            let msg = "every GTFS file in the archive failed to parse".to_string();
            self.events.publish("ingest", msg.clone());
            return Err(InsightError::Ingest(msg));
        }

        self.events.publish(
            "ingest",
            format!(
                "ingest complete: {} tables, {} skipped",
                report.tables_loaded.len(),
                report.skipped.len()
            ),
        );
        Ok(report)
    }

    /// Schema snapshot for the current dataset version, built lazily and
    /// cached until the next ingest.
    pub fn schema(&self) -> Result<Arc<SchemaSnapshot>> {
        let version = self.version.load(Ordering::SeqCst);
        {
            let cache = self.schema_cache.lock().unwrap();
            if let Some((cached_version, snapshot)) = cache.as_ref() {
                if *cached_version == version {
                    self.events.publish(
                        "schema",
                        format!(
                            "schema snapshot served from cache ({} tables)",
                            snapshot.tables.len()
                        ),
                    );
                    return Ok(Arc::clone(snapshot));
                }
            }
        }

        let snapshot = Arc::new(self.build_snapshot()?);
        *self.schema_cache.lock().unwrap() = Some((version, Arc::clone(&snapshot)));
        self.events.publish(
            "schema",
            format!("schema snapshot built ({} tables)", snapshot.tables.len()),
        );
        Ok(snapshot)
    }

    fn build_snapshot(&self) -> Result<SchemaSnapshot> {
        let conn = self.conn.lock().unwrap();
        let mut tables = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;

        for name in names {
            let mut info = conn.prepare(&format!("PRAGMA table_info(\"{}\")", name))?;
            let columns: Vec<ColumnMeta> = info
                .query_map([], |row| {
                    Ok(ColumnMeta {
                        name: row.get::<_, String>(1)?,
                        sql_type: row.get::<_, String>(2)?,
                    })
                })?
                .collect::<std::result::Result<_, _>>()?;

            let mut sample = conn.prepare(&format!(
                "SELECT * FROM \"{}\" LIMIT {}",
                name, SAMPLE_ROWS
            ))?;
            let width = sample.column_count();
            let sample_rows: Vec<Vec<serde_json::Value>> = sample
                .query_map([], |row| {
                    let mut values = Vec::with_capacity(width);
                    for i in 0..width {
                        values.push(value_ref_to_json(row.get_ref(i)?));
                    }
                    Ok(values)
                })?
                .collect::<std::result::Result<_, _>>()?;

            tables.push(TableSchema {
                name,
                columns,
                sample_rows,
            });
        }

        Ok(SchemaSnapshot { tables })
    }

    /// Execute one SQL statement and return its projection.
    ///
    /// The text must parse as exactly one statement (basic injection
    /// hygiene); beyond that the store is intentionally permissive.
    pub fn execute(&self, sql: &str) -> Result<RowSet> {
        validate_single_statement(sql)?;

        let conn = self.conn.lock().unwrap();
        let result = run_statement(&conn, sql);
        match &result {
            Ok(rows) => self.events.publish(
                "execute",
                format!("query returned {} rows", rows.row_count()),
            ),
            Err(e) => self
                .events
                .publish("execute", format!("query failed: {}", e)),
        }
        result
    }
}

fn run_statement(conn: &Connection, sql: &str) -> Result<RowSet> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| InsightError::Query(e.to_string()))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    if columns.is_empty() {
        // Write/DDL statement: no projection to return.
        stmt.execute([])
            .map_err(|e| InsightError::Query(e.to_string()))?;
        return Ok(RowSet {
            columns,
            rows: Vec::new(),
        });
    }

    let width = columns.len();
    let rows: Vec<Vec<serde_json::Value>> = stmt
        .query_map([], |row| {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(value_ref_to_json(row.get_ref(i)?));
            }
            Ok(values)
        })
        .map_err(|e| InsightError::Query(e.to_string()))?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| InsightError::Query(e.to_string()))?;

    Ok(RowSet { columns, rows })
}

/// Reject text that is not exactly one parseable SQL statement.
fn validate_single_statement(sql: &str) -> Result<()> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)
        .map_err(|e| InsightError::Query(format!("unparseable SQL: {}", e)))?;
    match statements.len() {
        0 => Err(InsightError::Query("empty SQL statement".to_string())),
        1 => Ok(()),
        n => Err(InsightError::Query(format!(
            "expected a single SQL statement, got {}",
            n
        ))),
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<{} byte blob>", b.len())),
    }
}

/// Create a table for one GTFS file and bulk-insert its CSV rows.
///
/// Column order follows the CSV header; types come from the reference schema
/// (unknown extra columns fall back to TEXT, as the standard allows
/// extensions).
fn load_table(
    conn: &Connection,
    table: &str,
    reference_columns: &[(&str, ColumnType)],
    content: &str,
) -> Result<usize> {
    // Strict field counts: a ragged row is a parse failure for the whole
    // member, mirroring how the feed would fail any conformant reader.
    let mut reader = csv::ReaderBuilder::new()
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| InsightError::Ingest(format!("bad header in {}: {}", table, e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return Err(InsightError::Ingest(format!("{} has no columns", table)));
    }

    let types: Vec<ColumnType> = headers
        .iter()
        .map(|h| {
            reference_columns
                .iter()
                .find(|(name, _)| name == h)
                .map(|(_, t)| *t)
                .unwrap_or(ColumnType::Text)
        })
        .collect();

    let column_defs: Vec<String> = headers
        .iter()
        .zip(&types)
        .map(|(name, ty)| format!("\"{}\" {}", name, ty.sql_type()))
        .collect();
    conn.execute_batch(&format!(
        "CREATE TABLE \"{}\" ({});",
        table,
        column_defs.join(", ")
    ))?;

    let placeholders: Vec<&str> = headers.iter().map(|_| "?").collect();
    let insert_sql = format!(
        "INSERT INTO \"{}\" VALUES ({})",
        table,
        placeholders.join(", ")
    );

    let insert_result = (|| -> Result<usize> {
        conn.execute_batch("BEGIN")?;
        let mut stmt = conn.prepare(&insert_sql)?;
        let mut inserted = 0usize;
        for record in reader.records() {
            let record = record
                .map_err(|e| InsightError::Ingest(format!("bad row in {}: {}", table, e)))?;
            let values: Vec<SqlValue> = (0..headers.len())
                .map(|i| coerce_value(record.get(i).unwrap_or(""), types[i]))
                .collect();
            stmt.execute(rusqlite::params_from_iter(values))?;
            inserted += 1;
        }
        drop(stmt);
        conn.execute_batch("COMMIT")?;
        Ok(inserted)
    })();

    if insert_result.is_err() {
        // A skipped member must not leave a half-made table behind.
        let _ = conn.execute_batch("ROLLBACK");
        let _ = conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", table));
    }
    insert_result
}

/// Coerce a CSV field to its declared type. Empty fields become NULL; a
/// value that refuses to parse as its declared numeric type is kept as text
/// rather than dropped, so nothing silently disappears.
fn coerce_value(raw: &str, ty: ColumnType) -> SqlValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return SqlValue::Null;
    }
    match ty {
        ColumnType::Integer => trimmed
            .parse::<i64>()
            .map(SqlValue::Integer)
            .unwrap_or_else(|_| SqlValue::Text(trimmed.to_string())),
        ColumnType::Float => trimmed
            .parse::<f64>()
            .map(SqlValue::Real)
            .unwrap_or_else(|_| SqlValue::Text(trimmed.to_string())),
        ColumnType::Text => SqlValue::Text(trimmed.to_string()),
    }
}
