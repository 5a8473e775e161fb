//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use super::schema::{self, SchemaReport, SAMPLE_COLUMNS, SAMPLE_TABLE};

/// Fixed-width UTC timestamp format, so text order equals time order.
pub const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// How long a write waits on a lock held by an outside reader.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given path and reconcile its schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// An in-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Bring the samples table up to the current column set.
    fn init(&self) -> Result<SchemaReport, DbError> {
        let conn = self.conn()?;
        let report = schema::ensure(&conn, SAMPLE_TABLE, SAMPLE_COLUMNS)?;
        schema::ensure_index(&conn, SAMPLE_TABLE, "ts_utc")?;

        if report.created {
            tracing::info!("Store: created table {}", SAMPLE_TABLE);
        } else if !report.added.is_empty() {
            tracing::info!(
                "Store: added columns to {}: {}",
                SAMPLE_TABLE,
                report.added.join(", ")
            );
        }
        Ok(report)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Samples ---

    /// Write all rows of one interval in a single transaction.
    pub fn record(&self, rows: &[SampleRow]) -> Result<usize, DbError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO net_metrics (
                    ts_utc, host, iface,
                    bytes_sent_delta, bytes_recv_delta, packets_sent_delta, packets_recv_delta,
                    errin_delta, errout_delta, dropin_delta, dropout_delta,
                    bytes_sent_rate, bytes_recv_rate, packets_sent_rate, packets_recv_rate,
                    ping_min_ms, ping_avg_ms, ping_max_ms, ping_jitter_ms, ping_loss_pct,
                    ping_sent, ping_received,
                    dns_ms, dns_ok, avail_ok,
                    thr_down_mbps, thr_up_mbps, thr_method
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                          ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
            )?;

            for r in rows {
                let d = r.delta.as_ref();
                let l = r.latency.as_ref();
                let t = r.throughput.as_ref();
                stmt.execute(params![
                    format_db_time(r.time),
                    r.host,
                    r.iface,
                    d.map(|d| to_i64(d.bytes_sent)),
                    d.map(|d| to_i64(d.bytes_recv)),
                    d.map(|d| to_i64(d.packets_sent)),
                    d.map(|d| to_i64(d.packets_recv)),
                    d.map(|d| to_i64(d.errin)),
                    d.map(|d| to_i64(d.errout)),
                    d.map(|d| to_i64(d.dropin)),
                    d.map(|d| to_i64(d.dropout)),
                    d.and_then(|d| d.rate(d.bytes_sent)),
                    d.and_then(|d| d.rate(d.bytes_recv)),
                    d.and_then(|d| d.rate(d.packets_sent)),
                    d.and_then(|d| d.rate(d.packets_recv)),
                    l.and_then(|l| l.min_ms),
                    l.and_then(|l| l.avg_ms),
                    l.and_then(|l| l.max_ms),
                    l.and_then(|l| l.jitter_ms),
                    l.map(|l| l.loss_pct),
                    l.map(|l| l.sent),
                    l.map(|l| l.received),
                    r.dns.and_then(|o| o.ms()),
                    r.dns.and_then(|o| o.ok()),
                    r.avail_ok,
                    t.and_then(|t| t.down_mbps),
                    t.and_then(|t| t.up_mbps),
                    t.map(|t| t.method.as_str()),
                ])?;
            }
        }

        tx.commit()?;
        Ok(rows.len())
    }

    /// Delete samples captured before the cutoff. Returns the number removed.
    pub fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM net_metrics WHERE ts_utc < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    /// Total number of stored rows.
    pub fn count_samples(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM net_metrics", [], |r| r.get(0))?)
    }

    /// Most recent row for an interface label, if any.
    pub fn latest_sample(&self, iface: &str) -> Result<Option<StoredSample>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM net_metrics WHERE iface = ?1 ORDER BY ts_utc DESC LIMIT 1",
            STORED_SAMPLE_COLUMNS
        );
        Ok(conn.query_row(&sql, params![iface], stored_sample_from_row).optional()?)
    }

    /// All rows in capture order.
    #[cfg(test)]
    pub fn samples(&self) -> Result<Vec<StoredSample>, DbError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM net_metrics ORDER BY ts_utc ASC, iface ASC",
            STORED_SAMPLE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], stored_sample_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

const STORED_SAMPLE_COLUMNS: &str = "ts_utc, host, iface, bytes_sent_delta, bytes_recv_delta, \
     bytes_sent_rate, bytes_recv_rate, ping_avg_ms, ping_loss_pct, dns_ms, dns_ok, avail_ok, \
     thr_down_mbps, thr_up_mbps, thr_method";

fn stored_sample_from_row(row: &Row<'_>) -> rusqlite::Result<StoredSample> {
    let time_str: String = row.get(0)?;
    let time = parse_db_time(&time_str).unwrap_or(DateTime::<Utc>::MIN_UTC);
    Ok(StoredSample {
        time,
        host: row.get(1)?,
        iface: row.get(2)?,
        bytes_sent_delta: row.get(3)?,
        bytes_recv_delta: row.get(4)?,
        bytes_sent_rate: row.get(5)?,
        bytes_recv_rate: row.get(6)?,
        ping_avg_ms: row.get(7)?,
        ping_loss_pct: row.get(8)?,
        dns_ms: row.get(9)?,
        dns_ok: row.get(10)?,
        avail_ok: row.get(11)?,
        thr_down_mbps: row.get(12)?,
        thr_up_mbps: row.get(13)?,
        thr_method: row.get(14)?,
    })
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Format a timestamp the way it is stored in `ts_utc`.
pub fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Rows written by older loggers used RFC 3339 with an offset
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterDelta;
    use crate::probe::{DnsOutcome, LatencyStats};
    use crate::throughput::{ThroughputMethod, ThroughputResult};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn delta(sent: u64, recv: u64) -> CounterDelta {
        CounterDelta {
            bytes_sent: sent,
            bytes_recv: recv,
            elapsed_secs: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_record_total_row_with_all_metrics() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let row = SampleRow {
            time: now,
            host: "box".to_string(),
            iface: TOTAL_IFACE.to_string(),
            delta: Some(delta(500, 600)),
            latency: Some(LatencyStats::from_rtts(&[Some(10.0), Some(14.0), None, Some(12.0)])),
            dns: Some(DnsOutcome::Resolved(3.5)),
            avail_ok: Some(true),
            throughput: Some(ThroughputResult {
                down_mbps: Some(93.2),
                up_mbps: None,
                method: ThroughputMethod::Http,
            }),
        };
        assert_eq!(store.record(&[row]).unwrap(), 1);

        let stored = store.latest_sample(TOTAL_IFACE).unwrap().unwrap();
        assert_eq!(stored.time, now);
        assert_eq!(stored.bytes_sent_delta, Some(500));
        assert_eq!(stored.bytes_recv_delta, Some(600));
        assert_eq!(stored.bytes_sent_rate, Some(50.0));
        assert_eq!(stored.ping_loss_pct, Some(25.0));
        assert_eq!(stored.dns_ms, Some(3.5));
        assert_eq!(stored.dns_ok, Some(true));
        assert_eq!(stored.avail_ok, Some(true));
        assert_eq!(stored.thr_down_mbps, Some(93.2));
        assert_eq!(stored.thr_up_mbps, None);
        assert_eq!(stored.thr_method.as_deref(), Some("http"));
    }

    #[test]
    fn test_unmeasured_fields_are_null() {
        let store = Store::open_in_memory().unwrap();
        let row = SampleRow::counters_only(Utc::now(), "box", "eth0", None);
        store.record(&[row]).unwrap();

        let stored = store.latest_sample("eth0").unwrap().unwrap();
        assert_eq!(stored.bytes_sent_delta, None);
        assert_eq!(stored.bytes_sent_rate, None);
        assert_eq!(stored.ping_loss_pct, None);
        assert_eq!(stored.dns_ok, None);
        assert_eq!(stored.avail_ok, None);
        assert_eq!(stored.thr_method, None);
    }

    #[test]
    fn test_disabled_dns_is_null_not_failure() {
        let store = Store::open_in_memory().unwrap();
        let mut row = SampleRow::counters_only(Utc::now(), "box", TOTAL_IFACE, None);
        row.dns = Some(DnsOutcome::Disabled);
        store.record(&[row.clone()]).unwrap();
        row.iface = "failed".to_string();
        row.dns = Some(DnsOutcome::Failed);
        store.record(&[row]).unwrap();

        let disabled = store.latest_sample(TOTAL_IFACE).unwrap().unwrap();
        assert_eq!((disabled.dns_ms, disabled.dns_ok), (None, None));
        let failed = store.latest_sample("failed").unwrap().unwrap();
        assert_eq!((failed.dns_ms, failed.dns_ok), (None, Some(false)));
    }

    #[test]
    fn test_delete_samples_before() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap();
        let rows: Vec<SampleRow> = (0..10)
            .map(|d| SampleRow::counters_only(now - ChronoDuration::days(d), "box", TOTAL_IFACE, None))
            .collect();
        store.record(&rows).unwrap();

        let deleted = store.delete_samples_before(now - ChronoDuration::days(3)).unwrap();
        assert_eq!(deleted, 6);
        assert_eq!(store.count_samples().unwrap(), 4);
    }

    #[test]
    fn test_failed_insert_rolls_back_whole_interval() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_eth1 BEFORE INSERT ON net_metrics
                 WHEN NEW.iface = 'eth1'
                 BEGIN SELECT RAISE(ABORT, 'eth1 rejected'); END;",
            )
            .unwrap();

        let now = Utc::now();
        let rows = vec![
            SampleRow::counters_only(now, "box", "eth0", Some(delta(1, 2))),
            SampleRow::counters_only(now, "box", "eth1", Some(delta(3, 4))),
            SampleRow::counters_only(now, "box", TOTAL_IFACE, Some(delta(4, 6))),
        ];
        assert!(matches!(store.record(&rows), Err(DbError::Sqlite(_))));
        assert_eq!(store.count_samples().unwrap(), 0);

        // The connection stays usable after the rollback
        store.record(&rows[..1]).unwrap();
        assert_eq!(store.count_samples().unwrap(), 1);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            let row = SampleRow::counters_only(Utc::now(), "box", TOTAL_IFACE, Some(delta(1, 2)));
            store.record(&[row]).unwrap();
        }
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(store.count_samples().unwrap(), 1);
    }

    #[test]
    fn test_parse_db_time_formats() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_db_time(&format_db_time(t)), Some(t));
        assert_eq!(parse_db_time("2024-01-02 03:04:05"), Some(t));
        assert_eq!(parse_db_time("2024-01-02T03:04:05+00:00"), Some(t));
        assert_eq!(parse_db_time("yesterday"), None);
    }
}
