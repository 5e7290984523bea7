//! Append-only log of status and speed-test snapshots.
//!
//! Each row carries a type tag and the JSON payload of the snapshot, stamped
//! with the snapshot's own capture time. Timestamps are stored as fixed-width
//! RFC 3339 UTC text so that text comparison in SQL matches time order.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::Pool;
use crate::netmon::{NetworkStatus, SpeedTestResult};

pub const MAX_STATUS_ROWS: usize = 100;
pub const MAX_SPEED_TEST_ROWS: usize = 50;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to serialize {metric_type} payload: {source}")]
    Serialize {
        metric_type: MetricType,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {metric_type} record {id}: {source}")]
    Decode {
        id: i64,
        metric_type: MetricType,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown metric type '{0}'")]
    UnknownType(String),

    #[error("malformed timestamp '{0}'")]
    BadTimestamp(String),

    #[error("storage connection unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("storage query failed: {0}")]
    Storage(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Status,
    SpeedTest,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Status => "status",
            MetricType::SpeedTest => "speedtest",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(MetricType::Status),
            "speedtest" => Ok(MetricType::SpeedTest),
            other => Err(MetricsError::UnknownType(other.to_string())),
        }
    }
}

/// A persisted row. `payload` is only meaningful through [`StoredMetric::decode`].
#[derive(Debug, Clone, Serialize)]
pub struct StoredMetric {
    pub id: i64,
    pub metric_type: MetricType,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricPayload {
    Status(NetworkStatus),
    SpeedTest(SpeedTestResult),
}

impl StoredMetric {
    /// Decode the payload according to the row's type tag.
    pub fn decode(&self) -> Result<MetricPayload, MetricsError> {
        let decode_err = |source| MetricsError::Decode {
            id: self.id,
            metric_type: self.metric_type,
            source,
        };
        match self.metric_type {
            MetricType::Status => serde_json::from_str(&self.payload)
                .map(MetricPayload::Status)
                .map_err(decode_err),
            MetricType::SpeedTest => serde_json::from_str(&self.payload)
                .map(MetricPayload::SpeedTest)
                .map_err(decode_err),
        }
    }
}

/// Parse a history window such as `24h` or `7d`.
pub fn parse_window(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (unit_at, _) = s.char_indices().last()?;
    let (num, unit) = s.split_at(unit_at);
    let n: u64 = num.parse().ok()?;
    match unit {
        "h" => n.checked_mul(3600),
        "d" => n.checked_mul(24 * 3600),
        _ => None,
    }
    .map(Duration::from_secs)
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `now - age`, clamped to the Unix epoch.
fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .unwrap_or_else(epoch)
}

pub(crate) fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

/// Stateless facade over the `network_metrics` table.
#[derive(Clone)]
pub struct MetricsStore {
    pool: Pool,
}

impl MetricsStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn save_status(&self, status: &NetworkStatus) -> Result<i64, MetricsError> {
        self.append(MetricType::Status, status, status.checked_at)
    }

    pub fn save_speed_test(&self, result: &SpeedTestResult) -> Result<i64, MetricsError> {
        self.append(MetricType::SpeedTest, result, result.tested_at)
    }

    fn append<T: Serialize>(
        &self,
        metric_type: MetricType,
        value: &T,
        created_at: DateTime<Utc>,
    ) -> Result<i64, MetricsError> {
        let payload = serde_json::to_string(value)
            .map_err(|source| MetricsError::Serialize { metric_type, source })?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO network_metrics (type, payload, created_at) VALUES (?1, ?2, ?3)",
            params![metric_type.as_str(), payload, format_ts(created_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Raw rows of one type created at or after `since`, newest first.
    ///
    /// Rows that cannot be read are skipped with a warning; only a failure of
    /// the query itself is an error.
    pub fn list(
        &self,
        metric_type: MetricType,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredMetric>, MetricsError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, payload, created_at FROM network_metrics
             WHERE type = ?1 AND created_at >= ?2
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![metric_type.as_str(), format_ts(since), limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for r in rows {
            let (id, type_str, payload, created_str) = match r {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable metric row");
                    continue;
                }
            };
            let parsed = type_str.parse::<MetricType>().and_then(|t| {
                DateTime::parse_from_rfc3339(&created_str)
                    .map(|dt| (t, dt.with_timezone(&Utc)))
                    .map_err(|_| MetricsError::BadTimestamp(created_str.clone()))
            });
            match parsed {
                Ok((metric_type, created_at)) => records.push(StoredMetric {
                    id,
                    metric_type,
                    payload,
                    created_at,
                }),
                Err(e) => warn!(id, error = %e, "Skipping malformed metric row"),
            }
        }
        Ok(records)
    }

    pub fn recent_statuses(&self, window: Duration) -> Result<Vec<NetworkStatus>, MetricsError> {
        self.statuses_since(cutoff(window))
    }

    pub fn recent_speed_tests(&self, window: Duration) -> Result<Vec<SpeedTestResult>, MetricsError> {
        self.speed_tests_since(cutoff(window))
    }

    pub fn statuses_since(&self, since: DateTime<Utc>) -> Result<Vec<NetworkStatus>, MetricsError> {
        let records = self.list(MetricType::Status, since, MAX_STATUS_ROWS)?;
        Ok(decode_each(records, |p| match p {
            MetricPayload::Status(s) => Some(s),
            MetricPayload::SpeedTest(_) => None,
        }))
    }

    pub fn speed_tests_since(&self, since: DateTime<Utc>) -> Result<Vec<SpeedTestResult>, MetricsError> {
        let records = self.list(MetricType::SpeedTest, since, MAX_SPEED_TEST_ROWS)?;
        Ok(decode_each(records, |p| match p {
            MetricPayload::SpeedTest(r) => Some(r),
            MetricPayload::Status(_) => None,
        }))
    }

    /// Delete records of every type older than `age`. Returns the number removed.
    pub fn prune_older_than(&self, age: Duration) -> Result<usize, MetricsError> {
        self.prune_before(cutoff(age))
    }

    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, MetricsError> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM network_metrics WHERE created_at < ?1",
            params![format_ts(cutoff)],
        )?;
        Ok(removed)
    }
}

fn decode_each<T>(records: Vec<StoredMetric>, pick: impl Fn(MetricPayload) -> Option<T>) -> Vec<T> {
    records
        .into_iter()
        .filter_map(|m| match m.decode() {
            Ok(payload) => pick(payload),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable metric");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmon::SegmentResult;
    use crate::storage::open_pool;
    use chrono::Duration as TimeDelta;

    fn store() -> (tempfile::TempDir, MetricsStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("metrics.db")).unwrap();
        (dir, MetricsStore::new(pool))
    }

    fn status_at(checked_at: DateTime<Utc>, machine_ip: &str) -> NetworkStatus {
        NetworkStatus {
            machine_ip: machine_ip.to_string(),
            tunnel_ip: "104.28.0.9".to_string(),
            tunnel_asn: "AS13335".to_string(),
            tunnel_org: "Cloudflare".to_string(),
            tunnel_active: true,
            upstream_ok: true,
            upstream_latency_ms: 42,
            upstream_seen_ip: Some("104.28.0.9".to_string()),
            last_error: None,
            checked_at,
        }
    }

    fn speed_test_at(tested_at: DateTime<Utc>) -> SpeedTestResult {
        SpeedTestResult {
            local_egress: Some(SegmentResult {
                speed_mbps: 93.5,
                latency_ms: 40,
                bytes_transferred: 5_000_000,
                source_ip: "203.0.113.5".to_string(),
                dest_ip: Some("104.28.0.9".to_string()),
            }),
            upstream: None,
            total_latency_ms: 40,
            tested_at,
            error: None,
        }
    }

    #[test]
    fn test_empty_history_is_not_an_error() {
        let (_dir, store) = store();
        let day = Duration::from_secs(24 * 3600);
        assert!(store.recent_statuses(day).unwrap().is_empty());
        assert!(store.recent_speed_tests(day).unwrap().is_empty());
    }

    #[test]
    fn test_status_round_trip() {
        let (_dir, store) = store();
        let status = status_at(Utc::now(), "203.0.113.5");
        store.save_status(&status).unwrap();

        let got = store.recent_statuses(Duration::from_secs(3600)).unwrap();
        assert_eq!(got, vec![status]);
    }

    #[test]
    fn test_speed_test_round_trip() {
        let (_dir, store) = store();
        let result = speed_test_at(Utc::now());
        store.save_speed_test(&result).unwrap();

        let got = store.recent_speed_tests(Duration::from_secs(3600)).unwrap();
        assert_eq!(got, vec![result]);
        // Types never bleed into each other.
        assert!(store.recent_statuses(Duration::from_secs(3600)).unwrap().is_empty());
    }

    #[test]
    fn test_record_uses_capture_time() {
        let (_dir, store) = store();
        let captured = Utc::now() - TimeDelta::hours(3);
        store.save_status(&status_at(captured, "203.0.113.5")).unwrap();

        let rows = store
            .list(MetricType::Status, captured - TimeDelta::seconds(1), 10)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(format_ts(rows[0].created_at), format_ts(captured));
        assert!(matches!(rows[0].decode().unwrap(), MetricPayload::Status(_)));
    }

    #[test]
    fn test_window_boundaries() {
        let (_dir, store) = store();
        let now = Utc::now();
        let cutoff = now - TimeDelta::hours(1);

        store.save_status(&status_at(cutoff - TimeDelta::milliseconds(1), "old")).unwrap();
        store.save_status(&status_at(cutoff, "edge")).unwrap();
        store.save_status(&status_at(now, "new")).unwrap();

        let got: Vec<_> = store
            .statuses_since(cutoff)
            .unwrap()
            .into_iter()
            .map(|s| s.machine_ip)
            .collect();
        assert_eq!(got, vec!["new", "edge"]);
    }

    #[test]
    fn test_results_are_capped_and_newest_first() {
        let (_dir, store) = store();
        let now = Utc::now();
        for i in 0..120 {
            let ts = now - TimeDelta::seconds(i);
            store.save_status(&status_at(ts, &format!("10.0.0.{}", i))).unwrap();
            if i < 60 {
                store.save_speed_test(&speed_test_at(ts)).unwrap();
            }
        }

        let window = Duration::from_secs(3600);
        let statuses = store.recent_statuses(window).unwrap();
        assert_eq!(statuses.len(), MAX_STATUS_ROWS);
        assert_eq!(statuses[0].machine_ip, "10.0.0.0");
        assert!(statuses.windows(2).all(|w| w[0].checked_at >= w[1].checked_at));

        assert_eq!(store.recent_speed_tests(window).unwrap().len(), MAX_SPEED_TEST_ROWS);
    }

    #[test]
    fn test_undecodable_rows_are_skipped() {
        let (dir, store) = store();
        store.save_status(&status_at(Utc::now(), "good")).unwrap();

        let pool = open_pool(&dir.path().join("metrics.db")).unwrap();
        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO network_metrics (type, payload, created_at) VALUES ('status', '{not json', ?1)",
                params![format_ts(Utc::now())],
            )
            .unwrap();

        let got = store.recent_statuses(Duration::from_secs(3600)).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].machine_ip, "good");
    }

    #[test]
    fn test_prune_removes_old_records_of_all_types() {
        let (_dir, store) = store();
        let old = Utc::now() - TimeDelta::days(10);
        store.save_status(&status_at(old, "old")).unwrap();
        store.save_speed_test(&speed_test_at(old)).unwrap();
        store.save_status(&status_at(Utc::now(), "new")).unwrap();

        let week = Duration::from_secs(7 * 24 * 3600);
        assert_eq!(store.prune_older_than(week).unwrap(), 2);
        assert_eq!(store.prune_older_than(week).unwrap(), 0);

        let left = store.list(MetricType::Status, epoch(), 10).unwrap();
        assert_eq!(left.len(), 1);
        assert!(store.list(MetricType::SpeedTest, epoch(), 10).unwrap().is_empty());
    }

    #[test]
    fn test_parse_window() {
        assert_eq!(parse_window("24h"), Some(Duration::from_secs(24 * 3600)));
        assert_eq!(parse_window("7d"), Some(Duration::from_secs(7 * 24 * 3600)));
        assert_eq!(parse_window("7w"), None);
        assert_eq!(parse_window("h"), None);
        assert_eq!(parse_window(""), None);
        assert_eq!(parse_window("7é"), None);
    }

    #[test]
    fn test_parse_window_rejects_overflowing_counts() {
        assert_eq!(parse_window("9999999999999999h"), None);
        assert_eq!(parse_window("999999999999999d"), None);
        assert_eq!(
            parse_window("5124095576030431h"),
            Some(Duration::from_secs(5_124_095_576_030_431 * 3600))
        );
    }

    #[test]
    fn test_metric_type_tags() {
        assert_eq!(MetricType::Status.to_string(), "status");
        assert_eq!("speedtest".parse::<MetricType>().unwrap(), MetricType::SpeedTest);
        assert!("bogus".parse::<MetricType>().is_err());
    }
}
