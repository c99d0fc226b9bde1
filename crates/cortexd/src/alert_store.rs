//! Alert Store - SQLite-backed alert persistence
//!
//! Schema:
//! - alerts: one row per alert, metadata as a JSON object in a TEXT column
//!
//! Running counters are loaded from the table on open and kept in step with
//! every insert, status change and purge, so `counts()` never touches disk.

use chrono::{DateTime, Utc};
use cortex_common::alert::{
    now_seconds, Alert, AlertCategory, AlertCounts, AlertFilter, AlertSeverity, AlertStatus,
    OpenCounts,
};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id TEXT PRIMARY KEY,
        severity TEXT NOT NULL,
        category TEXT NOT NULL,
        source TEXT NOT NULL,
        message TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        acknowledged_at INTEGER,
        dismissed_at INTEGER,
        metadata TEXT NOT NULL DEFAULT '{}'
    );

    CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status);
    CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts(severity);
    CREATE INDEX IF NOT EXISTS idx_alerts_category ON alerts(category);
    CREATE INDEX IF NOT EXISTS idx_alerts_created_at ON alerts(created_at);
"#;

const SELECT_COLUMNS: &str = "id, severity, category, source, message, description, \
     created_at, status, acknowledged_at, dismissed_at, metadata";

struct Inner {
    conn: Connection,
    counts: AlertCounts,
    open: OpenCounts,
}

/// Alert persistence. Owns its connection and counters.
pub struct AlertStore {
    inner: Mutex<Inner>,
    location: String,
}

impl AlertStore {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, path.display().to_string())
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:".to_string())
    }

    /// Open `path`, falling back to an in-memory database when that fails
    pub fn open_or_in_memory<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        match Self::open(&path) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!(
                    "[ALERTS] Cannot open {}: {}; alerts will not survive a restart",
                    path.as_ref().display(),
                    e
                );
                Self::in_memory()
            }
        }
    }

    fn init(conn: Connection, location: String) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        let (counts, open) = load_counters(&conn)?;
        info!(
            "[ALERTS] Store ready at {} ({} alerts, {} open)",
            location,
            counts.total,
            open.active + open.acknowledged
        );
        Ok(Self {
            inner: Mutex::new(Inner { conn, counts, open }),
            location,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Where the data lives, `:memory:` for the in-memory store
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Insert a new alert. An empty id is replaced with a UUID; status is
    /// always stored as active.
    pub fn create(&self, mut alert: Alert) -> Result<Alert, StoreError> {
        if alert.id.is_empty() {
            alert.id = uuid::Uuid::new_v4().to_string();
        }
        alert.status = AlertStatus::Active;
        alert.acknowledged_at = None;
        alert.dismissed_at = None;

        let metadata = serde_json::to_string(&alert.metadata)?;

        let mut inner = self.lock();
        inner
            .conn
            .prepare_cached(
                "INSERT INTO alerts (id, severity, category, source, message, description,
                                     created_at, status, acknowledged_at, dismissed_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9)",
            )?
            .execute(params![
                alert.id,
                alert.severity.as_str(),
                alert.category.as_str(),
                alert.source,
                alert.message,
                alert.description,
                alert.created_at.timestamp(),
                alert.status.as_str(),
                metadata,
            ])?;

        bump_severity(&mut inner.counts, alert.severity, 1);
        inner.open.active += 1;
        if alert.severity == AlertSeverity::Critical {
            inner.open.critical += 1;
        }

        debug!(
            "[ALERTS] Created {} {} alert {}",
            alert.severity, alert.category, alert.id
        );
        Ok(alert)
    }

    pub fn get(&self, id: &str) -> Result<Option<Alert>, StoreError> {
        let inner = self.lock();
        let sql = format!("SELECT {} FROM alerts WHERE id = ?1", SELECT_COLUMNS);
        let alert = inner
            .conn
            .prepare_cached(&sql)?
            .query_row(params![id], row_to_alert)
            .optional()?;
        Ok(alert)
    }

    /// Alerts matching `filter`, newest first
    pub fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(severity) = filter.severity {
            clauses.push("severity = ?");
            values.push(severity.as_str().to_string());
        }
        if let Some(category) = filter.category {
            clauses.push("category = ?");
            values.push(category.as_str().to_string());
        }
        if let Some(ref source) = filter.source {
            clauses.push("source = ?");
            values.push(source.clone());
        }
        match filter.status {
            Some(status) => {
                clauses.push("status = ?");
                values.push(status.as_str().to_string());
            }
            None if !filter.include_dismissed => clauses.push("status != 'dismissed'"),
            None => {}
        }

        let mut sql = format!("SELECT {} FROM alerts", SELECT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let inner = self.lock();
        let mut stmt = inner.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_alert)?;
        let alerts = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(alerts)
    }

    /// Move one active alert to acknowledged. False if missing or not active.
    pub fn acknowledge(&self, id: &str) -> bool {
        let mut inner = self.lock();
        let changed = inner
            .conn
            .prepare_cached(
                "UPDATE alerts SET status = 'acknowledged', acknowledged_at = ?1
                 WHERE id = ?2 AND status = 'active'",
            )
            .and_then(|mut stmt| stmt.execute(params![now_seconds().timestamp(), id]));

        match changed {
            Ok(1) => {
                inner.open.active = inner.open.active.saturating_sub(1);
                inner.open.acknowledged += 1;
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("[ALERTS] Failed to acknowledge {}: {}", id, e);
                false
            }
        }
    }

    /// Acknowledge every active alert, returning how many moved
    pub fn acknowledge_all(&self) -> usize {
        let mut inner = self.lock();
        let changed = inner
            .conn
            .prepare_cached(
                "UPDATE alerts SET status = 'acknowledged', acknowledged_at = ?1
                 WHERE status = 'active'",
            )
            .and_then(|mut stmt| stmt.execute(params![now_seconds().timestamp()]));

        match changed {
            Ok(n) => {
                inner.open.acknowledged += n as u64;
                inner.open.active = inner.open.active.saturating_sub(n as u64);
                n
            }
            Err(e) => {
                warn!("[ALERTS] Failed to acknowledge all: {}", e);
                0
            }
        }
    }

    /// Dismiss one open alert. False if missing or already dismissed.
    pub fn dismiss(&self, id: &str) -> bool {
        let mut inner = self.lock();
        let result = dismiss_one(&inner.conn, id);
        match result {
            Ok(Some((previous, severity))) => {
                match previous {
                    AlertStatus::Active => {
                        inner.open.active = inner.open.active.saturating_sub(1)
                    }
                    AlertStatus::Acknowledged => {
                        inner.open.acknowledged = inner.open.acknowledged.saturating_sub(1)
                    }
                    AlertStatus::Dismissed => {}
                }
                if severity == AlertSeverity::Critical {
                    inner.open.critical = inner.open.critical.saturating_sub(1);
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("[ALERTS] Failed to dismiss {}: {}", id, e);
                false
            }
        }
    }

    /// Dismiss every active and acknowledged alert
    pub fn dismiss_all(&self) -> usize {
        let mut inner = self.lock();
        let changed = inner
            .conn
            .prepare_cached(
                "UPDATE alerts SET status = 'dismissed', dismissed_at = ?1
                 WHERE status IN ('active', 'acknowledged')",
            )
            .and_then(|mut stmt| stmt.execute(params![now_seconds().timestamp()]));

        match changed {
            Ok(n) => {
                inner.open = OpenCounts::default();
                n
            }
            Err(e) => {
                warn!("[ALERTS] Failed to dismiss all: {}", e);
                0
            }
        }
    }

    /// Totals by severity over every stored alert
    pub fn counts(&self) -> AlertCounts {
        self.lock().counts
    }

    pub fn open_counts(&self) -> OpenCounts {
        self.lock().open
    }

    /// Whether an active or acknowledged alert with this identity exists
    pub fn has_open(&self, category: AlertCategory, severity: AlertSeverity, source: &str) -> bool {
        let inner = self.lock();
        let found = inner
            .conn
            .prepare_cached(
                "SELECT 1 FROM alerts
                 WHERE category = ?1 AND severity = ?2 AND source = ?3
                   AND status IN ('active', 'acknowledged')
                 LIMIT 1",
            )
            .and_then(|mut stmt| {
                stmt.query_row(
                    params![category.as_str(), severity.as_str(), source],
                    |_| Ok(()),
                )
                .optional()
            });

        match found {
            Ok(hit) => hit.is_some(),
            Err(e) => {
                warn!("[ALERTS] Duplicate check failed: {}", e);
                false
            }
        }
    }

    /// Delete dismissed alerts whose dismissal is older than `cutoff`
    pub fn purge_dismissed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let result = purge(&inner.conn, cutoff.timestamp());
        match result {
            Ok(removed) => {
                let mut total = 0usize;
                for (severity, n) in removed {
                    bump_severity(&mut inner.counts, severity, -(n as i64));
                    total += n;
                }
                if total > 0 {
                    info!("[ALERTS] Purged {} dismissed alerts", total);
                }
                total
            }
            Err(e) => {
                warn!("[ALERTS] Purge failed: {}", e);
                0
            }
        }
    }
}

fn bump_severity(counts: &mut AlertCounts, severity: AlertSeverity, delta: i64) {
    let slot = match severity {
        AlertSeverity::Info => &mut counts.info,
        AlertSeverity::Warning => &mut counts.warning,
        AlertSeverity::Error => &mut counts.error,
        AlertSeverity::Critical => &mut counts.critical,
    };
    *slot = slot.saturating_add_signed(delta);
    counts.total = counts.total.saturating_add_signed(delta);
}

fn load_counters(conn: &Connection) -> Result<(AlertCounts, OpenCounts), StoreError> {
    let mut counts = AlertCounts::default();
    let mut open = OpenCounts::default();

    let mut stmt =
        conn.prepare("SELECT severity, status, COUNT(*) FROM alerts GROUP BY severity, status")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    for row in rows {
        let (severity, status, n) = row?;
        let n = n.max(0) as u64;
        let Ok(severity) = severity.parse::<AlertSeverity>() else {
            warn!("[ALERTS] Ignoring {} rows with unknown severity '{}'", n, severity);
            continue;
        };
        bump_severity(&mut counts, severity, n as i64);

        match status.parse::<AlertStatus>() {
            Ok(AlertStatus::Active) => open.active += n,
            Ok(AlertStatus::Acknowledged) => open.acknowledged += n,
            _ => continue,
        }
        if severity == AlertSeverity::Critical {
            open.critical += n;
        }
    }

    Ok((counts, open))
}

/// Returns the status and severity the alert had before dismissal
fn dismiss_one(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<Option<(AlertStatus, AlertSeverity)>> {
    let current = conn
        .prepare_cached("SELECT status, severity FROM alerts WHERE id = ?1")?
        .query_row(params![id], |row| {
            Ok((
                parse_column::<AlertStatus>(row, 0)?,
                parse_column::<AlertSeverity>(row, 1)?,
            ))
        })
        .optional()?;

    let Some((status, severity)) = current else {
        return Ok(None);
    };
    if !status.can_transition_to(AlertStatus::Dismissed) {
        return Ok(None);
    }

    let changed = conn
        .prepare_cached(
            "UPDATE alerts SET status = 'dismissed', dismissed_at = ?1
             WHERE id = ?2 AND status != 'dismissed'",
        )?
        .execute(params![now_seconds().timestamp(), id])?;

    Ok((changed == 1).then_some((status, severity)))
}

fn purge(conn: &Connection, cutoff: i64) -> rusqlite::Result<Vec<(AlertSeverity, usize)>> {
    let tx = conn.unchecked_transaction()?;
    let mut removed = Vec::new();
    {
        let mut stmt = tx.prepare_cached(
            "SELECT severity, COUNT(*) FROM alerts
             WHERE status = 'dismissed' AND dismissed_at < ?1
             GROUP BY severity",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((parse_column::<AlertSeverity>(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (severity, n) = row?;
            removed.push((severity, n.max(0) as usize));
        }
    }
    tx.prepare_cached("DELETE FROM alerts WHERE status = 'dismissed' AND dismissed_at < ?1")?
        .execute(params![cutoff])?;
    tx.commit()?;
    Ok(removed)
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let Some(secs) = row.get::<_, Option<i64>>(idx)? else {
        return Ok(None);
    };
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(Some)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let metadata_raw: String = row.get(10)?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

    let created_at = timestamp_column(row, 6)?
        .ok_or(rusqlite::Error::InvalidColumnType(6, "created_at".into(), Type::Null))?;

    Ok(Alert {
        id: row.get(0)?,
        severity: parse_column(row, 1)?,
        category: parse_column(row, 2)?,
        source: row.get(3)?,
        message: row.get(4)?,
        description: row.get(5)?,
        created_at,
        status: parse_column(row, 7)?,
        acknowledged_at: timestamp_column(row, 8)?,
        dismissed_at: timestamp_column(row, 9)?,
        metadata,
    })
}
