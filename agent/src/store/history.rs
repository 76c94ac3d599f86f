//! Alert history: one row per alert the dispatcher finished with.

use super::Pool;
use sentinel_engine::{DeviceId, Severity, Timestamp};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Final outcome of an admitted alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertOutcome {
    Delivered,
    /// Every delivery attempt failed
    Undelivered,
    /// Older than the maximum alert age when it arrived
    Stale,
}

impl AlertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Undelivered => "undelivered",
            Self::Stale => "stale",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "delivered" => Some(Self::Delivered),
            "undelivered" => Some(Self::Undelivered),
            "stale" => Some(Self::Stale),
            _ => None,
        }
    }
}

/// Where an alert came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSource {
    /// A transition evaluated on this device
    Local,
    /// A transition learned from the remote store
    Remote,
    /// An SOS gesture or explicit emergency trigger
    Safety,
}

impl AlertSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Safety => "safety",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            "safety" => Some(Self::Safety),
            _ => None,
        }
    }
}

/// A history row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEntry {
    pub alert_id: String,
    pub device_id: DeviceId,
    pub source: AlertSource,
    /// Transition kind or safety trigger
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub outcome: AlertOutcome,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maps_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
    pub triggered_at: Timestamp,
    pub recorded_at: Timestamp,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for AlertEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let source: String = row.try_get("source")?;
        let severity: String = row.try_get("severity")?;
        let outcome: String = row.try_get("outcome")?;
        let attempts: i64 = row.try_get("attempts")?;
        let triggered_at: i64 = row.try_get("triggered_at")?;
        let recorded_at: i64 = row.try_get("recorded_at")?;

        Ok(AlertEntry {
            alert_id: row.try_get("alert_id")?,
            device_id: row.try_get("device_id")?,
            source: AlertSource::parse(&source).ok_or_else(|| decode_error("source", &source))?,
            kind: row.try_get("kind")?,
            dedup_key: row.try_get("dedup_key")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            severity: parse_severity(&severity)
                .ok_or_else(|| decode_error("severity", &severity))?,
            outcome: AlertOutcome::parse(&outcome)
                .ok_or_else(|| decode_error("outcome", &outcome))?,
            attempts: attempts as u32,
            reason: row.try_get("reason")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            maps_url: row.try_get("maps_url")?,
            contact_name: row.try_get("contact_name")?,
            contact_phone: row.try_get("contact_phone")?,
            triggered_at: triggered_at as u64,
            recorded_at: recorded_at as u64,
        })
    }
}

fn parse_severity(value: &str) -> Option<Severity> {
    match value {
        "info" => Some(Severity::Info),
        "warning" => Some(Severity::Warning),
        "critical" => Some(Severity::Critical),
        _ => None,
    }
}

fn decode_error(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("unknown value '{value}'").into(),
    }
}

/// Persistent alert history.
#[derive(Clone)]
pub struct AlertHistory {
    pool: Pool,
}

impl AlertHistory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, entry: &AlertEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO alert_history (
                alert_id, device_id, source, kind, dedup_key, title, body, severity,
                outcome, attempts, reason, latitude, longitude, maps_url,
                contact_name, contact_phone, triggered_at, recorded_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.alert_id)
        .bind(&entry.device_id)
        .bind(entry.source.as_str())
        .bind(&entry.kind)
        .bind(&entry.dedup_key)
        .bind(&entry.title)
        .bind(&entry.body)
        .bind(entry.severity.as_str())
        .bind(entry.outcome.as_str())
        .bind(entry.attempts as i64)
        .bind(&entry.reason)
        .bind(entry.latitude)
        .bind(entry.longitude)
        .bind(&entry.maps_url)
        .bind(&entry.contact_name)
        .bind(&entry.contact_phone)
        .bind(entry.triggered_at as i64)
        .bind(entry.recorded_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent entries first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<AlertEntry>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM alert_history ORDER BY recorded_at DESC, rowid DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
    }

    /// Entries recorded in `[from, to)`, oldest first.
    pub async fn between(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<AlertEntry>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM alert_history
            WHERE recorded_at >= ? AND recorded_at < ?
            ORDER BY recorded_at ASC, rowid ASC
            "#,
        )
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_all(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM alert_history")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<u64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alert_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
