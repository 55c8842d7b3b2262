//! SQLite persistence for devices, plants and the cycle timer.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use crate::catalog::Plant;
use crate::registry::{Device, Position, NO_COMMAND, UNASSIGNED_NAME};
use crate::scheduler::CycleTimer;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Load report
// ---------------------------------------------------------------------------

/// Why a persisted row was not restored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("unreadable column: {0}")]
    Column(String),
    #[error("negative device id {0}")]
    NegativeId(i64),
    #[error("empty address")]
    EmptyAddress,
    #[error("plant_ref {0} out of range")]
    PlantRefOutOfRange(i64),
    #[error("{0}")]
    UnknownPosition(String),
    #[error("negative timestamp {0}")]
    NegativeTimestamp(i64),
    #[error("empty plant name")]
    EmptyName,
    #[error("plant index {0} out of range")]
    BadIndex(i64),
    #[error("negative anchor {0}")]
    BadAnchor(i64),
    #[error("non-positive duration {0}")]
    BadDuration(i64),
}

impl From<sqlx::Error> for RecordError {
    fn from(e: sqlx::Error) -> Self {
        Self::Column(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub table: &'static str,
    /// Primary key of the row as stored, when readable.
    pub key: Option<i64>,
    pub reason: RecordError,
}

/// Everything restored at startup plus the rows that had to be dropped.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub devices: Vec<Device>,
    pub plants: Vec<Plant>,
    pub timer: Option<CycleTimer>,
    pub skipped: Vec<SkippedRecord>,
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn device_from_row(row: &SqliteRow) -> Result<Device, RecordError> {
    let id: i64 = row.try_get("id")?;
    let address: String = row.try_get("address")?;
    let plant_ref: i64 = row.try_get("plant_ref")?;
    let plant_name: String = row.try_get("plant_name")?;
    let position: String = row.try_get("position")?;
    let last_seen: i64 = row.try_get("last_seen")?;
    let command: String = row.try_get("command")?;

    let id = u64::try_from(id).map_err(|_| RecordError::NegativeId(id))?;
    if address.trim().is_empty() {
        return Err(RecordError::EmptyAddress);
    }
    let plant_ref =
        u32::try_from(plant_ref).map_err(|_| RecordError::PlantRefOutOfRange(plant_ref))?;
    let position = Position::from_str(&position).map_err(RecordError::UnknownPosition)?;
    if last_seen < 0 {
        return Err(RecordError::NegativeTimestamp(last_seen));
    }

    let mut device = Device {
        id,
        address,
        plant_ref,
        plant_name,
        position,
        last_seen,
        pending_command: command,
        seen_this_cycle: false,
    };

    // Half-assigned rows are treated as unassigned.
    if device.plant_ref == 0 || !device.position.is_assignable() {
        device.plant_ref = 0;
        device.position = Position::Unassigned;
        device.plant_name = UNASSIGNED_NAME.to_string();
    }
    if device.plant_name.trim().is_empty() {
        device.plant_name = UNASSIGNED_NAME.to_string();
    }
    if device.pending_command.trim().is_empty() {
        device.pending_command = NO_COMMAND.to_string();
    }
    Ok(device)
}

fn plant_from_row(row: &SqliteRow) -> Result<Plant, RecordError> {
    let index: i64 = row.try_get("plant_index")?;
    let name: String = row.try_get("name")?;
    let remaining_duration: i64 = row.try_get("remaining_duration")?;
    let configured_duration: i64 = row.try_get("configured_duration")?;

    let index = u32::try_from(index)
        .ok()
        .filter(|i| *i > 0)
        .ok_or(RecordError::BadIndex(index))?;
    if name.trim().is_empty() {
        return Err(RecordError::EmptyName);
    }

    Ok(Plant {
        index,
        name,
        remaining_duration,
        configured_duration,
    })
}

fn timer_from_row(row: &SqliteRow) -> Result<CycleTimer, RecordError> {
    let anchor: i64 = row.try_get("anchor")?;
    let duration: i64 = row.try_get("duration")?;
    if anchor < 0 {
        return Err(RecordError::BadAnchor(anchor));
    }
    if duration <= 0 {
        return Err(RecordError::BadDuration(duration));
    }
    Ok(CycleTimer::with_anchor(anchor, duration))
}

fn row_key(row: &SqliteRow, column: &str) -> Option<i64> {
    row.try_get::<i64, _>(column).ok()
}

// ---------------------------------------------------------------------------
// Db
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/plant-monitor/hub.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Load
    // ----------------------------

    /// Read every table. Malformed rows are skipped and listed in the
    /// report; only I/O failures are errors.
    pub async fn load_state(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        let rows = sqlx::query(
            "SELECT id, address, plant_ref, plant_name, position, last_seen, command
             FROM devices ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load devices failed")?;
        for row in &rows {
            match device_from_row(row) {
                Ok(d) => report.devices.push(d),
                Err(reason) => report.skipped.push(SkippedRecord {
                    table: "devices",
                    key: row_key(row, "id"),
                    reason,
                }),
            }
        }

        let rows = sqlx::query(
            "SELECT plant_index, name, remaining_duration, configured_duration
             FROM plants ORDER BY plant_index",
        )
        .fetch_all(&self.pool)
        .await
        .context("load plants failed")?;
        for row in &rows {
            match plant_from_row(row) {
                Ok(p) => report.plants.push(p),
                Err(reason) => report.skipped.push(SkippedRecord {
                    table: "plants",
                    key: row_key(row, "plant_index"),
                    reason,
                }),
            }
        }

        let row = sqlx::query("SELECT anchor, duration FROM cycle_timer WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("load cycle_timer failed")?;
        if let Some(row) = row {
            match timer_from_row(&row) {
                Ok(t) => report.timer = Some(t),
                Err(reason) => report.skipped.push(SkippedRecord {
                    table: "cycle_timer",
                    key: Some(1),
                    reason,
                }),
            }
        }

        Ok(report)
    }

    // ----------------------------
    // Save
    // ----------------------------

    /// Replace the whole device table in one transaction.
    pub async fn save_devices(&self, devices: &[Device]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("save_devices: begin failed")?;

        sqlx::query("DELETE FROM devices")
            .execute(&mut *tx)
            .await
            .context("save_devices: clear failed")?;

        for d in devices {
            let id = i64::try_from(d.id).with_context(|| format!("device id {} overflows", d.id))?;
            sqlx::query(
                "INSERT INTO devices (id, address, plant_ref, plant_name, position, last_seen, command)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&d.address)
            .bind(i64::from(d.plant_ref))
            .bind(&d.plant_name)
            .bind(d.position.to_string())
            .bind(d.last_seen)
            .bind(&d.pending_command)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("save_devices: insert {} failed", d.id))?;
        }

        tx.commit().await.context("save_devices: commit failed")?;
        Ok(())
    }

    /// Replace the plant table in one transaction.
    pub async fn save_plants(&self, plants: &[Plant]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("save_plants: begin failed")?;

        sqlx::query("DELETE FROM plants")
            .execute(&mut *tx)
            .await
            .context("save_plants: clear failed")?;

        for p in plants {
            sqlx::query(
                "INSERT INTO plants (plant_index, name, remaining_duration, configured_duration)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(i64::from(p.index))
            .bind(&p.name)
            .bind(p.remaining_duration)
            .bind(p.configured_duration)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("save_plants: insert {} failed", p.index))?;
        }

        tx.commit().await.context("save_plants: commit failed")?;
        Ok(())
    }

    pub async fn save_timer(&self, timer: &CycleTimer) -> Result<()> {
        sqlx::query(
            "INSERT INTO cycle_timer (id, anchor, duration) VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET anchor = excluded.anchor, duration = excluded.duration",
        )
        .bind(timer.anchor)
        .bind(timer.duration)
        .execute(&self.pool)
        .await
        .context("save_timer failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
