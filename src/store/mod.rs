//! Snapshot history in SQLite.
//!
//! Identity rows (vendors, operating systems, devices, interfaces) are written
//! once per key and shared by every snapshot; state rows (device_states,
//! interface_states) belong to exactly one snapshot and go away with it.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::model::{
    parse_mac, parse_optional_prefix, Device, Interface, Snapshot, SnapshotId, SnapshotRecord,
};

pub mod migrations;


#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("database path {0} is not valid UTF-8")]
    Path(String),
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
    #[error("corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| StoreError::Path(path.display().to_string()))?;
        let options = SqliteConnectOptions::new()
            .filename(path_str)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// A private database living as long as the store; used by tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Every connection would get its own empty database, so keep exactly one forever.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, StoreError> {
        migrations::run(&pool).await?;
        info!("snapshot store ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persists the whole snapshot in one transaction and returns its new id.
    /// Any failure leaves the database untouched.
    #[instrument(skip(self, snapshot), fields(devices = snapshot.devices.len()))]
    pub async fn store(&self, snapshot: &Snapshot) -> Result<SnapshotId, StoreError> {
        let mut tx = self.pool.begin().await?;

        let snapshot_id = sqlx::query("INSERT INTO snapshots (timestamp) VALUES (?)")
            .bind(snapshot.timestamp.timestamp_micros())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for device in &snapshot.devices {
            let device_id = upsert_device(&mut *tx, device).await?;
            let device_state_id = sqlx::query(
                r#"
                INSERT INTO device_states (snapshot_id, device_id, success, management_ip)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(snapshot_id)
            .bind(device_id)
            .bind(device.snapshot_successful)
            .bind(device.management_ip.map(|p| p.to_string()))
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            for iface in &device.interfaces {
                let interface_id = upsert_interface(&mut *tx, device_id, iface).await?;
                sqlx::query(
                    r#"
                    INSERT INTO interface_states
                        (interface_id, device_state_id, up, ip, mtu, bandwidth)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(interface_id)
                .bind(device_state_id)
                .bind(iface.up)
                .bind(iface.ip.map(|p| p.to_string()))
                .bind(iface.mtu)
                .bind(iface.bandwidth)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(snapshot_id, "snapshot stored");
        Ok(snapshot_id)
    }

    /// The `n` most recent snapshots, newest first.
    #[instrument(skip(self))]
    pub async fn get_n_timestamps(&self, n: u32) -> Result<Vec<SnapshotRecord>, StoreError> {
        let rows = sqlx::query("SELECT id, timestamp FROM snapshots ORDER BY timestamp DESC LIMIT ?")
            .bind(i64::from(n))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(SnapshotRecord {
                    id: row.try_get("id")?,
                    timestamp: micros_to_datetime(row.try_get("timestamp")?)?,
                })
            })
            .collect()
    }

    /// Rebuilds a stored snapshot; an unknown id yields `Snapshot::default()`.
    #[instrument(skip(self))]
    pub async fn get_snapshot(&self, id: SnapshotId) -> Result<Snapshot, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query("SELECT id, timestamp FROM snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(Snapshot::default());
        };
        let timestamp = micros_to_datetime(row.try_get("timestamp")?)?;

        let interface_rows = sqlx::query(
            r#"
            SELECT ist.device_state_id, i.name, i.mac, ist.up, ist.ip, ist.mtu, ist.bandwidth
            FROM interface_states ist
            JOIN interfaces i ON i.id = ist.interface_id
            JOIN device_states ds ON ds.id = ist.device_state_id
            WHERE ds.snapshot_id = ?
            ORDER BY ist.id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let mut interfaces: HashMap<i64, Vec<Interface>> = HashMap::new();
        for row in &interface_rows {
            let device_state_id: i64 = row.try_get("device_state_id")?;
            interfaces
                .entry(device_state_id)
                .or_default()
                .push(row_to_interface(row)?);
        }

        let device_rows = sqlx::query(
            r#"
            SELECT ds.id AS state_id, ds.success, ds.management_ip,
                   d.hostname, d.serial,
                   v.name AS vendor, os.name AS os_name, os.version AS os_version
            FROM device_states ds
            JOIN devices d ON d.id = ds.device_id
            JOIN vendors v ON v.id = d.vendor_id
            JOIN operating_systems os ON os.id = d.operating_system_id
            WHERE ds.snapshot_id = ?
            ORDER BY d.id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut devices = Vec::with_capacity(device_rows.len());
        for row in &device_rows {
            let state_id: i64 = row.try_get("state_id")?;
            let mut device = row_to_device(row)?;
            device.interfaces = interfaces.remove(&state_id).unwrap_or_default();
            devices.push(device);
        }

        Ok(Snapshot {
            id: Some(id),
            timestamp,
            devices,
        })
    }

    /// Removes the snapshot and its state rows; identity rows stay. Deleting an
    /// unknown id is not an error.
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, id: SnapshotId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!(deleted = result.rows_affected(), "snapshot delete");
        Ok(())
    }
}

async fn upsert_vendor(conn: &mut SqliteConnection, name: &str) -> Result<i64, StoreError> {
    sqlx::query("INSERT INTO vendors (name) VALUES (?) ON CONFLICT (name) DO NOTHING")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    let id = sqlx::query_scalar("SELECT id FROM vendors WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

async fn upsert_operating_system(
    conn: &mut SqliteConnection,
    name: &str,
    version: &str,
) -> Result<i64, StoreError> {
    sqlx::query(
        "INSERT INTO operating_systems (name, version) VALUES (?, ?) \
         ON CONFLICT (name, version) DO NOTHING",
    )
    .bind(name)
    .bind(version)
    .execute(&mut *conn)
    .await?;
    let id = sqlx::query_scalar("SELECT id FROM operating_systems WHERE name = ? AND version = ?")
        .bind(name)
        .bind(version)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

/// Inserts the device identity if its hostname is new. An existing identity is
/// only refreshed from a successful probe, never from an unreachable stub.
async fn upsert_device(conn: &mut SqliteConnection, device: &Device) -> Result<i64, StoreError> {
    let vendor_id = upsert_vendor(conn, &device.vendor).await?;
    let os_id = upsert_operating_system(conn, &device.os_name, &device.os_version).await?;

    sqlx::query(
        "INSERT INTO devices (vendor_id, operating_system_id, hostname, serial) VALUES (?, ?, ?, ?) \
         ON CONFLICT (hostname) DO NOTHING",
    )
    .bind(vendor_id)
    .bind(os_id)
    .bind(&device.hostname)
    .bind(&device.serial)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(
        "SELECT id, vendor_id, operating_system_id, serial FROM devices WHERE hostname = ?",
    )
    .bind(&device.hostname)
    .fetch_one(&mut *conn)
    .await?;
    let id: i64 = row.try_get("id")?;

    let stale = row.try_get::<i64, _>("vendor_id")? != vendor_id
        || row.try_get::<i64, _>("operating_system_id")? != os_id
        || row.try_get::<String, _>("serial")? != device.serial;
    if device.snapshot_successful && stale {
        sqlx::query(
            "UPDATE devices SET vendor_id = ?, operating_system_id = ?, serial = ? WHERE id = ?",
        )
        .bind(vendor_id)
        .bind(os_id)
        .bind(&device.serial)
        .bind(id)
        .execute(&mut *conn)
        .await?;
        debug!(hostname = %device.hostname, "device identity refreshed");
    }
    Ok(id)
}

async fn upsert_interface(
    conn: &mut SqliteConnection,
    device_id: i64,
    iface: &Interface,
) -> Result<i64, StoreError> {
    let mac = iface.mac.map(|m| m.to_string());
    sqlx::query(
        "INSERT INTO interfaces (device_id, name, mac) VALUES (?, ?, ?) \
         ON CONFLICT (device_id, name) DO UPDATE SET mac = COALESCE(interfaces.mac, excluded.mac)",
    )
    .bind(device_id)
    .bind(&iface.name)
    .bind(mac)
    .execute(&mut *conn)
    .await?;
    let id = sqlx::query_scalar("SELECT id FROM interfaces WHERE device_id = ? AND name = ?")
        .bind(device_id)
        .bind(&iface.name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StoreError::Corrupt {
        table: "snapshots",
        reason: format!("timestamp {micros} out of range"),
    })
}

fn row_to_device(row: &SqliteRow) -> Result<Device, StoreError> {
    let management_ip: Option<String> = row.try_get("management_ip")?;
    let management_ip = match management_ip {
        Some(text) => parse_optional_prefix(&text).map_err(|err| StoreError::Corrupt {
            table: "device_states",
            reason: err.to_string(),
        })?,
        None => None,
    };

    Ok(Device {
        hostname: row.try_get("hostname")?,
        vendor: row.try_get("vendor")?,
        os_name: row.try_get("os_name")?,
        os_version: row.try_get("os_version")?,
        serial: row.try_get("serial")?,
        management_ip,
        snapshot_successful: row.try_get("success")?,
        interfaces: Vec::new(),
    })
}

fn row_to_interface(row: &SqliteRow) -> Result<Interface, StoreError> {
    let mac = match row.try_get::<Option<String>, _>("mac")? {
        Some(text) => Some(parse_mac(&text).ok_or_else(|| StoreError::Corrupt {
            table: "interfaces",
            reason: format!("invalid MAC '{text}'"),
        })?),
        None => None,
    };
    // Addresses stored without a prefix length read back as absent.
    let ip = match row.try_get::<Option<String>, _>("ip")? {
        Some(text) => parse_optional_prefix(&text).map_err(|err| StoreError::Corrupt {
            table: "interface_states",
            reason: err.to_string(),
        })?,
        None => None,
    };

    Ok(Interface {
        name: row.try_get("name")?,
        mac,
        ip,
        up: row.try_get("up")?,
        mtu: row.try_get("mtu")?,
        bandwidth: row.try_get("bandwidth")?,
    })
}
