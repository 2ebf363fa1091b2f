use sqlx::SqlitePool;
use tracing::{info, instrument};

use super::StoreError;

const SCHEMA_VERSION: i64 = 1;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    let current = current.unwrap_or(0);

    if current > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }
    if current == SCHEMA_VERSION {
        info!(version = current, "database schema is up to date");
        return Ok(());
    }

    info!(from = current, to = SCHEMA_VERSION, "migrating database");
    if current < 1 {
        migrate_to_v1(pool).await?;
    }
    Ok(())
}

const V1: &[&str] = &[
    r#"
    CREATE TABLE vendors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE operating_systems (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        version TEXT NOT NULL DEFAULT '',
        UNIQUE (name, version)
    )
    "#,
    r#"
    CREATE TABLE devices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        vendor_id INTEGER NOT NULL REFERENCES vendors(id) ON DELETE RESTRICT,
        operating_system_id INTEGER NOT NULL REFERENCES operating_systems(id) ON DELETE RESTRICT,
        hostname TEXT NOT NULL UNIQUE,
        serial TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE device_states (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
        device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE RESTRICT,
        success INTEGER NOT NULL,
        management_ip TEXT,
        UNIQUE (snapshot_id, device_id)
    )
    "#,
    r#"
    CREATE TABLE interfaces (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE RESTRICT,
        name TEXT NOT NULL,
        mac TEXT,
        UNIQUE (device_id, name)
    )
    "#,
    r#"
    CREATE TABLE interface_states (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        interface_id INTEGER NOT NULL REFERENCES interfaces(id) ON DELETE RESTRICT,
        device_state_id INTEGER NOT NULL REFERENCES device_states(id) ON DELETE CASCADE,
        up INTEGER NOT NULL,
        ip TEXT,
        mtu INTEGER NOT NULL,
        bandwidth INTEGER NOT NULL,
        UNIQUE (interface_id, device_state_id)
    )
    "#,
    "CREATE INDEX idx_device_states_snapshot ON device_states(snapshot_id)",
    "CREATE INDEX idx_interface_states_device_state ON interface_states(device_state_id)",
];

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<(), StoreError> {
    info!("running migration to schema version 1");
    let mut tx = pool.begin().await?;
    for statement in V1 {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query("DELETE FROM schema_version")
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(1_i64)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
