use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use strum_macros::{Display, EnumString};
use uuid::Uuid;
use validator::Validate;

use crate::errors::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VmStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Vm {
    pub id: Uuid,
    pub name: String,
    pub status: VmStatus,
    pub vcpus: i32,
    pub memory_mib: i32,
    pub image_id: Uuid,
    pub pid: Option<i32>,
    pub socket_path: Option<String>,
    pub tap_device: Option<String>,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Vm {
    fn from_row(row: &sqlx::postgres::PgRow) -> sqlx::Result<Self> {
        use sqlx::Row;
        Ok(Vm {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: row
                .try_get::<String, _>("status")?
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(std::io::Error::other(format!("{e}")))))?,
            vcpus: row.try_get("vcpus")?,
            memory_mib: row.try_get("memory_mib")?,
            image_id: row.try_get("image_id")?,
            pid: row.try_get("pid")?,
            socket_path: row.try_get("socket_path")?,
            tap_device: row.try_get("tap_device")?,
            mac_address: row.try_get("mac_address")?,
            ip_address: row.try_get("ip_address")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Deserialize, Debug, Validate)]
pub struct NewVm {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(range(min = 1, max = 64))]
    pub vcpus: Option<i32>,
    #[validate(range(min = 128))]
    pub memory_mib: Option<i32>,
    pub image_id: Uuid,
}

/// Runtime network+process triple assigned when a VM transitions to `running`.
pub struct RunningInfo {
    pub pid: i32,
    pub socket_path: String,
    pub tap_device: String,
    pub mac_address: String,
    pub ip_address: String,
}

pub async fn list(pool: &PgPool) -> Result<Vec<Vm>> {
    Ok(sqlx::query_as::<_, Vm>("SELECT * FROM vms ORDER BY created_at")
        .fetch_all(pool)
        .await?)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Vm> {
    sqlx::query_as::<_, Vm>("SELECT * FROM vms WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("vm {id}")))
}

pub async fn list_by_status(pool: &PgPool, status: VmStatus) -> Result<Vec<Vm>> {
    Ok(
        sqlx::query_as::<_, Vm>("SELECT * FROM vms WHERE status = $1")
            .bind(status.to_string())
            .fetch_all(pool)
            .await?,
    )
}

/// Inserts the row as `creating`, then immediately flips it to `stopped` once
/// visible, per the creation contract: no host resources are touched here.
pub async fn create(pool: &PgPool, new: &NewVm) -> Result<Vm> {
    let id = Uuid::new_v4();
    let vcpus = new.vcpus.unwrap_or(1);
    let memory_mib = new.memory_mib.unwrap_or(512);

    let inserted = sqlx::query(
        r#"
        INSERT INTO vms (id, name, status, vcpus, memory_mib, image_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(&new.name)
    .bind(VmStatus::Creating.to_string())
    .bind(vcpus)
    .bind(memory_mib)
    .bind(new.image_id)
    .execute(pool)
    .await;

    if let Err(sqlx::Error::Database(db_err)) = &inserted {
        if db_err.is_unique_violation() {
            return Err(Error::Conflict(format!(
                "a vm named '{}' already exists",
                new.name
            )));
        }
    }
    inserted?;

    sqlx::query("UPDATE vms SET status = $1, updated_at = now() WHERE id = $2")
        .bind(VmStatus::Stopped.to_string())
        .bind(id)
        .execute(pool)
        .await?;

    get(pool, id).await
}

pub async fn delete(pool: &PgPool, id: Uuid) -> Result<()> {
    let vm = get(pool, id).await?;
    if vm.status == VmStatus::Running {
        return Err(Error::Conflict(format!("vm {id} is running")));
    }
    sqlx::query("DELETE FROM vms WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_running(pool: &PgPool, id: Uuid, info: &RunningInfo) -> Result<Vm> {
    sqlx::query(
        r#"
        UPDATE vms SET
            status = $1,
            pid = $2,
            socket_path = $3,
            tap_device = $4,
            mac_address = $5,
            ip_address = $6,
            error_message = NULL,
            updated_at = now()
        WHERE id = $7
        "#,
    )
    .bind(VmStatus::Running.to_string())
    .bind(info.pid)
    .bind(&info.socket_path)
    .bind(&info.tap_device)
    .bind(&info.mac_address)
    .bind(&info.ip_address)
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, id).await
}

/// Clears all runtime fields and sets `status`. Used by both the normal stop
/// path and the watchdog's dead-process reconciliation.
pub async fn clear_runtime(pool: &PgPool, id: Uuid, status: VmStatus) -> Result<Vm> {
    sqlx::query(
        r#"
        UPDATE vms SET
            status = $1,
            pid = NULL,
            socket_path = NULL,
            tap_device = NULL,
            mac_address = NULL,
            ip_address = NULL,
            updated_at = now()
        WHERE id = $2
        "#,
    )
    .bind(status.to_string())
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, id).await
}

pub async fn mark_error(pool: &PgPool, id: Uuid, message: &str) -> Result<Vm> {
    sqlx::query(
        r#"
        UPDATE vms SET
            status = $1,
            pid = NULL,
            socket_path = NULL,
            tap_device = NULL,
            mac_address = NULL,
            ip_address = NULL,
            error_message = $2,
            updated_at = now()
        WHERE id = $3
        "#,
    )
    .bind(VmStatus::Error.to_string())
    .bind(message)
    .bind(id)
    .execute(pool)
    .await?;

    get(pool, id).await
}

/// Conditionally reconciles a `running` row whose process has died, without
/// taking the lifecycle mutex. `last_observed` is the `updated_at` the
/// watchdog read moments ago; requiring an exact match means a concurrent
/// legitimate `stop`/`start` (which always bumps `updated_at`) wins the race
/// instead of being clobbered by this update.
pub async fn reconcile_dead(pool: &PgPool, id: Uuid, last_observed: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE vms SET
            status = $1,
            pid = NULL,
            socket_path = NULL,
            tap_device = NULL,
            mac_address = NULL,
            ip_address = NULL,
            error_message = 'vmm process exited unexpectedly',
            updated_at = now()
        WHERE id = $2 AND status = $3 AND updated_at = $4
        "#,
    )
    .bind(VmStatus::Stopped.to_string())
    .bind(id)
    .bind(VmStatus::Running.to_string())
    .bind(last_observed)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Conditionally times out a `creating` row whose `updated_at` is still
/// older than `deadline` (a cutoff computed by the caller, not the row's own
/// timestamp) — so a row that was legitimately touched in between is left
/// alone.
pub async fn reconcile_stalled_creation(
    pool: &PgPool,
    id: Uuid,
    deadline: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE vms SET
            status = $1,
            error_message = 'vm creation timed out',
            updated_at = now()
        WHERE id = $2 AND status = $3 AND updated_at < $4
        "#,
    )
    .bind(VmStatus::Error.to_string())
    .bind(id)
    .bind(VmStatus::Creating.to_string())
    .bind(deadline)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
