use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{Error, Result};

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct Image {
    pub id: Uuid,
    pub reference: String,
    pub kernel_path: String,
    pub rootfs_path: String,
    pub size_bytes: Option<i64>,
    pub pulled_at: DateTime<Utc>,
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Image> {
    sqlx::query_as::<_, Image>("SELECT * FROM images WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("image {id}")))
}
