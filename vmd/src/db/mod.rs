pub mod images;
pub mod vms;

/// Runs the crate's embedded migrations against `connection_string`.
///
/// Mirrors the startup sequence of this family's other control-plane
/// binaries: migrations run once, synchronously, before the listener binds.
pub async fn run_migrations(connection_string: &str) -> Result<(), sqlx::Error> {
    let pool = sqlx::PgPool::connect(connection_string).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(())
}
