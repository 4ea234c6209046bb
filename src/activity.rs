use anyhow::{Context, Result};
use sqlx::PgPool;

pub const NIVEL_INFO: &str = "info";
pub const NIVEL_WARN: &str = "warn";

/// Records a domain-level activity entry (publication created, account
/// approved/rejected). Failures are surfaced to the caller, who decides
/// whether the entry is best-effort.
pub async fn log_activity(
    pool: &PgPool,
    usuario_id: Option<i64>,
    nivel: &str,
    mensaje: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO activity_log (usuario_id, nivel, mensaje) VALUES ($1, $2, $3)")
        .bind(usuario_id)
        .bind(nivel)
        .bind(mensaje)
        .execute(pool)
        .await
        .context("failed to insert activity log entry")?;

    Ok(())
}
