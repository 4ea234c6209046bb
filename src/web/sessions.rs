use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "session_token";
pub const SESSION_TTL_DAYS: i64 = 7;

/// Authenticated caller attached to a live session.
#[derive(Clone, sqlx::FromRow)]
pub struct SessionUser {
    pub id: i64,
    pub nombre_completo: String,
    pub email: String,
    pub rol: String,
    pub estado: String,
}

impl SessionUser {
    pub fn is_admin(&self) -> bool {
        self.rol == "admin"
    }

    pub fn is_investigador(&self) -> bool {
        self.rol == "investigador" || self.rol == "admin"
    }
}

/// Store-backed session state keyed by an opaque token. Handlers go through
/// this interface instead of any process-wide session global.
#[derive(Clone)]
pub struct SessionStore {
    pool: PgPool,
}

impl SessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, usuario_id: i64) -> sqlx::Result<Uuid> {
        let token = Uuid::new_v4();
        let expires_at = Utc::now() + ChronoDuration::days(SESSION_TTL_DAYS);

        sqlx::query("INSERT INTO sesiones (token, usuario_id, expires_at) VALUES ($1, $2, $3)")
            .bind(token)
            .bind(usuario_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;

        Ok(token)
    }

    pub async fn get(&self, token: Uuid) -> sqlx::Result<Option<SessionUser>> {
        sqlx::query_as::<_, SessionUser>(
            "SELECT u.id, u.nombre_completo, u.email, r.nombre AS rol, u.estado
             FROM sesiones s
             JOIN usuarios u ON u.id = s.usuario_id
             JOIN roles r ON r.id = u.rol_id
             WHERE s.token = $1 AND s.expires_at > NOW()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn delete(&self, token: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM sesiones WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops expired rows; called once at startup so stale sessions do not
    /// accumulate between deploys.
    pub async fn purge_expired(&self) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM sesiones WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
