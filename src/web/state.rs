use std::{env, sync::Arc};

use anyhow::{Context, Result, anyhow};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    config::AiSettings,
    llm::LlmClient,
    web::sessions::SessionStore,
};

#[derive(Clone)]
pub struct AppState {
    pool: PgPool,
    settings: Arc<RwLock<AiSettings>>,
    llm: LlmClient,
    sessions: SessionStore,
}

impl AppState {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL env var is missing")?;

        let llm = LlmClient::from_env().context("failed to initialize LLM client")?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        AiSettings::ensure_defaults(&pool)
            .await
            .context("failed to seed default AI settings")?;
        let settings = AiSettings::load(&pool)
            .await
            .context("failed to load AI settings")?;

        let sessions = SessionStore::new(pool.clone());
        match sessions.purge_expired().await {
            Ok(purged) if purged > 0 => info!(purged, "removed expired sessions"),
            Ok(_) => {}
            Err(err) => warn!(?err, "failed to purge expired sessions"),
        }

        Ok(Self {
            pool,
            settings: Arc::new(RwLock::new(settings)),
            llm,
            sessions,
        })
    }

    /// Seeds an administrator account when none exists so moderation is
    /// reachable on a fresh database. Credentials come from the environment.
    pub async fn ensure_seed_admin(&self) -> Result<()> {
        let has_admin: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM usuarios u JOIN roles r ON r.id = u.rol_id WHERE r.nombre = 'admin')",
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to verify admin presence")?;

        if has_admin {
            return Ok(());
        }

        let email = env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@plataforma.local".to_string());
        let password = env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "change-me".to_string());

        let password_hash = crate::web::auth::hash_password(&password)
            .map_err(|err| anyhow!("failed to hash seed admin password: {err}"))?;

        sqlx::query(
            "INSERT INTO usuarios (nombre_completo, email, password_hash, rol_id, estado)
             VALUES ($1, $2, $3, 3, 'activo')",
        )
        .bind("Administrador")
        .bind(&email)
        .bind(password_hash)
        .execute(&self.pool)
        .await
        .context("failed to insert seed admin user")?;

        info!(%email, "Seeded default admin user. Update its password promptly.");

        Ok(())
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn pool_ref(&self) -> &PgPool {
        &self.pool
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn llm_client(&self) -> LlmClient {
        self.llm.clone()
    }

    pub async fn ai_settings(&self) -> AiSettings {
        self.settings.read().await.clone()
    }
}
