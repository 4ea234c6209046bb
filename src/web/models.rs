use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Full user row as read for login/verification, role name already joined.
#[derive(Clone, FromRow)]
pub struct UsuarioRow {
    pub id: i64,
    pub nombre_completo: String,
    pub email: String,
    pub password_hash: String,
    pub institucion: String,
    pub afiliacion: String,
    pub foto_perfil: Option<String>,
    pub estado: String,
    pub rol: String,
    pub created_at: DateTime<Utc>,
    pub ultimo_acceso: Option<DateTime<Utc>>,
}

/// Wire view of a user. Field names are the JSON contract consumed by the
/// static frontend (`usuario.nombre`, `usuario.rol`, ...).
#[derive(Clone, Serialize)]
pub struct UsuarioView {
    pub id: i64,
    pub nombre: String,
    pub email: String,
    pub rol: String,
    pub institucion: String,
    pub afiliacion: String,
    pub estado: String,
    pub fecha_creacion: DateTime<Utc>,
    pub ultimo_acceso: Option<DateTime<Utc>>,
    pub foto_perfil: Option<String>,
}

impl From<UsuarioRow> for UsuarioView {
    fn from(row: UsuarioRow) -> Self {
        Self {
            id: row.id,
            nombre: row.nombre_completo,
            email: row.email,
            rol: row.rol,
            institucion: row.institucion,
            afiliacion: row.afiliacion,
            estado: row.estado,
            fecha_creacion: row.created_at,
            ultimo_acceso: row.ultimo_acceso,
            foto_perfil: row.foto_perfil,
        }
    }
}

/// Search result row shared by the filtered search and the AI search paths.
/// `score` only exists on the full-text branch and is omitted otherwise.
#[derive(Clone, FromRow, Serialize)]
pub struct ArticuloSearchRow {
    pub id: i64,
    pub titulo: String,
    pub autor: String,
    pub resumen: String,
    pub contenido: String,
    pub url_documento: Option<String>,
    pub fecha_publicacion: NaiveDate,
    pub categoria_id: i32,
    pub relevancia_score: f64,
    pub vistas: i64,
    pub descargas: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub categoria_nombre: Option<String>,
    pub keywords: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}
