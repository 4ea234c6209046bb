use axum::{
    Json,
    extract::{Form, Query, State},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    activity::{self, NIVEL_WARN},
    web::{ApiError, ApiMessage, AppState, auth::require_admin, sessions::SessionUser},
};

#[derive(Deserialize)]
pub struct AdminUsersQuery {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    user_id: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct AdminUserForm {
    #[serde(default)]
    user_id: Option<i64>,
}

#[derive(sqlx::FromRow, Serialize)]
struct PendingUserRow {
    id: i64,
    nombre_completo: String,
    email: String,
    institucion: String,
    afiliacion: String,
    created_at: DateTime<Utc>,
    rol_nombre: Option<String>,
}

#[derive(sqlx::FromRow, Serialize)]
struct UserRow {
    id: i64,
    nombre_completo: String,
    email: String,
    institucion: String,
    afiliacion: String,
    estado: String,
    created_at: DateTime<Utc>,
    ultimo_acceso: Option<DateTime<Utc>>,
    rol_nombre: Option<String>,
}

#[derive(Serialize)]
struct UsersResponse<T: Serialize> {
    success: bool,
    users: Vec<T>,
}

pub async fn dispatch_get(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<AdminUsersQuery>,
) -> Result<Response, ApiError> {
    // Every moderation action requires the admin role, list or mutation alike.
    require_admin(&state, &jar).await?;

    match query.action.as_deref().unwrap_or("") {
        "get_pending" => get_pending(&state).await.map(IntoResponse::into_response),
        "get_all" => get_all(&state).await.map(IntoResponse::into_response),
        _ => Ok(Json(ApiMessage::fail("Acción no válida")).into_response()),
    }
}

pub async fn dispatch_post(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<AdminUsersQuery>,
    form: Option<Form<AdminUserForm>>,
) -> Result<Response, ApiError> {
    let admin = require_admin(&state, &jar).await?;

    let form = form.map(|Form(form)| form).unwrap_or_default();
    let user_id = form.user_id.or(query.user_id);

    match query.action.as_deref().unwrap_or("") {
        "approve" => approve(&state, &admin, user_id).await.map(IntoResponse::into_response),
        "reject" => reject(&state, &admin, user_id).await.map(IntoResponse::into_response),
        _ => Ok(Json(ApiMessage::fail("Acción no válida")).into_response()),
    }
}

async fn get_pending(state: &AppState) -> Result<Json<UsersResponse<PendingUserRow>>, ApiError> {
    let users = sqlx::query_as::<_, PendingUserRow>(
        "SELECT u.id, u.nombre_completo, u.email, u.institucion, u.afiliacion,
                u.created_at, r.nombre AS rol_nombre
         FROM usuarios u
         LEFT JOIN roles r ON r.id = u.rol_id
         WHERE u.estado = 'pendiente'
         ORDER BY u.created_at DESC",
    )
    .fetch_all(state.pool_ref())
    .await?;

    Ok(Json(UsersResponse {
        success: true,
        users,
    }))
}

async fn get_all(state: &AppState) -> Result<Json<UsersResponse<UserRow>>, ApiError> {
    let users = sqlx::query_as::<_, UserRow>(
        "SELECT u.id, u.nombre_completo, u.email, u.institucion, u.afiliacion,
                u.estado, u.created_at, u.ultimo_acceso, r.nombre AS rol_nombre
         FROM usuarios u
         LEFT JOIN roles r ON r.id = u.rol_id
         ORDER BY u.created_at DESC",
    )
    .fetch_all(state.pool_ref())
    .await?;

    Ok(Json(UsersResponse {
        success: true,
        users,
    }))
}

async fn approve(
    state: &AppState,
    admin: &SessionUser,
    user_id: Option<i64>,
) -> Result<Json<ApiMessage>, ApiError> {
    let user_id = user_id.ok_or_else(|| ApiError::validation("ID de usuario requerido"))?;

    // Re-applying the update on an already-active account is a no-op by
    // design: approval is idempotent.
    let result = sqlx::query("UPDATE usuarios SET estado = 'activo' WHERE id = $1")
        .bind(user_id)
        .execute(state.pool_ref())
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Usuario no encontrado"));
    }

    let mensaje = format!("Usuario aprobado (ID: {user_id})");
    if let Err(err) =
        activity::log_activity(state.pool_ref(), Some(admin.id), activity::NIVEL_INFO, &mensaje).await
    {
        warn!(?err, user_id, "failed to record approval activity");
    }

    Ok(Json(ApiMessage::ok("Usuario aprobado exitosamente")))
}

async fn reject(
    state: &AppState,
    admin: &SessionUser,
    user_id: Option<i64>,
) -> Result<Json<ApiMessage>, ApiError> {
    let user_id = user_id.ok_or_else(|| ApiError::validation("ID de usuario requerido"))?;

    // Rejection deletes the account outright; the activity entry is the only
    // remaining trace, so it is written before reporting success.
    let result = sqlx::query("DELETE FROM usuarios WHERE id = $1")
        .bind(user_id)
        .execute(state.pool_ref())
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Usuario no encontrado"));
    }

    let mensaje = format!("Usuario rechazado y eliminado (ID: {user_id})");
    if let Err(err) =
        activity::log_activity(state.pool_ref(), Some(admin.id), NIVEL_WARN, &mensaje).await
    {
        warn!(?err, user_id, "failed to record rejection activity");
    }

    Ok(Json(ApiMessage::ok("Usuario rechazado exitosamente")))
}
