use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use axum::{
    Json,
    extract::{Form, Query, State},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use cookie::time::Duration as CookieDuration;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use crate::web::{
    ApiError, ApiMessage, AppState,
    models::{UsuarioRow, UsuarioView},
    sessions::{SESSION_COOKIE, SESSION_TTL_DAYS, SessionUser},
};

const MIN_PASSWORD_CHARS: usize = 6;

#[derive(Deserialize)]
pub struct AuthQuery {
    #[serde(default)]
    pub action: Option<String>,
}

/// Single form type for the auth endpoint; required fields are checked per
/// action, mirroring the original form contract.
#[derive(Deserialize, Default)]
pub struct AuthForm {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_confirm: Option<String>,
    #[serde(default)]
    pub nombre_completo: Option<String>,
    #[serde(default)]
    pub institucion: Option<String>,
    #[serde(default)]
    pub afiliacion: Option<String>,
    #[serde(default)]
    pub rol: Option<String>,
}

#[derive(Serialize)]
struct LoginResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usuario: Option<UsuarioView>,
}

#[derive(Serialize)]
struct RegistroResponse {
    success: bool,
    message: String,
    usuario_id: i64,
    requiere_aprobacion: bool,
}

#[derive(Serialize)]
struct VerificarResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usuario: Option<UsuarioView>,
}

pub async fn auth_get(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<AuthQuery>,
) -> Result<Response, ApiError> {
    match query.action.as_deref().unwrap_or("") {
        "verificar" => verificar(&state, &jar).await.map(IntoResponse::into_response),
        "logout" => logout(&state, jar).await.map(IntoResponse::into_response),
        _ => Ok(Json(ApiMessage::fail("Acción no válida")).into_response()),
    }
}

pub async fn auth_post(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<AuthQuery>,
    form: Option<Form<AuthForm>>,
) -> Result<Response, ApiError> {
    let form = form.map(|Form(form)| form).unwrap_or_default();

    match query.action.as_deref().unwrap_or("") {
        "login" => login(&state, jar, form).await.map(IntoResponse::into_response),
        "registrar" => registrar(&state, form).await.map(IntoResponse::into_response),
        _ => Ok(Json(ApiMessage::fail("Acción no válida")).into_response()),
    }
}

async fn login(
    state: &AppState,
    jar: CookieJar,
    form: AuthForm,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    let email = form.email.as_deref().unwrap_or("").trim();
    let password = form.password.as_deref().unwrap_or("");

    let Some(usuario) = fetch_usuario_by_email(state.pool_ref(), email).await? else {
        return Ok((jar, Json(login_failure("Email o contraseña incorrectos"))));
    };

    if !verify_password(password, &usuario.password_hash) {
        return Ok((jar, Json(login_failure("Email o contraseña incorrectos"))));
    }

    match usuario.estado.as_str() {
        "inactivo" => {
            return Ok((
                jar,
                Json(login_failure(
                    "Tu cuenta ha sido desactivada. Contacta al administrador.",
                )),
            ));
        }
        "pendiente" => {
            return Ok((
                jar,
                Json(login_failure("Tu cuenta está pendiente de aprobación.")),
            ));
        }
        _ => {}
    }

    let token = state.sessions().create(usuario.id).await?;

    sqlx::query("UPDATE usuarios SET ultimo_acceso = NOW() WHERE id = $1")
        .bind(usuario.id)
        .execute(state.pool_ref())
        .await?;

    let redirect = redirect_para_rol(&usuario.rol);
    let jar = jar.add(session_cookie(token));

    Ok((
        jar,
        Json(LoginResponse {
            success: true,
            message: "Inicio de sesión exitoso".to_string(),
            redirect: Some(redirect),
            usuario: Some(usuario.into()),
        }),
    ))
}

async fn registrar(state: &AppState, form: AuthForm) -> Result<Json<RegistroResponse>, ApiError> {
    let nombre = form.nombre_completo.as_deref().unwrap_or("").trim();
    let email = form.email.as_deref().unwrap_or("").trim().to_lowercase();
    let password = form.password.as_deref().unwrap_or("");
    let rol = form.rol.as_deref().unwrap_or("lector");

    validar_registro(nombre, &email, password, form.password_confirm.as_deref())
        .map_err(ApiError::validation)?;

    let ya_existe: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM usuarios WHERE email = $1)")
        .bind(&email)
        .fetch_one(state.pool_ref())
        .await?;
    if ya_existe {
        return Err(ApiError::validation("El email ya está registrado"));
    }

    let password_hash = hash_password(password).map_err(|err| {
        error!(?err, "failed to hash password during registration");
        anyhow::anyhow!("password hashing failed")
    })?;

    let (rol_id, estado) = rol_y_estado(rol);

    let insert = sqlx::query_scalar::<_, i64>(
        "INSERT INTO usuarios (nombre_completo, email, password_hash, institucion, afiliacion, rol_id, estado)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING id",
    )
    .bind(nombre)
    .bind(&email)
    .bind(password_hash)
    .bind(form.institucion.as_deref().unwrap_or("").trim())
    .bind(form.afiliacion.as_deref().unwrap_or("").trim())
    .bind(rol_id)
    .bind(estado)
    .fetch_one(state.pool_ref())
    .await;

    let usuario_id = match insert {
        Ok(id) => id,
        // Concurrent registration can slip past the existence probe; the
        // unique constraint reports it as a duplicate.
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
            return Err(ApiError::validation("El email ya está registrado"));
        }
        Err(err) => return Err(err.into()),
    };

    let requiere_aprobacion = estado == "pendiente";
    let message = if requiere_aprobacion {
        "Registro exitoso. Tu cuenta de investigador está pendiente de aprobación."
    } else {
        "Registro exitoso. Ya puedes iniciar sesión."
    };

    Ok(Json(RegistroResponse {
        success: true,
        message: message.to_string(),
        usuario_id,
        requiere_aprobacion,
    }))
}

async fn verificar(state: &AppState, jar: &CookieJar) -> Result<Json<VerificarResponse>, ApiError> {
    let Some(session) = session_from_jar(state, jar).await? else {
        return Ok(Json(VerificarResponse {
            success: false,
            message: Some("No hay sesión activa".to_string()),
            usuario: None,
        }));
    };

    let Some(usuario) = fetch_usuario_by_id(state.pool_ref(), session.id).await? else {
        return Ok(Json(VerificarResponse {
            success: false,
            message: Some("Usuario no encontrado".to_string()),
            usuario: None,
        }));
    };

    Ok(Json(VerificarResponse {
        success: true,
        message: None,
        usuario: Some(usuario.into()),
    }))
}

async fn logout(
    state: &AppState,
    jar: CookieJar,
) -> Result<(CookieJar, Json<ApiMessage>), ApiError> {
    let mut jar = jar;

    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if let Ok(token) = Uuid::parse_str(cookie.value()) {
            state.sessions().delete(token).await?;
        }
    }

    let mut removal = Cookie::new(SESSION_COOKIE, "");
    removal.set_path("/");
    removal.set_http_only(true);
    removal.set_same_site(SameSite::Lax);
    removal.set_max_age(CookieDuration::seconds(0));
    jar = jar.remove(removal);

    Ok((jar, Json(ApiMessage::ok("Sesión cerrada exitosamente"))))
}

/// Resolves the caller's session from the cookie jar, if any.
pub async fn session_from_jar(
    state: &AppState,
    jar: &CookieJar,
) -> Result<Option<SessionUser>, ApiError> {
    let Some(cookie) = jar.get(SESSION_COOKIE) else {
        return Ok(None);
    };
    let Ok(token) = Uuid::parse_str(cookie.value()) else {
        return Ok(None);
    };
    Ok(state.sessions().get(token).await?)
}

pub async fn require_user(state: &AppState, jar: &CookieJar) -> Result<SessionUser, ApiError> {
    match session_from_jar(state, jar).await? {
        Some(user) => Ok(user),
        None => Err(ApiError::Unauthorized(
            "No estás autenticado. Por favor inicia sesión.".to_string(),
        )),
    }
}

pub async fn require_investigador(
    state: &AppState,
    jar: &CookieJar,
) -> Result<SessionUser, ApiError> {
    let user = require_user(state, jar).await?;
    if !user.is_investigador() {
        return Err(ApiError::Forbidden(
            "Solo los investigadores pueden publicar artículos.".to_string(),
        ));
    }
    Ok(user)
}

pub async fn require_admin(state: &AppState, jar: &CookieJar) -> Result<SessionUser, ApiError> {
    let user = require_user(state, jar).await?;
    if !user.is_admin() {
        return Err(ApiError::Forbidden(
            "Acceso denegado. Necesitas privilegios de administrador.".to_string(),
        ));
    }
    Ok(user)
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(hash) => Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok(),
        Err(_) => false,
    }
}

async fn fetch_usuario_by_email(pool: &PgPool, email: &str) -> sqlx::Result<Option<UsuarioRow>> {
    sqlx::query_as::<_, UsuarioRow>(
        "SELECT u.id, u.nombre_completo, u.email, u.password_hash, u.institucion,
                u.afiliacion, u.foto_perfil, u.estado, r.nombre AS rol,
                u.created_at, u.ultimo_acceso
         FROM usuarios u
         JOIN roles r ON r.id = u.rol_id
         WHERE lower(u.email) = lower($1)",
    )
    .bind(email)
    .fetch_optional(pool)
    .await
}

async fn fetch_usuario_by_id(pool: &PgPool, id: i64) -> sqlx::Result<Option<UsuarioRow>> {
    sqlx::query_as::<_, UsuarioRow>(
        "SELECT u.id, u.nombre_completo, u.email, u.password_hash, u.institucion,
                u.afiliacion, u.foto_perfil, u.estado, r.nombre AS rol,
                u.created_at, u.ultimo_acceso
         FROM usuarios u
         JOIN roles r ON r.id = u.rol_id
         WHERE u.id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

fn login_failure(message: &str) -> LoginResponse {
    LoginResponse {
        success: false,
        message: message.to_string(),
        redirect: None,
        usuario: None,
    }
}

fn session_cookie(token: Uuid) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, token.to_string());
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(CookieDuration::days(SESSION_TTL_DAYS));
    cookie
}

/// Researcher sign-ups start pending; everyone else is an active reader.
fn rol_y_estado(rol: &str) -> (i32, &'static str) {
    if rol == "investigador" {
        (2, "pendiente")
    } else {
        (1, "activo")
    }
}

fn redirect_para_rol(rol: &str) -> &'static str {
    if rol == "admin" {
        "/dashboard/admin.html"
    } else {
        "/index.html"
    }
}

fn validar_registro(
    nombre: &str,
    email: &str,
    password: &str,
    password_confirm: Option<&str>,
) -> Result<(), String> {
    if nombre.is_empty() {
        return Err("El nombre completo es obligatorio".to_string());
    }
    if !es_email_valido(email) {
        return Err("Email inválido".to_string());
    }
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err("La contraseña debe tener al menos 6 caracteres".to_string());
    }
    if let Some(confirm) = password_confirm {
        if confirm != password {
            return Err("Las contraseñas no coinciden".to_string());
        }
    }
    Ok(())
}

fn es_email_valido(email: &str) -> bool {
    let Some((local, dominio)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !dominio.is_empty()
        && dominio.contains('.')
        && !dominio.starts_with('.')
        && !dominio.ends_with('.')
        && !email.contains(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn researcher_registration_starts_pending() {
        assert_eq!(rol_y_estado("investigador"), (2, "pendiente"));
        assert_eq!(rol_y_estado("lector"), (1, "activo"));
        assert_eq!(rol_y_estado(""), (1, "activo"));
    }

    #[test]
    fn redirect_depends_on_role() {
        assert_eq!(redirect_para_rol("admin"), "/dashboard/admin.html");
        assert_eq!(redirect_para_rol("investigador"), "/index.html");
        assert_eq!(redirect_para_rol("lector"), "/index.html");
    }

    #[test]
    fn rejects_invalid_registrations() {
        assert_eq!(
            validar_registro("", "a@b.com", "secreto", None),
            Err("El nombre completo es obligatorio".to_string())
        );
        assert_eq!(
            validar_registro("Ana", "no-es-email", "secreto", None),
            Err("Email inválido".to_string())
        );
        assert_eq!(
            validar_registro("Ana", "a@b.com", "corta", None),
            Err("La contraseña debe tener al menos 6 caracteres".to_string())
        );
        assert_eq!(
            validar_registro("Ana", "a@b.com", "secreto", Some("otra")),
            Err("Las contraseñas no coinciden".to_string())
        );
    }

    #[test]
    fn accepts_valid_registration() {
        assert!(validar_registro("Ana Pérez", "ana@uni.edu", "secreto", Some("secreto")).is_ok());
    }

    #[test]
    fn email_validation_handles_edge_cases() {
        assert!(es_email_valido("ana@uni.edu"));
        assert!(!es_email_valido("ana@uni"));
        assert!(!es_email_valido("@uni.edu"));
        assert!(!es_email_valido("ana@.edu"));
        assert!(!es_email_valido("ana con espacios@uni.edu"));
    }

    #[test]
    fn password_roundtrip_verifies() {
        let hash = hash_password("secreto123").expect("hash");
        assert!(verify_password("secreto123", &hash));
        assert!(!verify_password("otra-clave", &hash));
        assert!(!verify_password("secreto123", "no-es-un-hash"));
    }
}
