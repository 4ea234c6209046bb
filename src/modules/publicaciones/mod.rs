use axum::{
    Json, Router,
    extract::{Form, Query, State},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use url::Url;

use crate::{
    activity::{self, NIVEL_INFO},
    web::{
        ApiError, ApiMessage, AppState,
        auth::require_investigador,
        sessions::SessionUser,
    },
};

pub const CATEGORIAS_VALIDAS: &[i32] = &[1, 2];

const MAX_TITULO_CHARS: usize = 255;
const MAX_URL_CHARS: usize = 500;
const RELEVANCIA_INICIAL: f64 = 5.0;

const LISTADO_LIMIT: i64 = 50;
const DEFAULT_TOP_LIMIT: i64 = 10;

const KEYWORDS_SUBSELECT: &str = "(SELECT string_agg(k.palabra, ', ' ORDER BY k.palabra)
     FROM articulo_keywords ak JOIN keywords k ON k.id = ak.keyword_id
     WHERE ak.articulo_id = a.id) AS keywords";

pub fn router() -> Router<AppState> {
    Router::new().route("/api/publicaciones", get(dispatch_get).post(dispatch_post))
}

#[derive(Deserialize)]
pub struct PublicacionesQuery {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    categoria_id: Option<i32>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct ArticuloForm {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    titulo: Option<String>,
    #[serde(default)]
    resumen: Option<String>,
    #[serde(default)]
    contenido: Option<String>,
    #[serde(default)]
    categoria_id: Option<i32>,
    #[serde(default)]
    url_documento: Option<String>,
}

/// Validated publication fields ready for persistence.
#[derive(Debug, PartialEq)]
struct DatosArticulo {
    titulo: String,
    resumen: String,
    contenido: String,
    categoria_id: i32,
    url_documento: Option<String>,
}

#[derive(Clone, sqlx::FromRow, Serialize)]
struct ArticuloCard {
    id: i64,
    titulo: String,
    autor: String,
    resumen: String,
    url_documento: Option<String>,
    fecha_publicacion: NaiveDate,
    categoria: Option<String>,
    vistas: i64,
    descargas: i64,
    keywords: Option<String>,
}

#[derive(Clone, sqlx::FromRow, Serialize)]
struct ArticuloDetalle {
    id: i64,
    titulo: String,
    autor: String,
    resumen: String,
    contenido: String,
    url_documento: Option<String>,
    fecha_publicacion: NaiveDate,
    categoria_id: i32,
    categoria: Option<String>,
    relevancia_score: f64,
    vistas: i64,
    descargas: i64,
    keywords: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, sqlx::FromRow, Serialize)]
struct MisPublicacionRow {
    id: i64,
    titulo: String,
    autor: String,
    resumen: String,
    contenido: String,
    url_documento: Option<String>,
    fecha_publicacion: NaiveDate,
    relevancia_score: f64,
    categoria_nombre: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct PublicarResponse {
    success: bool,
    message: String,
    articulo_id: i64,
}

#[derive(Serialize)]
struct MisPublicacionesResponse {
    success: bool,
    publicaciones: Vec<MisPublicacionRow>,
    total: usize,
}

#[derive(Serialize)]
struct ListadoResponse {
    success: bool,
    data: Vec<ArticuloCard>,
    total: usize,
}

#[derive(Serialize)]
struct DetalleResponse {
    success: bool,
    data: ArticuloDetalle,
}

#[derive(Serialize)]
struct DescargaResponse {
    success: bool,
    archivo: String,
}

async fn dispatch_get(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<PublicacionesQuery>,
) -> Result<Response, ApiError> {
    match query.action.as_deref().unwrap_or("") {
        "mis_publicaciones" => {
            let user = require_investigador(&state, &jar).await?;
            mis_publicaciones(&state, &user).await.map(IntoResponse::into_response)
        }
        "detalle" => detalle(&state, query.id).await.map(IntoResponse::into_response),
        "todas" => todas(&state, query.categoria_id).await.map(IntoResponse::into_response),
        "mas_visitadas" => {
            listado_ordenado(&state, "a.vistas DESC, a.fecha_publicacion DESC", query.limit)
                .await
                .map(IntoResponse::into_response)
        }
        "mas_recientes" => {
            listado_ordenado(&state, "a.fecha_publicacion DESC, a.id DESC", query.limit)
                .await
                .map(IntoResponse::into_response)
        }
        "mas_antiguas" => {
            listado_ordenado(&state, "a.fecha_publicacion ASC, a.id ASC", query.limit)
                .await
                .map(IntoResponse::into_response)
        }
        "descargar" => descargar(&state, query.id).await.map(IntoResponse::into_response),
        _ => Ok(Json(ApiMessage::fail("Acción no válida")).into_response()),
    }
}

async fn dispatch_post(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<PublicacionesQuery>,
    form: Option<Form<ArticuloForm>>,
) -> Result<Response, ApiError> {
    let form = form.map(|Form(form)| form).unwrap_or_default();

    match query.action.as_deref().unwrap_or("") {
        "publicar" => {
            let user = require_investigador(&state, &jar).await?;
            publicar(&state, &user, form).await.map(IntoResponse::into_response)
        }
        "editar" => {
            let user = require_investigador(&state, &jar).await?;
            editar(&state, &user, form).await.map(IntoResponse::into_response)
        }
        "eliminar" => {
            let user = require_investigador(&state, &jar).await?;
            let id = form.id.or(query.id);
            eliminar(&state, &user, id).await.map(IntoResponse::into_response)
        }
        "incrementar_vista" => {
            incrementar_contador(&state, form.id.or(query.id), "vistas")
                .await
                .map(IntoResponse::into_response)
        }
        "incrementar_descarga" => {
            incrementar_contador(&state, form.id.or(query.id), "descargas")
                .await
                .map(IntoResponse::into_response)
        }
        _ => Ok(Json(ApiMessage::fail("Acción no válida")).into_response()),
    }
}

async fn publicar(
    state: &AppState,
    user: &SessionUser,
    form: ArticuloForm,
) -> Result<Json<PublicarResponse>, ApiError> {
    let datos = validar_articulo(&form).map_err(ApiError::validation)?;

    let articulo_id: i64 = sqlx::query_scalar(
        "INSERT INTO articulos
             (titulo, autor, autor_id, resumen, contenido, url_documento,
              fecha_publicacion, categoria_id, relevancia_score)
         VALUES ($1, $2, $3, $4, $5, $6, CURRENT_DATE, $7, $8)
         RETURNING id",
    )
    .bind(&datos.titulo)
    .bind(&user.nombre_completo)
    .bind(user.id)
    .bind(&datos.resumen)
    .bind(&datos.contenido)
    .bind(datos.url_documento.as_deref())
    .bind(datos.categoria_id)
    .bind(RELEVANCIA_INICIAL)
    .fetch_one(state.pool_ref())
    .await?;

    let mensaje = format!("Artículo publicado: {} (ID: {})", datos.titulo, articulo_id);
    if let Err(err) = activity::log_activity(state.pool_ref(), Some(user.id), NIVEL_INFO, &mensaje).await
    {
        warn!(?err, articulo_id, "failed to record publication activity");
    }

    Ok(Json(PublicarResponse {
        success: true,
        message: "¡Investigación publicada exitosamente!".to_string(),
        articulo_id,
    }))
}

async fn mis_publicaciones(
    state: &AppState,
    user: &SessionUser,
) -> Result<Json<MisPublicacionesResponse>, ApiError> {
    let publicaciones = sqlx::query_as::<_, MisPublicacionRow>(
        "SELECT a.id, a.titulo, a.autor, a.resumen, a.contenido, a.url_documento,
                a.fecha_publicacion, a.relevancia_score, c.nombre AS categoria_nombre,
                a.created_at, a.updated_at
         FROM articulos a
         LEFT JOIN categorias c ON c.id = a.categoria_id
         WHERE a.autor_id = $1
         ORDER BY a.created_at DESC",
    )
    .bind(user.id)
    .fetch_all(state.pool_ref())
    .await?;

    let total = publicaciones.len();
    Ok(Json(MisPublicacionesResponse {
        success: true,
        publicaciones,
        total,
    }))
}

async fn editar(
    state: &AppState,
    user: &SessionUser,
    form: ArticuloForm,
) -> Result<Json<ApiMessage>, ApiError> {
    let articulo_id = form
        .id
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::validation("ID de artículo inválido"))?;
    let datos = validar_articulo(&form).map_err(ApiError::validation)?;

    // Ownership enforced inside the statement so the check and the write
    // cannot interleave with a concurrent mutation.
    let result = sqlx::query(
        "UPDATE articulos
         SET titulo = $1, resumen = $2, contenido = $3, url_documento = $4,
             categoria_id = $5, updated_at = NOW()
         WHERE id = $6 AND (autor_id = $7 OR $8)",
    )
    .bind(&datos.titulo)
    .bind(&datos.resumen)
    .bind(&datos.contenido)
    .bind(datos.url_documento.as_deref())
    .bind(datos.categoria_id)
    .bind(articulo_id)
    .bind(user.id)
    .bind(user.is_admin())
    .execute(state.pool_ref())
    .await?;

    if result.rows_affected() == 0 {
        return Err(mutacion_rechazada(
            state.pool_ref(),
            articulo_id,
            "No tienes permisos para editar este artículo",
        )
        .await?);
    }

    Ok(Json(ApiMessage::ok("Artículo actualizado exitosamente")))
}

async fn eliminar(
    state: &AppState,
    user: &SessionUser,
    id: Option<i64>,
) -> Result<Json<ApiMessage>, ApiError> {
    let articulo_id = id
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::validation("ID de artículo inválido"))?;

    let result = sqlx::query("DELETE FROM articulos WHERE id = $1 AND (autor_id = $2 OR $3)")
        .bind(articulo_id)
        .bind(user.id)
        .bind(user.is_admin())
        .execute(state.pool_ref())
        .await?;

    if result.rows_affected() == 0 {
        return Err(mutacion_rechazada(
            state.pool_ref(),
            articulo_id,
            "No tienes permisos para eliminar este artículo",
        )
        .await?);
    }

    Ok(Json(ApiMessage::ok("Artículo eliminado exitosamente")))
}

/// A zero-row guarded mutation is either a missing article or an ownership
/// failure; a follow-up existence probe distinguishes the two.
async fn mutacion_rechazada(
    pool: &PgPool,
    articulo_id: i64,
    forbidden_message: &str,
) -> Result<ApiError, ApiError> {
    let existe: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM articulos WHERE id = $1)")
        .bind(articulo_id)
        .fetch_one(pool)
        .await?;

    if existe {
        Ok(ApiError::Forbidden(forbidden_message.to_string()))
    } else {
        Ok(ApiError::not_found("Artículo no encontrado"))
    }
}

async fn detalle(state: &AppState, id: Option<i64>) -> Result<Json<DetalleResponse>, ApiError> {
    let articulo_id = id
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::validation("ID de artículo inválido"))?;

    let sql = format!(
        "SELECT a.id, a.titulo, a.autor, a.resumen, a.contenido, a.url_documento,
                a.fecha_publicacion, a.categoria_id, c.nombre AS categoria,
                a.relevancia_score, a.vistas, a.descargas, {KEYWORDS_SUBSELECT},
                a.created_at, a.updated_at
         FROM articulos a
         LEFT JOIN categorias c ON c.id = a.categoria_id
         WHERE a.id = $1"
    );

    let articulo = sqlx::query_as::<_, ArticuloDetalle>(&sql)
        .bind(articulo_id)
        .fetch_optional(state.pool_ref())
        .await?
        .ok_or_else(|| ApiError::not_found("Artículo no encontrado"))?;

    Ok(Json(DetalleResponse {
        success: true,
        data: articulo,
    }))
}

async fn todas(
    state: &AppState,
    categoria_id: Option<i32>,
) -> Result<Json<ListadoResponse>, ApiError> {
    let base = format!(
        "SELECT a.id, a.titulo, a.autor, a.resumen, a.url_documento,
                a.fecha_publicacion, c.nombre AS categoria, a.vistas, a.descargas,
                {KEYWORDS_SUBSELECT}
         FROM articulos a
         LEFT JOIN categorias c ON c.id = a.categoria_id"
    );

    let data = match categoria_id {
        Some(categoria) => {
            let sql = format!(
                "{base}
                 WHERE a.categoria_id = $1
                 ORDER BY a.relevancia_score DESC, a.fecha_publicacion DESC
                 LIMIT $2"
            );
            sqlx::query_as::<_, ArticuloCard>(&sql)
                .bind(categoria)
                .bind(LISTADO_LIMIT)
                .fetch_all(state.pool_ref())
                .await?
        }
        None => {
            let sql = format!(
                "{base}
                 ORDER BY a.relevancia_score DESC, a.fecha_publicacion DESC
                 LIMIT $1"
            );
            sqlx::query_as::<_, ArticuloCard>(&sql)
                .bind(LISTADO_LIMIT)
                .fetch_all(state.pool_ref())
                .await?
        }
    };

    let total = data.len();
    Ok(Json(ListadoResponse {
        success: true,
        data,
        total,
    }))
}

async fn listado_ordenado(
    state: &AppState,
    order_by: &str,
    limit: Option<i64>,
) -> Result<Json<ListadoResponse>, ApiError> {
    let sql = format!(
        "SELECT a.id, a.titulo, a.autor, a.resumen, a.url_documento,
                a.fecha_publicacion, c.nombre AS categoria, a.vistas, a.descargas,
                {KEYWORDS_SUBSELECT}
         FROM articulos a
         LEFT JOIN categorias c ON c.id = a.categoria_id
         ORDER BY {order_by}
         LIMIT $1"
    );

    let data = sqlx::query_as::<_, ArticuloCard>(&sql)
        .bind(clamp_limit(limit, DEFAULT_TOP_LIMIT))
        .fetch_all(state.pool_ref())
        .await?;

    let total = data.len();
    Ok(Json(ListadoResponse {
        success: true,
        data,
        total,
    }))
}

async fn descargar(state: &AppState, id: Option<i64>) -> Result<Response, ApiError> {
    let articulo_id = id
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::validation("ID de artículo inválido"))?;

    let url_documento: Option<Option<String>> =
        sqlx::query_scalar("SELECT url_documento FROM articulos WHERE id = $1")
            .bind(articulo_id)
            .fetch_optional(state.pool_ref())
            .await?;

    let Some(url_documento) = url_documento else {
        return Err(ApiError::not_found("Artículo no encontrado"));
    };

    match url_documento {
        Some(archivo) if !archivo.is_empty() => Ok(Json(DescargaResponse {
            success: true,
            archivo,
        })
        .into_response()),
        _ => Ok(Json(ApiMessage::fail("El artículo no tiene documento asociado")).into_response()),
    }
}

async fn incrementar_contador(
    state: &AppState,
    id: Option<i64>,
    contador: &str,
) -> Result<Json<ApiMessage>, ApiError> {
    let articulo_id = id
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::validation("ID de artículo inválido"))?;

    // Counter bumps are fire-and-forget: a missing row is not an error the
    // frontend depends on.
    let sql = match contador {
        "vistas" => "UPDATE articulos SET vistas = vistas + 1 WHERE id = $1",
        _ => "UPDATE articulos SET descargas = descargas + 1 WHERE id = $1",
    };
    sqlx::query(sql)
        .bind(articulo_id)
        .execute(state.pool_ref())
        .await?;

    Ok(Json(ApiMessage::ok("Registrado")))
}

fn validar_articulo(form: &ArticuloForm) -> Result<DatosArticulo, String> {
    let titulo = form.titulo.as_deref().unwrap_or("").trim();
    let resumen = form.resumen.as_deref().unwrap_or("").trim();
    let contenido = form.contenido.as_deref().unwrap_or("").trim();
    let categoria_id = form.categoria_id.unwrap_or(0);
    let url_documento = form.url_documento.as_deref().unwrap_or("").trim();

    if titulo.is_empty() {
        return Err("El título es obligatorio".to_string());
    }
    if titulo.chars().count() > MAX_TITULO_CHARS {
        return Err("El título no puede exceder 255 caracteres".to_string());
    }
    if resumen.is_empty() {
        return Err("El resumen es obligatorio".to_string());
    }
    if contenido.is_empty() {
        return Err("El contenido es obligatorio".to_string());
    }
    if !CATEGORIAS_VALIDAS.contains(&categoria_id) {
        return Err("Debes seleccionar una categoría válida (Flora o Fauna)".to_string());
    }

    let url_documento = if url_documento.is_empty() {
        None
    } else {
        if url_documento.chars().count() > MAX_URL_CHARS {
            return Err("La URL del documento no puede exceder 500 caracteres".to_string());
        }
        if !es_url_valida(url_documento) {
            return Err("La URL del documento no es válida".to_string());
        }
        Some(url_documento.to_string())
    };

    Ok(DatosArticulo {
        titulo: titulo.to_string(),
        resumen: resumen.to_string(),
        contenido: contenido.to_string(),
        categoria_id,
        url_documento,
    })
}

fn es_url_valida(valor: &str) -> bool {
    match Url::parse(valor) {
        Ok(url) => url.has_host(),
        Err(_) => false,
    }
}

fn clamp_limit(limit: Option<i64>, default: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, LISTADO_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formulario_valido() -> ArticuloForm {
        ArticuloForm {
            id: None,
            titulo: Some("Crecimiento de Arabidopsis en microgravedad".to_string()),
            resumen: Some("Resumen del experimento".to_string()),
            contenido: Some("Contenido completo del artículo".to_string()),
            categoria_id: Some(1),
            url_documento: Some("https://ejemplo.org/articulo.pdf".to_string()),
        }
    }

    #[test]
    fn accepts_valid_submission() {
        let datos = validar_articulo(&formulario_valido()).expect("valid");
        assert_eq!(datos.categoria_id, 1);
        assert_eq!(
            datos.url_documento.as_deref(),
            Some("https://ejemplo.org/articulo.pdf")
        );
    }

    #[test]
    fn rejects_missing_title() {
        let mut form = formulario_valido();
        form.titulo = Some("   ".to_string());
        assert_eq!(
            validar_articulo(&form),
            Err("El título es obligatorio".to_string())
        );
    }

    #[test]
    fn rejects_title_over_255_chars() {
        let mut form = formulario_valido();
        form.titulo = Some("x".repeat(256));
        assert_eq!(
            validar_articulo(&form),
            Err("El título no puede exceder 255 caracteres".to_string())
        );

        form.titulo = Some("x".repeat(255));
        assert!(validar_articulo(&form).is_ok());
    }

    #[test]
    fn rejects_categories_outside_closed_set() {
        for categoria in [0, 3, -1, 99] {
            let mut form = formulario_valido();
            form.categoria_id = Some(categoria);
            assert_eq!(
                validar_articulo(&form),
                Err("Debes seleccionar una categoría válida (Flora o Fauna)".to_string())
            );
        }
    }

    #[test]
    fn missing_category_is_rejected() {
        let mut form = formulario_valido();
        form.categoria_id = None;
        assert!(validar_articulo(&form).is_err());
    }

    #[test]
    fn url_is_optional_but_validated_when_present() {
        let mut form = formulario_valido();
        form.url_documento = None;
        assert!(validar_articulo(&form).expect("valid").url_documento.is_none());

        form.url_documento = Some("".to_string());
        assert!(validar_articulo(&form).expect("valid").url_documento.is_none());

        form.url_documento = Some("no-es-una-url".to_string());
        assert_eq!(
            validar_articulo(&form),
            Err("La URL del documento no es válida".to_string())
        );

        form.url_documento = Some(format!("https://ejemplo.org/{}", "a".repeat(500)));
        assert_eq!(
            validar_articulo(&form),
            Err("La URL del documento no puede exceder 500 caracteres".to_string())
        );
    }

    #[test]
    fn url_without_host_is_rejected() {
        assert!(!es_url_valida("mailto:ana@uni.edu"));
        assert!(es_url_valida("http://ejemplo.org"));
    }

    #[test]
    fn clamps_listing_limits() {
        assert_eq!(clamp_limit(None, DEFAULT_TOP_LIMIT), 10);
        assert_eq!(clamp_limit(Some(5), DEFAULT_TOP_LIMIT), 5);
        assert_eq!(clamp_limit(Some(0), DEFAULT_TOP_LIMIT), 1);
        assert_eq!(clamp_limit(Some(-3), DEFAULT_TOP_LIMIT), 1);
        assert_eq!(clamp_limit(Some(500), DEFAULT_TOP_LIMIT), LISTADO_LIMIT);
    }
}
