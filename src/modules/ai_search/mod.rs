use axum::{
    Json, Router,
    extract::{Form, Query, State},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;

use crate::{
    config::AiSettings,
    llm::{LlmClient, LlmRequest},
    web::{ApiError, AppState, models::ArticuloSearchRow},
};

const PROVIDER: &str = "claude";

const AI_SEARCH_LIMIT: i64 = 15;
const SIMPLE_SEARCH_LIMIT: i64 = 20;
const QUESTION_CONTEXT_LIMIT: i64 = 5;
const ANALYSIS_TOP_RESULTS: usize = 5;
const CONTEXT_SNIPPET_CHARS: usize = 800;

const UPSTREAM_UNAVAILABLE: &str =
    "El asistente de IA no está disponible en este momento. Intenta de nuevo más tarde.";

const KEYWORDS_SUBSELECT: &str = "(SELECT string_agg(k.palabra, ', ' ORDER BY k.palabra)
     FROM articulo_keywords ak JOIN keywords k ON k.id = ak.keyword_id
     WHERE ak.articulo_id = a.id) AS keywords";

pub fn router() -> Router<AppState> {
    Router::new().route("/api/ai_search", get(dispatch).post(dispatch_form))
}

#[derive(Deserialize, Default, Clone)]
pub struct AiParams {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    article_id: Option<i64>,
}

#[derive(Serialize)]
struct AiSearchResponse {
    success: bool,
    original_query: String,
    improved_query: String,
    ai_analysis: String,
    provider: &'static str,
    results: Vec<ArticuloSearchRow>,
    total: usize,
}

#[derive(Serialize)]
struct SimpleSearchResponse {
    success: bool,
    results: Vec<ArticuloSearchRow>,
    total: usize,
}

#[derive(Serialize)]
struct QuestionResponse {
    success: bool,
    question: String,
    answer: String,
    provider: &'static str,
    articles_consulted: usize,
}

#[derive(Serialize)]
struct SummaryResponse {
    success: bool,
    article_id: i64,
    ai_summary: String,
    provider: &'static str,
}

#[derive(Serialize)]
struct StatsResponse {
    success: bool,
    stats: Stats,
}

#[derive(Serialize)]
struct Stats {
    total_articulos: i64,
    por_categoria: Vec<CategoriaStat>,
    por_anio: Vec<AnioStat>,
    top_autores: Vec<AutorStat>,
    promedio_relevancia: f64,
}

#[derive(sqlx::FromRow, Serialize)]
struct CategoriaStat {
    nombre: String,
    total: i64,
}

#[derive(sqlx::FromRow, Serialize)]
struct AnioStat {
    anio: i32,
    total: i64,
}

#[derive(sqlx::FromRow, Serialize)]
struct AutorStat {
    autor: String,
    total: i64,
}

async fn dispatch_form(
    state: State<AppState>,
    query: Query<AiParams>,
    form: Option<Form<AiParams>>,
) -> Result<Response, ApiError> {
    let params = merge_params(query.0, form.map(|Form(form)| form));
    handle(state.0, params).await
}

async fn dispatch(
    State(state): State<AppState>,
    Query(params): Query<AiParams>,
) -> Result<Response, ApiError> {
    handle(state, params).await
}

async fn handle(state: AppState, params: AiParams) -> Result<Response, ApiError> {
    match params.action.as_deref().unwrap_or("ai_search") {
        "ai_search" | "semantic_search" => {
            ai_search(&state, params.query.as_deref().unwrap_or(""))
                .await
                .map(IntoResponse::into_response)
        }
        "ai_question" => ai_question(&state, &params).await.map(IntoResponse::into_response),
        "generate_summary" => {
            generate_summary(&state, params.article_id)
                .await
                .map(IntoResponse::into_response)
        }
        "get_stats" => get_stats(&state).await.map(IntoResponse::into_response),
        _ => {
            busqueda_simple(&state, params.query.as_deref().unwrap_or(""))
                .await
                .map(IntoResponse::into_response)
        }
    }
}

async fn ai_search(state: &AppState, query: &str) -> Result<Response, ApiError> {
    let query = query.trim();
    if query.is_empty() {
        return busqueda_simple(state, query).await.map(IntoResponse::into_response);
    }

    let settings = state.ai_settings().await;
    let llm = state.llm_client();

    let mut improved_query = expandir_consulta(&llm, &settings, query).await;
    let mut results = buscar_like(state.pool_ref(), &improved_query, AI_SEARCH_LIMIT, true).await?;

    // The expanded query must never turn a matching search into an empty one:
    // retry with the user's original text before reporting zero results.
    if results.is_empty() && improved_query != query {
        results = buscar_like(state.pool_ref(), query, AI_SEARCH_LIMIT, true).await?;
        improved_query = query.to_string();
    }

    let ai_analysis = if results.is_empty() {
        String::new()
    } else {
        analizar_resultados(&llm, &settings, query, &results).await
    };

    let total = results.len();
    Ok(Json(AiSearchResponse {
        success: true,
        original_query: query.to_string(),
        improved_query,
        ai_analysis,
        provider: PROVIDER,
        results,
        total,
    })
    .into_response())
}

async fn busqueda_simple(state: &AppState, query: &str) -> Result<Json<SimpleSearchResponse>, ApiError> {
    let query = query.trim();

    let results = if query.is_empty() {
        let sql = format!(
            "SELECT a.id, a.titulo, a.autor, a.resumen, a.contenido, a.url_documento,
                    a.fecha_publicacion, a.categoria_id, a.relevancia_score, a.vistas,
                    a.descargas, a.created_at, a.updated_at,
                    c.nombre AS categoria_nombre, {KEYWORDS_SUBSELECT}, NULL::real AS score
             FROM articulos a
             LEFT JOIN categorias c ON c.id = a.categoria_id
             ORDER BY a.relevancia_score DESC
             LIMIT $1"
        );
        sqlx::query_as::<_, ArticuloSearchRow>(&sql)
            .bind(SIMPLE_SEARCH_LIMIT)
            .fetch_all(state.pool_ref())
            .await?
    } else {
        buscar_like(state.pool_ref(), query, SIMPLE_SEARCH_LIMIT, false).await?
    };

    let total = results.len();
    Ok(Json(SimpleSearchResponse {
        success: true,
        results,
        total,
    }))
}

/// Case-insensitive substring search over the publication text fields,
/// ordered by the stored relevance hint.
async fn buscar_like(
    pool: &PgPool,
    term: &str,
    limit: i64,
    incluir_autor: bool,
) -> sqlx::Result<Vec<ArticuloSearchRow>> {
    let autor_clause = if incluir_autor {
        " OR a.autor ILIKE $1"
    } else {
        ""
    };
    let sql = format!(
        "SELECT a.id, a.titulo, a.autor, a.resumen, a.contenido, a.url_documento,
                a.fecha_publicacion, a.categoria_id, a.relevancia_score, a.vistas,
                a.descargas, a.created_at, a.updated_at,
                c.nombre AS categoria_nombre, {KEYWORDS_SUBSELECT}, NULL::real AS score
         FROM articulos a
         LEFT JOIN categorias c ON c.id = a.categoria_id
         WHERE a.titulo ILIKE $1 OR a.resumen ILIKE $1 OR a.contenido ILIKE $1{autor_clause}
         ORDER BY a.relevancia_score DESC, a.fecha_publicacion DESC
         LIMIT $2"
    );

    sqlx::query_as::<_, ArticuloSearchRow>(&sql)
        .bind(format!("%{term}%"))
        .bind(limit)
        .fetch_all(pool)
        .await
}

async fn ai_question(state: &AppState, params: &AiParams) -> Result<Json<QuestionResponse>, ApiError> {
    let question = params.question.as_deref().unwrap_or("").trim().to_string();
    if question.is_empty() {
        return Err(ApiError::validation("Pregunta vacía"));
    }

    let articulos = match params.article_id {
        Some(articulo_id) => {
            let articulo = fetch_articulo(state.pool_ref(), articulo_id)
                .await?
                .ok_or_else(|| ApiError::not_found("Artículo no encontrado"))?;
            vec![articulo]
        }
        None => buscar_like(state.pool_ref(), &question, QUESTION_CONTEXT_LIMIT, false).await?,
    };

    let settings = state.ai_settings().await;
    let contexto = construir_contexto(&articulos);
    let prompt = render_prompt(
        &settings.prompts.document_question,
        &[("{{CONTEXTO}}", contexto.as_str()), ("{{PREGUNTA}}", &question)],
    );

    let answer = completar_o_fallar(&state.llm_client(), &settings.models.question_model, prompt).await?;

    Ok(Json(QuestionResponse {
        success: true,
        question,
        answer,
        provider: PROVIDER,
        articles_consulted: articulos.len(),
    }))
}

async fn generate_summary(
    state: &AppState,
    article_id: Option<i64>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let articulo_id = article_id.ok_or_else(|| ApiError::validation("ID requerido"))?;

    let articulo = fetch_articulo(state.pool_ref(), articulo_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Artículo no encontrado"))?;

    let settings = state.ai_settings().await;
    let prompt = render_prompt(
        &settings.prompts.document_summary,
        &[
            ("{{TITULO}}", articulo.titulo.as_str()),
            ("{{AUTOR}}", articulo.autor.as_str()),
            ("{{CONTENIDO}}", articulo.contenido.as_str()),
        ],
    );

    let ai_summary =
        completar_o_fallar(&state.llm_client(), &settings.models.summary_model, prompt).await?;

    Ok(Json(SummaryResponse {
        success: true,
        article_id: articulo_id,
        ai_summary,
        provider: PROVIDER,
    }))
}

async fn get_stats(state: &AppState) -> Result<Json<StatsResponse>, ApiError> {
    let pool = state.pool_ref();

    let total_articulos: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articulos")
        .fetch_one(pool)
        .await?;

    let por_categoria = sqlx::query_as::<_, CategoriaStat>(
        "SELECT c.nombre, COUNT(a.id) AS total
         FROM categorias c
         LEFT JOIN articulos a ON c.id = a.categoria_id
         GROUP BY c.id, c.nombre
         ORDER BY c.id",
    )
    .fetch_all(pool)
    .await?;

    let por_anio = sqlx::query_as::<_, AnioStat>(
        "SELECT EXTRACT(YEAR FROM fecha_publicacion)::INT AS anio, COUNT(*) AS total
         FROM articulos
         GROUP BY anio
         ORDER BY anio DESC",
    )
    .fetch_all(pool)
    .await?;

    let top_autores = sqlx::query_as::<_, AutorStat>(
        "SELECT autor, COUNT(*) AS total
         FROM articulos
         GROUP BY autor
         ORDER BY total DESC
         LIMIT 5",
    )
    .fetch_all(pool)
    .await?;

    let promedio: f64 =
        sqlx::query_scalar("SELECT COALESCE(AVG(relevancia_score), 0)::float8 FROM articulos")
            .fetch_one(pool)
            .await?;

    Ok(Json(StatsResponse {
        success: true,
        stats: Stats {
            total_articulos,
            por_categoria,
            por_anio,
            top_autores,
            promedio_relevancia: redondear2(promedio),
        },
    }))
}

async fn fetch_articulo(pool: &PgPool, id: i64) -> sqlx::Result<Option<ArticuloSearchRow>> {
    let sql = format!(
        "SELECT a.id, a.titulo, a.autor, a.resumen, a.contenido, a.url_documento,
                a.fecha_publicacion, a.categoria_id, a.relevancia_score, a.vistas,
                a.descargas, a.created_at, a.updated_at,
                c.nombre AS categoria_nombre, {KEYWORDS_SUBSELECT}, NULL::real AS score
         FROM articulos a
         LEFT JOIN categorias c ON c.id = a.categoria_id
         WHERE a.id = $1"
    );

    sqlx::query_as::<_, ArticuloSearchRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Query expansion is best-effort: any provider failure falls back to the
/// caller's original query without surfacing an error.
async fn expandir_consulta(llm: &LlmClient, settings: &AiSettings, query: &str) -> String {
    if !llm.is_configured() {
        return query.to_string();
    }

    let prompt = render_prompt(&settings.prompts.query_expansion, &[("{{QUERY}}", query)]);
    match llm
        .complete(LlmRequest::new(&settings.models.expansion_model, prompt))
        .await
    {
        Ok(response) => {
            let expanded = response.text.trim();
            if expanded.is_empty() {
                query.to_string()
            } else {
                expanded.to_string()
            }
        }
        Err(err) => {
            warn!(?err, "query expansion failed, using the original query");
            query.to_string()
        }
    }
}

/// Result commentary is equally best-effort; an empty string means no
/// commentary was available.
async fn analizar_resultados(
    llm: &LlmClient,
    settings: &AiSettings,
    query: &str,
    results: &[ArticuloSearchRow],
) -> String {
    if !llm.is_configured() {
        return String::new();
    }

    let resumen = resumen_resultados(results);
    let prompt = render_prompt(
        &settings.prompts.result_analysis,
        &[("{{QUERY}}", query), ("{{RESULTS}}", resumen.as_str())],
    );

    match llm
        .complete(LlmRequest::new(&settings.models.analysis_model, prompt))
        .await
    {
        Ok(response) => response.text.trim().to_string(),
        Err(err) => {
            warn!(?err, "result analysis failed, omitting commentary");
            String::new()
        }
    }
}

async fn completar_o_fallar(
    llm: &LlmClient,
    model: &str,
    prompt: String,
) -> Result<String, ApiError> {
    if !llm.is_configured() {
        return Err(ApiError::Upstream(UPSTREAM_UNAVAILABLE.to_string()));
    }

    match llm.complete(LlmRequest::new(model, prompt)).await {
        Ok(response) => Ok(response.text.trim().to_string()),
        Err(err) => {
            warn!(?err, "provider completion failed");
            Err(ApiError::Upstream(UPSTREAM_UNAVAILABLE.to_string()))
        }
    }
}

fn merge_params(query: AiParams, form: Option<AiParams>) -> AiParams {
    match form {
        Some(form) => AiParams {
            action: form.action.or(query.action),
            query: form.query.or(query.query),
            question: form.question.or(query.question),
            article_id: form.article_id.or(query.article_id),
        },
        None => query,
    }
}

fn render_prompt(template: &str, reemplazos: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (marcador, valor) in reemplazos {
        rendered = rendered.replace(marcador, valor);
    }
    rendered
}

fn construir_contexto(articulos: &[ArticuloSearchRow]) -> String {
    let mut contexto = String::from("Contexto de artículos científicos:\n\n");
    for articulo in articulos {
        contexto.push_str(&format!(
            "Título: {}\nAutor: {}\nResumen: {}\nContenido: {}...\n\n",
            articulo.titulo,
            articulo.autor,
            articulo.resumen,
            truncar(&articulo.contenido, CONTEXT_SNIPPET_CHARS),
        ));
    }
    contexto
}

fn resumen_resultados(results: &[ArticuloSearchRow]) -> String {
    results
        .iter()
        .take(ANALYSIS_TOP_RESULTS)
        .map(|r| format!("- {} ({}, {})", r.titulo, r.autor, r.fecha_publicacion))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncates on a character boundary so multibyte content never splits a
/// code point.
fn truncar(texto: &str, max_chars: usize) -> &str {
    match texto.char_indices().nth(max_chars) {
        Some((idx, _)) => &texto[..idx],
        None => texto,
    }
}

/// Rounds a value to two decimal places (matches the original
/// `round($x, 2)` behaviour from the source dashboard).
fn redondear2(valor: f64) -> f64 {
    (valor * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prompt_placeholders() {
        let rendered = render_prompt(
            "Consulta: \"{{QUERY}}\"\nResultados:\n{{RESULTS}}",
            &[("{{QUERY}}", "raices"), ("{{RESULTS}}", "- a\n- b")],
        );
        assert_eq!(rendered, "Consulta: \"raices\"\nResultados:\n- a\n- b");
        assert!(!rendered.contains("{{"));
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncar("microgravedad", 5), "micro");
        assert_eq!(truncar("corto", 800), "corto");
        // 'á' is two bytes; slicing by chars must not panic mid code point.
        assert_eq!(truncar("áéíóú", 3), "áéí");
    }

    #[test]
    fn form_parameters_take_precedence_over_query() {
        let query = AiParams {
            action: Some("get_stats".to_string()),
            query: Some("desde-url".to_string()),
            question: None,
            article_id: Some(1),
        };
        let form = AiParams {
            action: None,
            query: Some("desde-formulario".to_string()),
            question: Some("¿qué es?".to_string()),
            article_id: None,
        };

        let merged = merge_params(query, Some(form));
        assert_eq!(merged.action.as_deref(), Some("get_stats"));
        assert_eq!(merged.query.as_deref(), Some("desde-formulario"));
        assert_eq!(merged.question.as_deref(), Some("¿qué es?"));
        assert_eq!(merged.article_id, Some(1));
    }

    #[test]
    fn summarizes_top_results_for_analysis() {
        let mut rows: Vec<ArticuloSearchRow> = Vec::new();
        for i in 0..7 {
            rows.push(ArticuloSearchRow {
                id: i,
                titulo: format!("Artículo {i}"),
                autor: "Ana Pérez".to_string(),
                resumen: String::new(),
                contenido: String::new(),
                url_documento: None,
                fecha_publicacion: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                categoria_id: 1,
                relevancia_score: 5.0,
                vistas: 0,
                descargas: 0,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
                categoria_nombre: Some("Flora".to_string()),
                keywords: None,
                score: None,
            });
        }

        let resumen = resumen_resultados(&rows);
        assert_eq!(resumen.lines().count(), ANALYSIS_TOP_RESULTS);
        assert!(resumen.starts_with("- Artículo 0 (Ana Pérez, 2024-01-01)"));
    }
}
