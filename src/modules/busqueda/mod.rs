use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::warn;

use crate::web::{ApiError, AppState, models::ArticuloSearchRow};

const SEARCH_LIMIT: i64 = 50;

const KEYWORDS_SUBSELECT: &str = "(SELECT string_agg(k.palabra, ', ' ORDER BY k.palabra)
     FROM articulo_keywords ak JOIN keywords k ON k.id = ak.keyword_id
     WHERE ak.articulo_id = a.id) AS keywords";

pub fn router() -> Router<AppState> {
    Router::new().route("/api/search", get(search))
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    year: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    sort: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    success: bool,
    count: usize,
    results: Vec<ArticuloSearchRow>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SortKey {
    Alphabetical,
    Date,
    Author,
    Relevance,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query_term = normalize(params.query.as_deref());
    let category = normalize(params.category.as_deref());
    let year = normalize(params.year.as_deref()).and_then(|y| y.parse::<i32>().ok());
    let author = normalize(params.author.as_deref());
    let sort = parse_sort(params.sort.as_deref());

    let results = run_search(
        state.pool_ref(),
        query_term.as_deref(),
        category.as_deref(),
        year,
        author.as_deref(),
        sort,
    )
    .await?;

    // Search logging and view counters are side effects the response does not
    // depend on; a failure there must not break the search itself.
    if let Some(termino) = &query_term {
        if let Err(err) = registrar_busqueda(state.pool_ref(), termino, results.len()).await {
            warn!(?err, "failed to record search log entry");
        }
    }
    if !results.is_empty() {
        let ids: Vec<i64> = results.iter().map(|row| row.id).collect();
        if let Err(err) = incrementar_vistas(state.pool_ref(), &ids).await {
            warn!(?err, "failed to bump view counters for search results");
        }
    }

    Ok(Json(SearchResponse {
        success: true,
        count: results.len(),
        results,
    }))
}

async fn run_search(
    pool: &PgPool,
    query_term: Option<&str>,
    category: Option<&str>,
    year: Option<i32>,
    author: Option<&str>,
    sort: SortKey,
) -> sqlx::Result<Vec<ArticuloSearchRow>> {
    let mut qb = QueryBuilder::<Postgres>::new(
        "SELECT a.id, a.titulo, a.autor, a.resumen, a.contenido, a.url_documento,
                a.fecha_publicacion, a.categoria_id, a.relevancia_score, a.vistas,
                a.descargas, a.created_at, a.updated_at,
                c.nombre AS categoria_nombre, ",
    );
    qb.push(KEYWORDS_SUBSELECT);

    match query_term {
        Some(term) => {
            qb.push(", ts_rank(a.busqueda, plainto_tsquery('spanish', ");
            qb.push_bind(term.to_string());
            qb.push(")) AS score");
        }
        None => {
            qb.push(", NULL::real AS score");
        }
    }

    qb.push(
        " FROM articulos a
          LEFT JOIN categorias c ON c.id = a.categoria_id
          WHERE 1=1",
    );

    if let Some(term) = query_term {
        let like = format!("%{term}%");
        qb.push(" AND (a.busqueda @@ plainto_tsquery('spanish', ");
        qb.push_bind(term.to_string());
        qb.push(") OR a.titulo ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR a.resumen ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR a.contenido ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR a.autor ILIKE ");
        qb.push_bind(like);
        qb.push(")");
    }

    if let Some(category) = category {
        // The frontend sends either the numeric id or the display name.
        match category.parse::<i32>() {
            Ok(categoria_id) => {
                qb.push(" AND a.categoria_id = ");
                qb.push_bind(categoria_id);
            }
            Err(_) => {
                qb.push(" AND c.nombre ILIKE ");
                qb.push_bind(category.to_string());
            }
        }
    }

    if let Some(year) = year {
        qb.push(" AND EXTRACT(YEAR FROM a.fecha_publicacion) = ");
        qb.push_bind(year);
    }

    if let Some(author) = author {
        qb.push(" AND a.autor ILIKE ");
        qb.push_bind(format!("%{author}%"));
    }

    qb.push(order_clause(sort, query_term.is_some()));
    qb.push(" LIMIT ");
    qb.push_bind(SEARCH_LIMIT);

    qb.build_query_as::<ArticuloSearchRow>().fetch_all(pool).await
}

async fn registrar_busqueda(pool: &PgPool, termino: &str, resultados: usize) -> sqlx::Result<()> {
    sqlx::query("INSERT INTO busquedas (termino_busqueda, resultados_encontrados) VALUES ($1, $2)")
        .bind(termino)
        .bind(resultados as i32)
        .execute(pool)
        .await?;
    Ok(())
}

async fn incrementar_vistas(pool: &PgPool, ids: &[i64]) -> sqlx::Result<()> {
    sqlx::query("UPDATE articulos SET vistas = vistas + 1 WHERE id = ANY($1)")
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(())
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_sort(sort: Option<&str>) -> SortKey {
    match sort.unwrap_or("relevance") {
        "alphabetical" => SortKey::Alphabetical,
        "year" | "date" => SortKey::Date,
        "author" => SortKey::Author,
        _ => SortKey::Relevance,
    }
}

fn order_clause(sort: SortKey, with_query: bool) -> &'static str {
    match sort {
        SortKey::Alphabetical => " ORDER BY a.titulo ASC",
        SortKey::Date => " ORDER BY a.fecha_publicacion DESC",
        SortKey::Author => " ORDER BY a.autor ASC",
        SortKey::Relevance if with_query => {
            " ORDER BY score DESC NULLS LAST, a.relevancia_score DESC, a.fecha_publicacion DESC"
        }
        SortKey::Relevance => " ORDER BY a.relevancia_score DESC, a.fecha_publicacion DESC",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literal_sort_keys() {
        assert_eq!(parse_sort(Some("alphabetical")), SortKey::Alphabetical);
        assert_eq!(parse_sort(Some("year")), SortKey::Date);
        assert_eq!(parse_sort(Some("date")), SortKey::Date);
        assert_eq!(parse_sort(Some("author")), SortKey::Author);
        assert_eq!(parse_sort(Some("relevance")), SortKey::Relevance);
        assert_eq!(parse_sort(Some("anything-else")), SortKey::Relevance);
        assert_eq!(parse_sort(None), SortKey::Relevance);
    }

    #[test]
    fn relevance_ordering_uses_fulltext_score_only_with_a_query() {
        assert!(order_clause(SortKey::Relevance, true).contains("score DESC"));
        assert!(!order_clause(SortKey::Relevance, false).contains("score"));
    }

    #[test]
    fn fixed_sorts_ignore_query_presence() {
        assert_eq!(
            order_clause(SortKey::Alphabetical, true),
            order_clause(SortKey::Alphabetical, false)
        );
        assert_eq!(order_clause(SortKey::Date, true), " ORDER BY a.fecha_publicacion DESC");
        assert_eq!(order_clause(SortKey::Author, false), " ORDER BY a.autor ASC");
    }

    #[test]
    fn normalizes_blank_parameters_to_none() {
        assert_eq!(normalize(Some("  ")), None);
        assert_eq!(normalize(Some("")), None);
        assert_eq!(normalize(None), None);
        assert_eq!(normalize(Some(" raices ")), Some("raices".to_string()));
    }
}
