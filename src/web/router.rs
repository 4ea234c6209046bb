use axum::{
    Router,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    modules::{ai_search, busqueda, publicaciones},
    web::{AppState, admin, auth},
};

pub fn build_router(state: AppState) -> Router {
    // The static frontend is served from another origin; every endpoint
    // answers with a permissive CORS policy.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/auth", get(auth::auth_get).post(auth::auth_post))
        .route(
            "/api/admin_users",
            get(admin::users::dispatch_get).post(admin::users::dispatch_post),
        )
        .merge(publicaciones::router())
        .merge(busqueda::router())
        .merge(ai_search::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}
