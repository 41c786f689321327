//! HTTP routes

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;

use crate::{
    auth::{require_auth, require_service_role},
    state::AppState,
};

pub mod catalog;
pub mod milestones;
pub mod resources;
pub mod subscription;
pub mod tier_admin;


/// Build the full router: public catalog and health, user routes behind a
/// user token, tier administration behind the service key
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/v1/tiers", get(catalog::list_tiers));

    let protected = Router::new()
        .route("/api/v1/subscription", get(subscription::get_entitlement))
        .route("/api/v1/subscription/trial", post(subscription::start_trial))
        .route("/api/v1/subscription/tier", put(subscription::change_tier))
        .route("/api/v1/entitlements/teams", get(resources::can_create_team))
        .route(
            "/api/v1/teams/{team_id}/entitlements/players",
            get(resources::can_create_player),
        )
        .route("/api/v1/teams", post(resources::create_team))
        .route("/api/v1/teams/{team_id}/players", post(resources::create_player))
        .route("/api/v1/milestones/pending", get(milestones::pending))
        .route("/api/v1/milestones/claim", post(milestones::claim))
        .route(
            "/api/v1/milestones/{key}/acknowledge",
            post(milestones::acknowledge),
        )
        .route_layer(middleware::from_fn_with_state(
            state.jwt_verifier.clone(),
            require_auth,
        ));

    let trusted = Router::new()
        .route(
            "/api/v1/admin/users/{user_id}/tier",
            put(tier_admin::set_user_tier),
        )
        .route_layer(middleware::from_fn_with_state(
            state.jwt_verifier.clone(),
            require_service_role,
        ));

    public.merge(protected).merge(trusted).with_state(state)
}

/// Liveness, plus a database ping when backed by Postgres
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let Some(pool) = &state.pool else {
        return (StatusCode::OK, Json(json!({ "status": "ok" })));
    };

    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "ok" })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check database ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "unavailable" })),
            )
        }
    }
}
