//! Quota checks and guarded creation of teams and players

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use coachhub_billing::{Creation, Decision, Resource};
use coachhub_shared::{PlayerId, TeamId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
}

fn validated_name(raw: &str) -> ApiResult<&str> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Name must not be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "Name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name)
}

/// 201 with the new id when created, 403 with the decision when denied
fn creation_response<Id: Serialize>(creation: Creation<Id>) -> (StatusCode, Json<Creation<Id>>) {
    let status = if creation.is_created() {
        StatusCode::CREATED
    } else {
        StatusCode::FORBIDDEN
    };
    (status, Json(creation))
}

/// GET /api/v1/entitlements/teams
pub async fn can_create_team(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Decision>> {
    let decision = state
        .entitlements
        .can_create(user.user_id, Resource::Team)
        .await?;
    Ok(Json(decision))
}

/// GET /api/v1/teams/{team_id}/entitlements/players
pub async fn can_create_player(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(team_id): Path<Uuid>,
) -> ApiResult<Json<Decision>> {
    let decision = state
        .entitlements
        .can_create(user.user_id, Resource::Player(TeamId(team_id)))
        .await?;
    Ok(Json(decision))
}

/// POST /api/v1/teams
pub async fn create_team(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<Creation<TeamId>>)> {
    let name = validated_name(&req.name)?;
    let creation = state.entitlements.create_team(user.user_id, name).await?;
    Ok(creation_response(creation))
}

/// POST /api/v1/teams/{team_id}/players
pub async fn create_player(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(team_id): Path<Uuid>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<Creation<PlayerId>>)> {
    let name = validated_name(&req.name)?;
    let creation = state
        .entitlements
        .create_player(user.user_id, TeamId(team_id), name)
        .await?;
    Ok(creation_response(creation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_trimmed_and_bounded() {
        assert_eq!(validated_name("  U11 Tigers ").unwrap(), "U11 Tigers");
        assert!(validated_name("   ").is_err());
        assert!(validated_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(validated_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
