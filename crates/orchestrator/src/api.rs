//! HTTP API: version creation, promotion, and the progress stream.
//!
//! App CRUD lives in the account-facing API service; only the
//! build-relevant routes are served here. Version creation spawns a
//! detached build run; the build is never cancelled by the request
//! ending. Creation is also the serialization point for the per-app
//! workspace: a new version is refused while a prior one is still
//! pending or building.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use state::entity::comments;
use state::{Database, VersionStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{Claims, extract_token, verify_token};
use crate::builder::{BuildRequest, Builder};
use crate::config::Config;
use crate::sse;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub bus: Arc<events::EventBus>,
    pub builder: Arc<Builder>,
}

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/apps/{app_id}/versions", post(create_version))
        .route(
            "/apps/{app_id}/versions/{version_id}/promote",
            post(promote_version),
        )
        .route("/versions/{version_id}/progress", get(sse::progress_stream))
        .with_state(app)
}

#[derive(Deserialize)]
struct CreateVersionBody {
    /// Draft comment ids to submit with this version.
    #[serde(default)]
    comments: Vec<String>,
}

fn authenticate(app: &AppState, headers: &HeaderMap) -> Result<Claims, Response> {
    let Some(token) = extract_token(headers, None) else {
        return Err((StatusCode::UNAUTHORIZED, "Missing bearer token").into_response());
    };
    verify_token(&app.config.jwt_secret, &token)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token").into_response())
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    warn!("{}: {}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, context.to_string()).into_response()
}

/// POST /apps/{app_id}/versions: create the next version, attach the
/// named comments, and start an iteration build.
async fn create_version(
    State(app): State<AppState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateVersionBody>,
) -> Response {
    let claims = match authenticate(&app, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    match app.db.get_app_owned(&app_id, &claims.sub).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "App not found").into_response(),
        Err(e) => return internal_error("Failed to load app", e),
    }

    // One workspace per app: refuse a new version while one is in flight.
    match app.db.list_versions(&app_id).await {
        Ok(versions) => {
            if versions.iter().any(|v| {
                matches!(v.status, VersionStatus::Pending | VersionStatus::Building)
            }) {
                return (
                    StatusCode::CONFLICT,
                    "A build is already in progress for this app",
                )
                    .into_response();
            }
        }
        Err(e) => return internal_error("Failed to list versions", e),
    }

    let version = match app.db.create_version(&app_id).await {
        Ok(version) => version,
        Err(e) => return internal_error("Failed to create version", e),
    };

    if let Err(e) = app.db.submit_comments(&body.comments, &version.id).await {
        return internal_error("Failed to submit comments", e);
    }
    // The store returns creation order; the prompt must see the comments
    // in the order the request listed them.
    let comments = match app.db.get_version_comments(&version.id).await {
        Ok(comments) => order_comments(&body.comments, comments),
        Err(e) => {
            warn!("Failed to load submitted comments: {}", e);
            Vec::new()
        }
    };

    info!("Created version {} for app {}", version.id, app_id);
    spawn_build(
        &app,
        BuildRequest {
            version_id: version.id.clone(),
            app_id,
            requirements: String::new(),
            comments,
            owner_email: None,
        },
    );

    (StatusCode::CREATED, Json(version)).into_response()
}

/// POST /apps/{app_id}/versions/{version_id}/promote
async fn promote_version(
    State(app): State<AppState>,
    Path((app_id, version_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let claims = match authenticate(&app, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    match app.db.get_app_owned(&app_id, &claims.sub).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "App not found").into_response(),
        Err(e) => return internal_error("Failed to load app", e),
    }

    match app.db.promote_version(&version_id).await {
        Ok(promoted) => (StatusCode::OK, Json(promoted)).into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

/// Builds run detached under a fresh root: navigating away from the
/// creating request must not cancel them.
fn spawn_build(app: &AppState, request: BuildRequest) {
    let builder = app.builder.clone();
    tokio::spawn(builder.run(request));
}

/// Arrange fetched comments in the order the request submitted them.
/// Ids the fetch did not return are skipped; anything the fetch returned
/// beyond the submitted list (already-attached comments) keeps its place
/// at the end.
fn order_comments(
    submitted_ids: &[String],
    comments: Vec<comments::Model>,
) -> Vec<comments::Model> {
    let mut by_id: HashMap<String, comments::Model> = comments
        .into_iter()
        .map(|comment| (comment.id.clone(), comment))
        .collect();

    let mut ordered: Vec<comments::Model> = submitted_ids
        .iter()
        .filter_map(|id| by_id.remove(id))
        .collect();

    if !by_id.is_empty() {
        let mut rest: Vec<comments::Model> = by_id.into_values().collect();
        rest.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        ordered.extend(rest);
    }

    ordered
}
