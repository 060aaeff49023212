//! Endpoint functions. Mapped routes share one read and one write function;
//! the route's [`RouteDescriptor`] arrives as an extension.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::info;

use crate::auth::{GETTER, Principal};
use crate::domain::CacheRecord;
use crate::error::ErrorReport;

use super::error::ApiError;
use super::state::ApiState;
use super::surface::{RouteDescriptor, validate_body};

fn require_all(principal: &Principal, roles: &[&str]) -> Result<(), ApiError> {
    for role in roles {
        principal.requires(role)?;
    }
    Ok(())
}

pub async fn read_mapped(
    State(state): State<ApiState>,
    Extension(route): Extension<Arc<RouteDescriptor>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<CacheRecord>, ApiError> {
    require_all(&principal, &route.read_roles())?;

    state
        .store
        .read(&route.queue_id, &route.entry_key)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Entry not found"))
}

pub async fn write_mapped(
    State(state): State<ApiState>,
    Extension(route): Extension<Arc<RouteDescriptor>>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_all(&principal, &route.write_roles())?;
    let Some(write) = route.write.as_ref() else {
        return Err(ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "Route is read-only",
            None,
        ));
    };

    let body: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request("Body is not valid JSON", Some(err.to_string())))?;
    let args = validate_body(write, body)?;

    let handler = state.ingestion.resolve_handler(&route.queue_id);
    if let Err(err) = handler.invoke(&write.operation, &args).await {
        let report = ErrorReport::from_error("api::write_mapped", StatusCode::BAD_GATEWAY, &err);
        let mut response = ApiError::from(err).into_response();
        if response.status().is_server_error() {
            report.attach(&mut response);
        }
        return Ok(response);
    }

    info!(
        path = %route.path,
        operation = %write.operation,
        identity = %principal.identity,
        "Write operation invoked"
    );
    Ok(Json(json!({ "status": "ok" })).into_response())
}

pub async fn list_categories(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<String>>, ApiError> {
    principal.requires(GETTER)?;
    Ok(Json(state.store.categories().await.into_iter().collect()))
}

pub async fn list_entries(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(category): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    principal.requires(GETTER)?;
    Ok(Json(state.store.entries(&category).await.into_iter().collect()))
}

/// Generated routes the caller may read, with their declared argument kinds.
pub async fn list_routes(
    Extension(routes): Extension<Arc<Vec<RouteDescriptor>>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<RouteDescriptor>>, ApiError> {
    principal.requires(GETTER)?;
    let visible = routes
        .iter()
        .filter(|route| {
            route
                .read_roles()
                .iter()
                .all(|role| principal.has_role(role))
        })
        .cloned()
        .collect();
    Ok(Json(visible))
}

pub async fn raw_entry(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path((category, entry)): Path<(String, String)>,
) -> Result<Json<CacheRecord>, ApiError> {
    principal.requires(GETTER)?;
    state
        .store
        .read(&category, &entry)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Entry not found"))
}

pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "cache": state.store.backend(),
        "queues": state.ingestion.queues().len(),
    }))
}
