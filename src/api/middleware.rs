use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::ErrorReport;

use super::error::ApiError;
use super::state::ApiState;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Caller identity copied onto the response for the logging layer.
#[derive(Debug, Clone)]
struct CallerLabel {
    identity: String,
    roles: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext {
        request_id: Uuid::new_v4().to_string(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

/// Resolve the presented token to a [`Principal`]; role checks happen per route.
pub async fn api_auth(
    State(state): State<ApiState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = extract_token(request.headers());
    let principal = match state.auth.authorize(token.as_deref(), &[]) {
        Ok(principal) => principal,
        Err(err) => return ApiError::from(err).into_response(),
    };

    let label = CallerLabel {
        identity: principal.identity.clone(),
        roles: principal.roles_label(),
    };
    request.extensions_mut().insert::<Principal>(principal);

    let mut response = next.run(request).await;
    response.extensions_mut().insert(label);
    response
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    bearer.or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .map(|token| token.trim().to_string())
    })
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let mut response = next.run(request).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let elapsed_ms = start.elapsed().as_millis() as u64;
    let (source, messages) = match response.extensions_mut().remove::<ErrorReport>() {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());
    let request_id = response
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();
    let (identity, roles) = response
        .extensions()
        .get::<CallerLabel>()
        .map(|label| (label.identity.clone(), label.roles.clone()))
        .unwrap_or_default();

    if status.is_server_error() {
        error!(
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            request_id = %request_id,
            identity = %identity,
            roles = %roles,
            "request failed",
        );
    } else {
        warn!(
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            source,
            detail = %detail,
            request_id = %request_id,
            identity = %identity,
            roles = %roles,
            "client request error",
        );
    }

    response
}
