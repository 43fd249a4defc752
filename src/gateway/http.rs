//! The wire surface: chat completions, model listing, native passthrough,
//! session control, and observability endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Gateway, HealthGate, RequestContext};
use crate::auth::{extract_header, extract_session_token, Authenticator, Principal};
use crate::types::{now_epoch_seconds, ChatRequest, ErrorEnvelope, ModelsResponse};
use crate::GatewayError;

pub const HEADER_PROVIDER: &str = "x-provider";

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    authenticator: Authenticator,
    health: HealthGate,
    started_at: i64,
}

impl AppState {
    pub fn new(gateway: Gateway, authenticator: Authenticator, health: HealthGate) -> Self {
        Self {
            gateway: Arc::new(gateway),
            authenticator,
            health,
            started_at: now_epoch_seconds(),
        }
    }
}

pub fn router(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/metrics", get(handle_metrics))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_list_models))
        .route("/v1/models/:id", get(handle_get_model))
        .route("/providers/:name/*path", any(handle_passthrough))
        .route("/auth/login", post(handle_login))
        .route("/auth/refresh", post(handle_refresh))
        .route("/auth/logout", post(handle_logout))
        .route("/auth/sessions", get(handle_sessions))
        .with_state(state)
}

fn error_response(err: &GatewayError) -> (StatusCode, Json<ErrorEnvelope>) {
    (err.status(), Json(ErrorEnvelope::from_error(err)))
}

fn client_meta(headers: &HeaderMap) -> (String, String) {
    let ip = extract_header(headers, "x-forwarded-for")
        .map(|chain| chain.split(',').next().unwrap_or("").trim().to_string())
        .unwrap_or_default();
    let user_agent = extract_header(headers, "user-agent").unwrap_or_default();
    (ip, user_agent)
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
) -> Result<Principal, (StatusCode, Json<ErrorEnvelope>)> {
    match state.authenticator.authenticate(headers).await {
        Ok(principal) => Ok(principal),
        Err(err) => {
            state.gateway.metrics().record_auth_failure();
            let (ip, user_agent) = client_meta(headers);
            let _ = state
                .authenticator
                .store()
                .record_audit(
                    None,
                    "auth.rejected",
                    "",
                    &ip,
                    &user_agent,
                    path,
                    err.status().as_u16(),
                )
                .await;
            Err(error_response(&err))
        }
    }
}

async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let path = "/v1/chat/completions";
    let principal = match authenticate(&state, &headers, path).await {
        Ok(principal) => principal,
        Err(rejection) => return rejection.into_response(),
    };

    let (ip, user_agent) = client_meta(&headers);
    let ctx = RequestContext::new(principal.id, path, ip, user_agent)
        .with_preferred_provider(extract_header(&headers, HEADER_PROVIDER));

    tracing::info!(
        request_id = ctx.request_id.as_str(),
        fingerprint = ctx.fingerprint.as_str(),
        model = request.model.as_str(),
        principal = principal.id,
        "chat completion request"
    );

    let result = state.gateway.handle(&ctx, &request).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(err) => err.status(),
    };
    state.gateway.metrics().record_response(result.is_ok());

    let _ = state
        .authenticator
        .store()
        .record_audit(
            Some(principal.id),
            "chat.completions",
            &ctx.fingerprint,
            &ctx.ip_address,
            &ctx.user_agent,
            path,
            status.as_u16(),
        )
        .await;

    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => {
            tracing::warn!(
                request_id = ctx.request_id.as_str(),
                error = %err,
                "chat completion failed"
            );
            error_response(&err).into_response()
        }
    }
}

async fn handle_list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ModelsResponse>, (StatusCode, Json<ErrorEnvelope>)> {
    authenticate(&state, &headers, "/v1/models").await?;
    Ok(Json(state.gateway.models()))
}

async fn handle_get_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(rejection) = authenticate(&state, &headers, "/v1/models").await {
        return rejection.into_response();
    }
    match state.gateway.model(&id) {
        Some(entry) => (StatusCode::OK, Json(entry)).into_response(),
        None => error_response(&GatewayError::UnknownModel { model: id }).into_response(),
    }
}

async fn handle_passthrough(
    State(state): State<AppState>,
    Path((name, path)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = format!("/providers/{name}");
    if let Err(rejection) = authenticate(&state, &headers, &route).await {
        return rejection.into_response();
    }

    let query: Vec<(String, String)> = raw_query
        .as_deref()
        .map(|raw| {
            url_pairs(raw)
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    match state
        .gateway
        .passthrough(&name, method.as_str(), &path, query, body.to_vec())
        .await
    {
        Ok(upstream) => {
            let status =
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, upstream.body).into_response()
        }
        Err(err) => error_response(&err).into_response(),
    }
}

fn url_pairs(raw: &str) -> Vec<(&str, &str)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect()
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    api_key: String,
    #[serde(default)]
    totp_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    session_token: String,
    expires_at: i64,
    expires_in: u64,
    user: String,
    message: String,
}

async fn handle_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorEnvelope>)> {
    let (ip, user_agent) = client_meta(&headers);
    let (token, principal) = state
        .authenticator
        .login(
            &payload.api_key,
            payload.totp_code.as_deref(),
            &ip,
            &user_agent,
        )
        .await
        .map_err(|err| {
            state.gateway.metrics().record_auth_failure();
            error_response(&err)
        })?;

    let _ = state
        .authenticator
        .store()
        .record_audit(
            Some(principal.id),
            "auth.login",
            "",
            &ip,
            &user_agent,
            "/auth/login",
            StatusCode::OK.as_u16(),
        )
        .await;

    let expires_in = state.authenticator.session_lifetime().as_secs();
    Ok(Json(LoginResponse {
        session_token: token,
        expires_at: now_epoch_seconds() + expires_in as i64,
        expires_in,
        user: principal.name,
        message: "login successful".to_string(),
    }))
}

async fn handle_refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorEnvelope>)> {
    let Some(token) = extract_session_token(&headers) else {
        return Err(error_response(&GatewayError::UnknownSession));
    };
    let (ip, user_agent) = client_meta(&headers);
    let (new_token, principal) = state
        .authenticator
        .refresh(&token, &ip, &user_agent)
        .await
        .map_err(|err| error_response(&err))?;

    let expires_in = state.authenticator.session_lifetime().as_secs();
    Ok(Json(LoginResponse {
        session_token: new_token,
        expires_at: now_epoch_seconds() + expires_in as i64,
        expires_in,
        user: principal.name,
        message: "session refreshed".to_string(),
    }))
}

async fn handle_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorEnvelope>)> {
    let Some(token) = extract_session_token(&headers) else {
        return Err(error_response(&GatewayError::UnknownSession));
    };
    state
        .authenticator
        .logout(&token)
        .await
        .map_err(|err| error_response(&err))?;
    Ok(Json(json!({ "message": "session revoked" })))
}

#[derive(Debug, Serialize)]
struct SessionInfo {
    id: i64,
    created_at: i64,
    expires_at: i64,
    last_used_at: Option<i64>,
    ip_address: String,
    user_agent: String,
}

async fn handle_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorEnvelope>)> {
    let Some(token) = extract_session_token(&headers) else {
        return Err(error_response(&GatewayError::UnknownSession));
    };
    let sessions = state
        .authenticator
        .sessions(&token)
        .await
        .map_err(|err| error_response(&err))?;
    let sessions: Vec<SessionInfo> = sessions
        .into_iter()
        .map(|session| SessionInfo {
            id: session.id,
            created_at: session.created_at,
            expires_at: session.expires_at,
            last_used_at: session.last_used_at,
            ip_address: session.ip_address,
            user_agent: session.user_agent,
        })
        .collect();
    Ok(Json(json!({ "sessions": sessions })))
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let providers = state.health.snapshot().await;
    let metrics = state.gateway.metrics();
    let requests = metrics.requests();
    let errors = metrics.responses_err();
    let error_rate = if requests == 0 {
        0.0
    } else {
        errors as f64 / requests as f64
    };

    let healthy = state.health.is_ready();
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "uptime_seconds": now_epoch_seconds() - state.started_at,
        "requests": requests,
        "errors": errors,
        "upstream_failures": metrics.upstream_failures(),
        "error_rate": error_rate,
        "providers": providers,
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn handle_ready(State(state): State<AppState>) -> Response {
    if state.health.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready" })),
        )
            .into_response()
    }
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    let rendered = state.gateway.metrics().render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        rendered,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_pairs_splits_query() {
        assert_eq!(
            url_pairs("a=1&b=2&flag"),
            vec![("a", "1"), ("b", "2"), ("flag", "")]
        );
        assert!(url_pairs("").is_empty());
    }
}
