//! Route handlers for tickets, transitions and confirmation codes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use fieldops_engine::{
    Actor, CodePurpose, ErrorBody, NewTicket, Role, TicketState, TransitionError,
    TransitionPayload, TransitionResult,
};
use serde::Deserialize;

use super::json_error;
use super::state::AppState;

/// HTTP status for each lifecycle error.
pub(crate) fn status_for(e: &TransitionError) -> StatusCode {
    match e {
        TransitionError::NotFound { .. } => StatusCode::NOT_FOUND,
        TransitionError::InvalidTransition { .. } => StatusCode::CONFLICT,
        TransitionError::RoleForbidden { .. } | TransitionError::IssueForbidden { .. } => {
            StatusCode::FORBIDDEN
        }
        TransitionError::MissingPhotos { .. }
        | TransitionError::MissingNotes { .. }
        | TransitionError::MissingTechnician { .. }
        | TransitionError::ConfirmationRequired
        | TransitionError::ConfirmationInvalid
        | TransitionError::ConfirmationExpired => StatusCode::UNPROCESSABLE_ENTITY,
        TransitionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &TransitionError) -> Response {
    let body = serde_json::json!({ "error": ErrorBody::from(e) });
    (status_for(e), Json(body)).into_response()
}

fn bad_request(message: &str) -> Response {
    error_response(&TransitionError::InvalidRequest(message.to_string()))
}

/// The acting identity, trusted from `X-Actor-Id` / `X-Actor-Role`.
fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, Response> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let id = header("x-actor-id").ok_or_else(|| bad_request("missing X-Actor-Id header"))?;
    let role = header("x-actor-role")
        .ok_or_else(|| bad_request("missing X-Actor-Role header"))?
        .parse::<Role>()
        .map_err(|e| bad_request(&e.to_string()))?;
    Ok(Actor::new(id, role))
}

fn parse_state(name: &str) -> Result<TicketState, Response> {
    name.parse().map_err(|e: fieldops_engine::UnknownName| bad_request(&e.to_string()))
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// GET /policy
pub(crate) async fn handle_policy(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let policy = state.service.executor().policy();
    let edges: Vec<_> = policy.entries().collect();
    let response = serde_json::json!({
        "edges": edges,
        "analysis": policy.analyze(),
    });
    (StatusCode::OK, Json(response))
}

/// POST /tickets
pub(crate) async fn handle_create_ticket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(new): Json<NewTicket>,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(a) => a,
        Err(response) => return response,
    };
    match state.service.create_ticket(&new, &actor).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    state: Option<String>,
}

/// GET /tickets?state=
pub(crate) async fn handle_list_tickets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = match query.state.as_deref().map(parse_state).transpose() {
        Ok(f) => f,
        Err(response) => return response,
    };
    match state.service.executor().list_tickets(filter).await {
        Ok(tickets) => (StatusCode::OK, Json(serde_json::json!({ "tickets": tickets }))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /tickets/{id}
pub(crate) async fn handle_get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.service.executor().get_ticket(&id).await {
        Ok(ticket) => (StatusCode::OK, Json(ticket)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /tickets/{id}/history
pub(crate) async fn handle_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.service.executor().history(&id).await {
        Ok(history) => (StatusCode::OK, Json(serde_json::json!({ "history": history }))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /tickets/{id}/time-log
pub(crate) async fn handle_time_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let executor = state.service.executor();
    let entries = match executor.time_logs(&id).await {
        Ok(entries) => entries,
        Err(e) => return error_response(&e),
    };
    match executor.time_report(&id).await {
        Ok(report) => (
            StatusCode::OK,
            Json(serde_json::json!({ "entries": entries, "report": report })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /tickets/{id}/locations
pub(crate) async fn handle_locations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.service.executor().location_samples(&id).await {
        Ok(samples) => {
            (StatusCode::OK, Json(serde_json::json!({ "locations": samples }))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET /tickets/{id}/transitions
pub(crate) async fn handle_available_transitions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(a) => a,
        Err(response) => return response,
    };
    match state
        .service
        .executor()
        .available_transitions(&id, actor.role)
        .await
    {
        Ok(targets) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ticket_id": id,
                "role": actor.role,
                "available": targets,
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TransitionRequest {
    to: String,
    #[serde(flatten)]
    payload: TransitionPayload,
}

/// POST /tickets/{id}/transitions
pub(crate) async fn handle_transition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<TransitionRequest>,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(a) => a,
        Err(response) => return response,
    };
    let to = match parse_state(&request.to) {
        Ok(to) => to,
        Err(response) => return response,
    };

    let result = state
        .service
        .execute_transition(&id, to, &actor, &request.payload)
        .await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => status_for(e),
    };
    (status, Json(TransitionResult::from(&result))).into_response()
}

fn default_purpose() -> CodePurpose {
    CodePurpose::Completion
}

#[derive(Debug, Deserialize)]
pub(crate) struct IssueCodeRequest {
    #[serde(default)]
    phone: Option<String>,
    #[serde(default = "default_purpose")]
    purpose: CodePurpose,
}

/// POST /tickets/{id}/confirmation-codes
///
/// The response never contains the code itself; it only reaches the phone.
pub(crate) async fn handle_issue_code(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<IssueCodeRequest>,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(a) => a,
        Err(response) => return response,
    };
    match state
        .service
        .issue_confirmation_code(&id, request.phone.as_deref(), request.purpose, &actor)
        .await
    {
        Ok(issued) => (StatusCode::CREATED, Json(issued)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct VerifyCodeRequest {
    #[serde(default)]
    phone: Option<String>,
    #[serde(default = "default_purpose")]
    purpose: CodePurpose,
    code: String,
}

/// POST /tickets/{id}/confirmation-codes/verify
pub(crate) async fn handle_verify_code(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<VerifyCodeRequest>,
) -> Response {
    match state
        .service
        .verify_confirmation_code(&id, request.phone.as_deref(), request.purpose, &request.code)
        .await
    {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "result": result,
                "verified": result.is_verified(),
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use fieldops_storage::StorageError;

    #[test]
    fn error_statuses() {
        let cases = [
            (
                TransitionError::NotFound {
                    ticket_id: "t".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                TransitionError::InvalidTransition {
                    from: TicketState::New,
                    to: TicketState::Completed,
                },
                StatusCode::CONFLICT,
            ),
            (TransitionError::ConfirmationRequired, StatusCode::UNPROCESSABLE_ENTITY),
            (
                TransitionError::IssueForbidden {
                    role: Role::Technician,
                    purpose: CodePurpose::Login,
                },
                StatusCode::FORBIDDEN,
            ),
            (
                TransitionError::Transient("lock".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                TransitionError::Storage(StorageError::Timeout {
                    key: "ticket:t".to_string(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                TransitionError::Storage(StorageError::Backend("disk".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(status_for(&error), status, "{error}");
        }
    }

    #[test]
    fn actor_headers_required_and_parsed() {
        let mut headers = HeaderMap::new();
        assert!(actor_from_headers(&headers).is_err());

        headers.insert("x-actor-id", HeaderValue::from_static("tech-1"));
        headers.insert("x-actor-role", HeaderValue::from_static("janitor"));
        assert!(actor_from_headers(&headers).is_err());

        headers.insert("x-actor-role", HeaderValue::from_static("technician"));
        let actor = actor_from_headers(&headers).unwrap();
        assert_eq!(actor, Actor::new("tech-1", Role::Technician));
    }

    #[test]
    fn transition_request_flattens_payload() {
        let request: TransitionRequest = serde_json::from_str(
            r#"{"to": "diagnosed", "notes": "relay", "photos": ["p1"]}"#,
        )
        .unwrap();
        assert_eq!(request.to, "diagnosed");
        assert_eq!(request.payload.notes.as_deref(), Some("relay"));
        assert_eq!(request.payload.photos, vec!["p1".to_string()]);
        assert!(request.payload.confirmation_code.is_none());
    }
}
