use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use akvarium::detector::{SubmissionContext, Verdict};
use akvarium::lifecycle::LifecycleError;

use super::AppState;

#[derive(serde::Deserialize)]
struct ContainerQuery {
    user_id: i32,
    challenge_id: i32,
}

#[derive(serde::Deserialize)]
struct UserQuery {
    user_id: i32,
}

fn reject(e: LifecycleError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        LifecycleError::MaxInstances
        | LifecycleError::MaxRenewals
        | LifecycleError::Conflict(_)
        | LifecycleError::NoInstance
        | LifecycleError::UnknownChallenge(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        json!({ "success": false, "message": e.to_string() }).into(),
    )
}

fn internal(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "success": false, "message": message }).into(),
    )
}

// GET /container
async fn container_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContainerQuery>,
) -> (StatusCode, Json<Value>) {
    match state.controller.current(query.user_id).await {
        Ok(None) => (
            StatusCode::OK,
            json!({ "success": true, "data": {} }).into(),
        ),
        Ok(Some(instance)) if instance.challenge_id != query.challenge_id => {
            let name = state
                .db
                .challenge(instance.challenge_id)
                .await
                .ok()
                .flatten()
                .map(|challenge| challenge.name)
                .unwrap_or_else(|| instance.challenge_id.to_string());
            (
                StatusCode::FORBIDDEN,
                json!({
                    "success": false,
                    "message": format!("Instance already started but not from this challenge ({name})"),
                })
                .into(),
            )
        }
        Ok(Some(instance)) => (
            StatusCode::OK,
            json!({ "success": true, "data": {
                "lan_domain": instance.engine_key(),
                "remaining_time": state.controller.remaining_seconds(&instance),
                "renew_count": instance.renew_count,
                "challenge_id": instance.challenge_id,
            }})
            .into(),
        ),
        Err(e) => internal(format!("failed to look up instance: {e}")),
    }
}

// POST /container
async fn container_start(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContainerQuery>,
) -> (StatusCode, Json<Value>) {
    let engine = match state.engine().await {
        Ok(engine) => engine,
        Err(e) => return internal(e.to_string()),
    };

    match state
        .controller
        .start(&engine, query.user_id, query.challenge_id)
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            json!({ "success": true, "message": "Instance started" }).into(),
        ),
        Err(e) => reject(e),
    }
}

// PATCH /container
async fn container_renew(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContainerQuery>,
) -> (StatusCode, Json<Value>) {
    match state
        .controller
        .renew(query.user_id, Some(query.challenge_id))
        .await
    {
        Ok(instance) => (
            StatusCode::OK,
            json!({
                "success": true,
                "message": "Instance renewed",
                "data": { "renew_count": instance.renew_count },
            })
            .into(),
        ),
        Err(e) => reject(e),
    }
}

// DELETE /container
async fn container_remove(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> (StatusCode, Json<Value>) {
    let engine = match state.engine().await {
        Ok(engine) => engine,
        Err(e) => return internal(e.to_string()),
    };

    match state.controller.remove(&engine, query.user_id).await {
        Ok(true) => (
            StatusCode::OK,
            json!({ "success": true, "message": "Instance removed" }).into(),
        ),
        Ok(false) => (
            StatusCode::FORBIDDEN,
            json!({ "success": false, "message": "No instance running" }).into(),
        ),
        Err(e) => reject(e),
    }
}

#[derive(serde::Deserialize)]
struct AttemptBody {
    user_id: i32,
    challenge_id: i32,
    submission: String,
}

// POST /attempt
async fn attempt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AttemptBody>,
) -> (StatusCode, Json<Value>) {
    let challenge = match state.db.challenge(body.challenge_id).await {
        Ok(Some(challenge)) => challenge,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                json!({ "success": false, "message": "No such challenge" }).into(),
            )
        }
        Err(e) => return internal(format!("failed to load challenge: {e}")),
    };

    let ctx = SubmissionContext {
        ip: client_ip(&headers),
        user_agent: header_value(&headers, header::USER_AGENT.as_str()),
    };

    match state
        .detector
        .check(&body.submission, &challenge, body.user_id, &ctx)
        .await
    {
        Ok(Verdict::Correct) => (
            StatusCode::OK,
            json!({ "success": true, "message": "Correct" }).into(),
        ),
        Ok(Verdict::NoInstance) => (
            StatusCode::FORBIDDEN,
            json!({ "success": false, "message": "Please solve it while your instance is running" })
                .into(),
        ),
        // a detected cheating attempt reads exactly like a miss
        Ok(Verdict::Incorrect) | Ok(Verdict::Cheating { .. }) => (
            StatusCode::OK,
            json!({ "success": false, "message": "Incorrect" }).into(),
        ),
        Err(e) => internal(format!("flag check failed: {e}")),
    }
}

#[derive(serde::Deserialize)]
struct SolvedBody {
    user_id: i32,
    challenge_id: i32,
}

// POST /solved
async fn solved(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SolvedBody>,
) -> (StatusCode, Json<Value>) {
    match state
        .controller
        .record_solved(body.user_id, body.challenge_id)
        .await
    {
        Ok(recorded) => (
            StatusCode::OK,
            json!({ "success": true, "data": { "recorded": recorded } }).into(),
        ),
        Err(e) => reject(e),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// The subsystem sits behind the platform's proxy; the client address
/// arrives in forwarding headers.
fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = header_value(headers, "x-forwarded-for");
    if let Some(first) = forwarded.split(',').next() {
        if !first.trim().is_empty() {
            return first.trim().to_string();
        }
    }
    header_value(headers, "x-real-ip")
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/container",
            get(container_info)
                .post(container_start)
                .patch(container_renew)
                .delete(container_remove),
        )
        .route("/attempt", post(attempt))
        .route("/solved", post(solved))
        .with_state(state)
}
