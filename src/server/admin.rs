use axum::{
    body::{Bytes, Full},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use akvarium::docker::Engine;
use akvarium::types::CheatingReportRow;

use super::AppState;

#[derive(serde::Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_per_page")]
    per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    20
}

impl PageQuery {
    fn limits(&self) -> (i64, i64) {
        let per_page = self.per_page.abs().max(1);
        let page = self.page.abs().max(1);
        (per_page, per_page * (page - 1))
    }
}

fn pages(total: i64, per_page: i64) -> i64 {
    total / per_page + i64::from(total % per_page > 0)
}

fn internal(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "success": false, "message": message }).into(),
    )
}

// GET /admin/containers
async fn containers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> (StatusCode, Json<Value>) {
    let (limit, offset) = query.limits();

    let total = match state.db.alive_count().await {
        Ok(total) => total,
        Err(e) => return internal(format!("failed to count instances: {e}")),
    };
    match state.db.alive_page(limit, offset).await {
        Ok(instances) => (
            StatusCode::OK,
            json!({ "success": true, "data": {
                "containers": instances,
                "total": total,
                "pages": pages(total, limit),
                "page_start": offset,
            }})
            .into(),
        ),
        Err(e) => internal(format!("failed to list instances: {e}")),
    }
}

#[derive(serde::Deserialize)]
struct UserQuery {
    user_id: i32,
}

// PATCH /admin/container
async fn container_renew(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> (StatusCode, Json<Value>) {
    match state.controller.renew(query.user_id, None).await {
        Ok(instance) => (
            StatusCode::OK,
            json!({
                "success": true,
                "message": "Instance renewed",
                "data": { "renew_count": instance.renew_count },
            })
            .into(),
        ),
        Err(e) => (
            StatusCode::FORBIDDEN,
            json!({ "success": false, "message": e.to_string() }).into(),
        ),
    }
}

// DELETE /admin/container
async fn container_remove(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> (StatusCode, Json<Value>) {
    let engine = match state.engine().await {
        Ok(engine) => engine,
        Err(e) => return internal(e.to_string()),
    };

    match state.controller.remove(&engine, query.user_id).await {
        Ok(removed) => (
            StatusCode::OK,
            json!({ "success": removed, "message": if removed { "Instance removed" } else { "No such instance" } })
                .into(),
        ),
        Err(e) => internal(e.to_string()),
    }
}

// GET /admin/images
async fn images(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let prefix = state.config.docker.image_prefix.clone();
    if prefix.is_empty() {
        return (
            StatusCode::OK,
            json!({ "success": false, "message": "No image prefix configured" }).into(),
        );
    }

    let engine = match state.engine().await {
        Ok(engine) => engine,
        Err(e) => return internal(e.to_string()),
    };

    match engine.images_by_prefix(&prefix).await {
        Ok(images) => (
            StatusCode::OK,
            json!({ "success": true, "data": {
                "total": images.len(),
                "images": images,
                "prefix": prefix,
            }})
            .into(),
        ),
        Err(e) => internal(format!("failed to list images: {e}")),
    }
}

#[derive(serde::Deserialize)]
struct ImageBody {
    name: String,
    #[serde(default)]
    force: bool,
}

// POST /admin/images/pull
async fn image_pull(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImageBody>,
) -> (StatusCode, Json<Value>) {
    let engine = match state.engine().await {
        Ok(engine) => engine,
        Err(e) => return internal(e.to_string()),
    };

    match engine.pull_image(&body.name).await {
        Ok(()) => (
            StatusCode::OK,
            json!({ "success": true, "message": format!("Pulled image {}", body.name) }).into(),
        ),
        Err(e) => internal(format!("failed to pull {}: {e}", body.name)),
    }
}

// DELETE /admin/images
async fn image_remove(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImageBody>,
) -> (StatusCode, Json<Value>) {
    let engine = match state.engine().await {
        Ok(engine) => engine,
        Err(e) => return internal(e.to_string()),
    };

    match engine.remove_image(&body.name, body.force).await {
        Ok(()) => (
            StatusCode::OK,
            json!({ "success": true, "message": format!("Removed image {}", body.name) }).into(),
        ),
        Err(e) => internal(format!("failed to remove {}: {e}", body.name)),
    }
}

// GET /admin/cheating
async fn cheating(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> (StatusCode, Json<Value>) {
    let (limit, offset) = query.limits();

    let stats = match state.db.cheating_stats().await {
        Ok(stats) => stats,
        Err(e) => return internal(format!("failed to get stats: {e}")),
    };
    match state.db.cheating_page(limit, offset).await {
        Ok(attempts) => (
            StatusCode::OK,
            json!({ "success": true, "data": {
                "attempts": attempts,
                "stats": stats,
                "total": stats.total_attempts,
                "pages": pages(stats.total_attempts, limit),
                "page_start": offset,
            }})
            .into(),
        ),
        Err(e) => internal(format!("failed to list attempts: {e}")),
    }
}

pub const REPORT_HEADER: [&str; 11] = [
    "Timestamp",
    "Cheater_ID",
    "Cheater_Name",
    "Victim_ID",
    "Victim_Name",
    "Challenge_ID",
    "Challenge_Name",
    "Challenge_Category",
    "Submitted_Flag",
    "Cheater_IP",
    "User_Agent",
];

fn report_csv(rows: &[CheatingReportRow]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(REPORT_HEADER)?;
    for row in rows {
        writer.write_record([
            row.attempt_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            row.cheater_user_id.to_string(),
            row.cheater_name.clone(),
            row.victim_user_id.to_string(),
            row.victim_name.clone(),
            row.challenge_id.to_string(),
            row.challenge_name.clone(),
            row.challenge_category.clone(),
            row.submitted_flag.clone(),
            row.cheater_ip.clone(),
            row.user_agent.clone(),
        ])?;
    }
    // flushing into a Vec cannot fail
    Ok(writer.into_inner().unwrap())
}

// GET /admin/cheating/export
async fn cheating_export(State(state): State<Arc<AppState>>) -> Response {
    let rows = match state.db.cheating_report().await {
        Ok(rows) => rows,
        Err(e) => return internal(format!("failed to build report: {e}")).into_response(),
    };

    let csv = match report_csv(&rows) {
        Ok(csv) => csv,
        Err(e) => return internal(format!("failed to write csv: {e}")).into_response(),
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/csv")
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"cheating_report_{}.csv\"",
                Utc::now().format("%Y%m%d_%H%M%S")
            ),
        )
        .body(Full::new(Bytes::from(csv)))
        .unwrap()
        .into_response()
}

// POST /admin/cheating/clear
async fn cheating_clear(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let cutoff = Utc::now().naive_utc() - Duration::days(30);
    match state.db.delete_cheating_attempts_before(cutoff).await {
        Ok(n) => (
            StatusCode::OK,
            json!({ "success": true, "message": format!("Cleared {n} cheating records older than 30 days") })
                .into(),
        ),
        Err(e) => internal(format!("failed to clear records: {e}")),
    }
}

// POST /admin/engine/reinit
async fn engine_reinit(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match Engine::connect(&state.config.docker).await {
        Ok(engine) => {
            *state.engine.write().await = Some(engine);
            (
                StatusCode::OK,
                json!({ "success": true, "message": "Engine reinitialized" }).into(),
            )
        }
        // the previous handle, if any, stays in place
        Err(e) => internal(e.to_string()),
    }
}

// /admin/
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/containers", get(containers))
        .route(
            "/container",
            patch(container_renew).delete(container_remove),
        )
        .route("/images", get(images).delete(image_remove))
        .route("/images/pull", post(image_pull))
        .route("/cheating", get(cheating))
        .route("/cheating/export", get(cheating_export))
        .route("/cheating/clear", post(cheating_clear))
        .route("/engine/reinit", post(engine_reinit))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn report_csv_has_fixed_columns() {
        let row = CheatingReportRow {
            attempt_time: NaiveDate::from_ymd_opt(2024, 3, 2)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap(),
            cheater_user_id: 7,
            cheater_name: "mallory".to_string(),
            victim_user_id: 3,
            victim_name: "alice".to_string(),
            challenge_id: 12,
            challenge_name: "heapnote".to_string(),
            challenge_category: "pwn".to_string(),
            submitted_flag: "flag{web_abcd1234}".to_string(),
            cheater_ip: "203.0.113.9".to_string(),
            user_agent: "curl/8.0".to_string(),
        };

        let csv = String::from_utf8(report_csv(&[row]).unwrap()).unwrap();
        let mut lines = csv.lines();

        assert_eq!(lines.next().unwrap(), REPORT_HEADER.join(","));
        let data = lines.next().unwrap();
        assert!(data.starts_with("2024-03-02 10:30:00,7,mallory,3,alice,12,heapnote,pwn,"));
        assert!(data.ends_with("203.0.113.9,curl/8.0"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn page_math() {
        assert_eq!(pages(0, 20), 0);
        assert_eq!(pages(20, 20), 1);
        assert_eq!(pages(21, 20), 2);

        let q = PageQuery {
            page: 3,
            per_page: 20,
        };
        assert_eq!(q.limits(), (20, 40));
    }
}
