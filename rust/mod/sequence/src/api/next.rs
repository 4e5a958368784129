use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use openerp_core::ServiceError;

use super::{CurrentCaller, ServiceState, blocking};

pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route("/sequences/{id}/next", post(next_by_id))
        .route("/codes/{code}/next", post(next_by_code))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DrawRequest {
    /// Logical date of the document; today when absent.
    #[serde(default)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
struct DrawResponse {
    value: Option<String>,
}

// Each draw is its own transaction. Gap-free draws may block on a row lock,
// so they run on the blocking pool.

async fn next_by_id(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<i64>,
    Json(req): Json<DrawRequest>,
) -> Result<Json<DrawResponse>, ServiceError> {
    let value = blocking(move || {
        svc.with_transaction(caller, |txn| svc.next_by_id(txn, id, req.date))
    })
    .await?;
    Ok(Json(DrawResponse { value: Some(value) }))
}

async fn next_by_code(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Path(code): Path<String>,
    Json(req): Json<DrawRequest>,
) -> Result<Json<DrawResponse>, ServiceError> {
    let value = blocking(move || {
        svc.with_transaction(caller, |txn| svc.next_by_code(txn, &code, req.date))
    })
    .await?;
    Ok(Json(DrawResponse { value }))
}
