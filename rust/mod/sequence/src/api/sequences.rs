use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;

use openerp_core::{ListParams, ListResult, ServiceError};

use super::{CurrentCaller, ServiceState, blocking};
use crate::model::{DateRange, NewDateRange, NewSequence, Sequence};
use crate::service::SequenceFilters;

pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route("/sequences", post(create_sequence).get(list_sequences))
        .route(
            "/sequences/{id}",
            get(get_sequence).patch(update_sequence).delete(delete_sequence),
        )
        .route("/sequences/{id}/ranges", get(list_ranges).post(create_range))
        .route("/ranges/{id}", patch(update_range).delete(delete_range))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SequenceQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    code: Option<String>,
    company_id: Option<i64>,
    active: Option<bool>,
}

// ---------------------------------------------------------------------------
// /sequences
// ---------------------------------------------------------------------------

async fn create_sequence(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Json(input): Json<NewSequence>,
) -> Result<Json<Sequence>, ServiceError> {
    blocking(move || svc.create_sequence(&caller, input))
        .await
        .map(Json)
}

async fn list_sequences(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Query(q): Query<SequenceQuery>,
) -> Result<Json<ListResult<Sequence>>, ServiceError> {
    let defaults = ListParams::default();
    let params = ListParams {
        limit: q.limit.unwrap_or(defaults.limit),
        offset: q.offset.unwrap_or(defaults.offset),
    };
    let filters = SequenceFilters {
        code: q.code,
        company_id: q.company_id,
        active: q.active,
    };
    blocking(move || svc.list_sequences(&caller, &params, &filters))
        .await
        .map(Json)
}

async fn get_sequence(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<i64>,
) -> Result<Json<Sequence>, ServiceError> {
    blocking(move || svc.get_sequence(&caller, id)).await.map(Json)
}

async fn update_sequence(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<i64>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<Sequence>, ServiceError> {
    blocking(move || svc.update_sequence(&caller, id, patch))
        .await
        .map(Json)
}

async fn delete_sequence(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    blocking(move || svc.delete_sequence(&caller, id)).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ---------------------------------------------------------------------------
// date ranges
// ---------------------------------------------------------------------------

async fn list_ranges(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<i64>,
) -> Result<Json<Vec<DateRange>>, ServiceError> {
    blocking(move || svc.list_date_ranges(&caller, id)).await.map(Json)
}

async fn create_range(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<i64>,
    Json(input): Json<NewDateRange>,
) -> Result<Json<DateRange>, ServiceError> {
    blocking(move || svc.create_date_range(&caller, id, input))
        .await
        .map(Json)
}

async fn update_range(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<i64>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<DateRange>, ServiceError> {
    blocking(move || svc.update_date_range(&caller, id, patch))
        .await
        .map(Json)
}

async fn delete_range(
    State(svc): State<ServiceState>,
    CurrentCaller(caller): CurrentCaller,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    blocking(move || svc.delete_date_range(&caller, id)).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use openerp_core::{AllowAll, Caller};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::api::router;
    use crate::service::testing::service_with;

    async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .extension(Caller::new("admin"));
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn sequence_and_range_crud() {
        let app = router(std::sync::Arc::new(service_with(
            std::sync::Arc::new(AllowAll),
            Duration::from_millis(100),
        )));

        let (_, seq) = send(&app, "POST", "/v1/sequences", Some(json!({"name": "Journal", "useDateRange": true, "code": "jrnl"}))).await;
        let id = seq["id"].as_i64().unwrap();
        send(&app, "POST", "/v1/sequences", Some(json!({"name": "Other", "active": false}))).await;

        let (status, list) = send(&app, "GET", "/v1/sequences?active=true&limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["total"], 1);
        assert_eq!(list["items"][0]["code"], "jrnl");

        let (status, range) = send(
            &app,
            "POST",
            &format!("/v1/sequences/{id}/ranges"),
            Some(json!({"dateFrom": "2024-01-01", "dateTo": "2024-06-30", "numberNext": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(range["numberNextActual"], 10);
        let range_id = range["id"].as_i64().unwrap();

        let (status, patched) = send(
            &app,
            "PATCH",
            &format!("/v1/ranges/{range_id}"),
            Some(json!({"dateTo": "2024-03-31"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["dateTo"], "2024-03-31");

        let (_, ranges) = send(&app, "GET", &format!("/v1/sequences/{id}/ranges"), None).await;
        assert_eq!(ranges.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "DELETE", &format!("/v1/ranges/{range_id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, patched) = send(&app, "PATCH", &format!("/v1/sequences/{id}"), Some(json!({"padding": 5, "code": null}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["padding"], 5);
        assert!(patched.get("code").is_none());

        let (status, _) = send(&app, "DELETE", &format!("/v1/sequences/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, "GET", &format!("/v1/sequences/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }
}
