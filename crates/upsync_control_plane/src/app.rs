use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use futures::stream::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};
use upsync_contract::{ConnectivitySnapshot, NewTransfer, RecordId, TransferRecord};

use crate::orchestrator::UploadOrchestrator;

type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: UploadOrchestrator,
    pub connectivity: Arc<watch::Sender<ConnectivitySnapshot>>,
    pub http_auth_token: Option<String>,
    pub require_bearer: bool,
}

impl AppState {
    pub fn new(
        orchestrator: UploadOrchestrator,
        connectivity: Arc<watch::Sender<ConnectivitySnapshot>>,
        http_auth_token: Option<String>,
        require_bearer: bool,
    ) -> Self {
        Self {
            orchestrator,
            connectivity,
            http_auth_token,
            require_bearer,
        }
    }
}

/// Listing item: the record plus the reason text for its last result.
#[derive(Debug, Serialize)]
struct TransferView {
    #[serde(flatten)]
    record: TransferRecord,
    last_result_reason: Option<&'static str>,
}

impl From<TransferRecord> for TransferView {
    fn from(record: TransferRecord) -> Self {
        Self {
            last_result_reason: record.last_result_reason(),
            record,
        }
    }
}

fn views(records: Vec<TransferRecord>) -> Json<Value> {
    let items: Vec<TransferView> = records.into_iter().map(TransferView::from).collect();
    Json(json!({ "items": items }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/v1/transfers", get(list_transfers).post(enqueue_transfer))
        .route("/v1/transfers/pending", get(list_pending))
        .route("/v1/transfers/failed", get(list_failed))
        .route("/v1/transfers/finished", get(list_finished))
        .route("/v1/transfers/stream", get(stream_transfers))
        .route("/v1/transfers/clear-failed", post(clear_failed))
        .route("/v1/transfers/clear-succeeded", post(clear_succeeded))
        .route(
            "/v1/transfers/{id}",
            get(get_transfer).delete(delete_transfer),
        )
        .route("/v1/transfers/{id}/cancel", post(cancel_transfer))
        .route("/v1/transfers/{id}/retry", post(retry_transfer))
        .route("/v1/accounts/{account}/transfers", delete(delete_account_transfers))
        .route("/v1/connectivity", put(update_connectivity).get(get_connectivity))
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn list_transfers(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let records = state.orchestrator.store().list_all().await.map_err(internal_error)?;
    Ok(views(records))
}

async fn list_pending(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let records = state
        .orchestrator
        .store()
        .current_and_pending()
        .await
        .map_err(internal_error)?;
    Ok(views(records))
}

async fn list_failed(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let records = state.orchestrator.store().failed().await.map_err(internal_error)?;
    Ok(views(records))
}

async fn list_finished(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let records = state.orchestrator.store().finished().await.map_err(internal_error)?;
    Ok(views(records))
}

async fn enqueue_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewTransfer>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let record = state
        .orchestrator
        .enqueue(payload)
        .await
        .map_err(internal_error)?;
    let status_url = format!("/v1/transfers/{}", record.id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "id": record.id,
            "transfer_id": record.transfer_id,
            "status": record.status,
            "status_url": status_url
        })),
    ))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .orchestrator
        .store()
        .get_by_id(id)
        .await
        .map_err(internal_error)?;
    match record {
        Some(record) => Ok((StatusCode::OK, Json(TransferView::from(record)))),
        None => Err(not_found()),
    }
}

async fn delete_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<RecordId>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    if state.orchestrator.cancel(id).await.map_err(internal_error)? {
        return Ok((StatusCode::ACCEPTED, Json(json!({ "id": id, "deleted": true }))));
    }
    let deleted = state
        .orchestrator
        .store()
        .delete_by_id(id)
        .await
        .map_err(internal_error)?;
    if deleted {
        Ok((StatusCode::OK, Json(json!({ "id": id, "deleted": true }))))
    } else {
        Err(not_found())
    }
}

async fn cancel_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<RecordId>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    if state.orchestrator.cancel(id).await.map_err(internal_error)? {
        Ok((StatusCode::ACCEPTED, Json(json!({ "id": id, "status": "cancelling" }))))
    } else {
        Err((
            StatusCode::CONFLICT,
            Json(json!({"error":"transfer_not_cancellable"})),
        ))
    }
}

async fn retry_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<RecordId>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    match state.orchestrator.retry(id).await.map_err(internal_error)? {
        Some(successor) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "replaced": id,
                "id": successor.id,
                "transfer_id": successor.transfer_id,
                "status_url": format!("/v1/transfers/{}", successor.id)
            })),
        )),
        None => Err((
            StatusCode::CONFLICT,
            Json(json!({"error":"transfer_not_failed"})),
        )),
    }
}

async fn clear_failed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let deleted = state.orchestrator.store().clear_failed().await.map_err(internal_error)?;
    info!(deleted, "failed transfers cleared");
    Ok(Json(json!({ "deleted": deleted })))
}

async fn clear_succeeded(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let deleted = state
        .orchestrator
        .store()
        .clear_succeeded()
        .await
        .map_err(internal_error)?;
    info!(deleted, "succeeded transfers cleared");
    Ok(Json(json!({ "deleted": deleted })))
}

async fn delete_account_transfers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(account): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let deleted = state
        .orchestrator
        .store()
        .delete_all_for_account(&account)
        .await
        .map_err(internal_error)?;
    info!(account = %account, deleted, "account transfers removed");
    Ok(Json(json!({ "account": account, "deleted": deleted })))
}

async fn get_connectivity(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.connectivity())
}

async fn update_connectivity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(snapshot): Json<ConnectivitySnapshot>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    info!(active = ?snapshot.active, "connectivity changed");
    let body = json!({
        "connected": snapshot.is_connected(),
        "wifi": snapshot.has_wifi(),
    });
    state.connectivity.send_replace(snapshot);
    Ok(Json(body))
}

async fn stream_transfers(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.orchestrator.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(update) => {
                let data = serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(update.event_type()).data(data)))
            }
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.require_bearer {
        return Ok(());
    }

    let token = state.http_auth_token.as_deref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error":"auth_token_required_but_not_configured"})),
        )
    })?;

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if provided == format!("Bearer {token}") {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_bearer_token"})),
        ))
    }
}

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error":"transfer_not_found"})),
    )
}

fn internal_error(error: anyhow::Error) -> ApiError {
    error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error", "detail": error.to_string() })),
    )
}
