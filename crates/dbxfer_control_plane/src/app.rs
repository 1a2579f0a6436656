use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use dbxfer_contract::{DatabaseInstance, Initiator, SourceRef, TransferEvent};
use dbxfer_engine::{
    AccessPolicy, BroadcastNotifier, InspectionFailure, Rejection, StructureInspector,
    TransferAdmissionController, TransferRequest,
};
use dbxfer_storage::DbxferStorage;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};
use uuid::Uuid;

const INITIATOR_USER: &str = "x-initiator-user";
const INITIATOR_TEAMS: &str = "x-initiator-teams";
const INITIATOR_TEAM: &str = "x-initiator-team";
const MAX_LIST_LIMIT: i64 = 200;

type ApiError = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    transfer_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct AppState {
    pub storage: DbxferStorage,
    pub admission: TransferAdmissionController,
    pub inspector: StructureInspector,
    pub policy: Arc<dyn AccessPolicy>,
    pub notifier: Arc<BroadcastNotifier>,
    pub auth_token: Option<String>,
    pub require_bearer: bool,
}

impl AppState {
    pub fn new(
        storage: DbxferStorage,
        admission: TransferAdmissionController,
        inspector: StructureInspector,
        policy: Arc<dyn AccessPolicy>,
        notifier: Arc<BroadcastNotifier>,
    ) -> Self {
        Self {
            storage,
            admission,
            inspector,
            policy,
            notifier,
            auth_token: None,
            require_bearer: false,
        }
    }

    /// Write endpoints demand `Authorization: Bearer <token>` once this is set.
    pub fn with_bearer_token(mut self, token: Option<String>, required: bool) -> Self {
        self.auth_token = token;
        self.require_bearer = required;
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/v1/transfers", post(post_transfer))
        .route("/v1/transfers/events", get(transfer_events))
        .route("/v1/transfers/{transfer_id}", get(get_transfer))
        .route(
            "/v1/databases/{database_uuid}/transfers",
            get(list_database_transfers),
        )
        .route(
            "/v1/databases/{database_uuid}/structure",
            get(database_structure),
        )
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.storage.ping().await.is_ok();
    let payload = Json(json!({
        "status": if ready { "ready" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339()
    }));

    if ready {
        (StatusCode::OK, payload).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, payload).into_response()
    }
}

async fn post_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TransferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let initiator = initiator_from_headers(&headers)?;

    let record = state
        .admission
        .create(&payload, &initiator)
        .await
        .map_err(rejection_response)?;

    info!(transfer_id = %record.id, user = initiator.user_id, "transfer accepted over http");
    let status_url = format!("/v1/transfers/{}", record.id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, status_url)],
        Json(record),
    ))
}

async fn get_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(transfer_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let initiator = initiator_from_headers(&headers)?;
    let record = state
        .storage
        .get_transfer(transfer_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "transfer_not_found",
                format!("transfer {transfer_id} not found"),
            )
        })?;

    if !initiator.team_ids.contains(&record.team_id) {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "unauthorized",
            "transfer belongs to another team",
        ));
    }
    Ok((StatusCode::OK, Json(record)))
}

async fn list_database_transfers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(database_uuid): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let initiator = initiator_from_headers(&headers)?;
    let database = readable_database(&state, &initiator, &database_uuid).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_LIST_LIMIT);

    let items = state
        .storage
        .list_transfers_for_source(
            SourceRef {
                kind: database.kind,
                id: database.id,
            },
            limit,
        )
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::OK, Json(json!({ "items": items }))))
}

async fn database_structure(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(database_uuid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let initiator = initiator_from_headers(&headers)?;
    readable_database(&state, &initiator, &database_uuid).await?;

    let report = state
        .inspector
        .inspect(&database_uuid)
        .await
        .map_err(inspection_response)?;
    Ok((StatusCode::OK, Json(report)))
}

async fn transfer_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let initiator = initiator_from_headers(&headers)?;
    let stream = visible_events(state.notifier.subscribe(), initiator, query.transfer_id).map(
        |event| {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok::<_, Infallible>(SseEvent::default().event(event.event.as_str()).data(data))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Events for records owned by one of the caller's teams, optionally narrowed to one transfer.
fn visible_events(
    receiver: broadcast::Receiver<TransferEvent>,
    initiator: Initiator,
    only: Option<Uuid>,
) -> impl futures::Stream<Item = TransferEvent> + Send + 'static {
    BroadcastStream::new(receiver).filter_map(move |item| {
        let visible = match item {
            Ok(event)
                if initiator.team_ids.contains(&event.record.team_id)
                    && only.map_or(true, |id| id == event.record.id) =>
            {
                Some(event)
            }
            Ok(_) => None,
            Err(lagged) => {
                warn!(error = %lagged, "event subscriber fell behind");
                None
            }
        };
        async move { visible }
    })
}

async fn readable_database(
    state: &AppState,
    initiator: &Initiator,
    database_uuid: &str,
) -> Result<DatabaseInstance, ApiError> {
    let database = state
        .storage
        .get_database_by_uuid(database_uuid)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "database_not_found",
                format!("database {database_uuid} not found"),
            )
        })?;
    let environment = state
        .storage
        .get_environment(database.environment_id)
        .await
        .map_err(internal_error)?;

    if state
        .policy
        .can_read_database(initiator, &database, environment.as_ref())
    {
        Ok(database)
    } else {
        Err(api_error(
            StatusCode::FORBIDDEN,
            "unauthorized",
            "initiator may not read this database",
        ))
    }
}

/// Identity comes from headers set by the upstream auth layer. Without an explicit
/// `X-Initiator-Team` the first listed team owns new transfers.
fn initiator_from_headers(headers: &HeaderMap) -> Result<Initiator, ApiError> {
    let user_id = header_text(headers, INITIATOR_USER)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "initiator_missing",
                "X-Initiator-User header is missing or not numeric",
            )
        })?;

    let team_ids = match header_text(headers, INITIATOR_TEAMS) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|team| !team.is_empty())
            .map(str::parse::<i64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_initiator_teams",
                    "X-Initiator-Teams must be a comma separated list of team ids",
                )
            })?,
        None => Vec::new(),
    };

    let current_team = match header_text(headers, INITIATOR_TEAM) {
        Some(raw) => Some(raw.trim().parse::<i64>().map_err(|_| {
            api_error(
                StatusCode::BAD_REQUEST,
                "invalid_initiator_team",
                "X-Initiator-Team must be a team id",
            )
        })?),
        None => team_ids.first().copied(),
    };

    Ok(Initiator {
        user_id,
        current_team,
        team_ids,
    })
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.require_bearer {
        return Ok(());
    }

    let token = state.auth_token.as_deref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error":"auth_token_required_but_not_configured"})),
        )
    })?;

    let provided = header_text(headers, header::AUTHORIZATION.as_str()).unwrap_or_default();
    if provided == format!("Bearer {token}") {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error":"invalid_or_missing_bearer_token"})),
        ))
    }
}

fn rejection_status(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::SourceNotFound(_)
        | Rejection::TargetEnvironmentNotFound(_)
        | Rejection::ExistingTargetNotFound(_)
        | Rejection::TargetServerNotFound(_) => StatusCode::NOT_FOUND,
        Rejection::Unauthorized(_) | Rejection::OwnerUnresolved => StatusCode::FORBIDDEN,
        Rejection::TransferInProgress { .. } => StatusCode::CONFLICT,
        Rejection::UnknownMode(_)
        | Rejection::ExistingTargetRequired
        | Rejection::UnexpectedExistingTarget
        | Rejection::OptionsRequired
        | Rejection::OptionsEngineMismatch { .. }
        | Rejection::UnexpectedOptions
        | Rejection::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
        Rejection::UnsupportedEngine(_)
        | Rejection::EngineMismatch { .. }
        | Rejection::TargetOutsideEnvironment(_)
        | Rejection::TargetServerMismatch(_)
        | Rejection::TargetIsSource
        | Rejection::TargetServerUnavailable(_)
        | Rejection::PartialUnsupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Rejection::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection_response(rejection: Rejection) -> ApiError {
    let status = rejection_status(&rejection);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %rejection, "transfer admission failed");
    } else {
        info!(reason = rejection.reason(), detail = %rejection, "transfer rejected");
    }

    let mut body = json!({
        "error": rejection.reason(),
        "detail": rejection.to_string(),
    });
    if let Rejection::TransferInProgress {
        active: Some(active),
    } = &rejection
    {
        body["active_transfer_id"] = json!(active);
    }
    (status, Json(body))
}

fn inspection_response(failure: InspectionFailure) -> ApiError {
    let status = match &failure {
        InspectionFailure::DatabaseNotFound(_) => StatusCode::NOT_FOUND,
        InspectionFailure::UnsupportedEngine(_) => StatusCode::UNPROCESSABLE_ENTITY,
        InspectionFailure::ServerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        InspectionFailure::NotRunning { .. } => StatusCode::CONFLICT,
        InspectionFailure::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %failure, "structure inspection failed");
    }
    api_error(status, failure.reason(), failure.to_string())
}

fn api_error(status: StatusCode, code: &str, detail: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({ "error": code, "detail": detail.into() })),
    )
}

fn internal_error(error: anyhow::Error) -> ApiError {
    error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error", "detail": error.to_string() })),
    )
}
