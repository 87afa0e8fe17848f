//! HTTP API for twin administration, worker task dispatch, health checks and
//! Prometheus metrics

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use twin_core::dispatch::{DispatchError, DispatcherStats};
use twin_core::{
    Action, AttributeMap, BatchPredictionRequest, Component, ComponentStatus, CreateActionRequest,
    CreateScenarioRequest, CreateTwinRequest, DigitalTwin, DigitalTwinService, Entity, ErrorKind,
    HealthRegistry, MlModel, ModelStatusUpdate, Prediction, PredictionRequest,
    PredictionResponse, RecordKind, RegisterModelRequest, Scenario, StructuredLogger, SyncReport,
    TaskStatus, TwinError, UpdateTwinRequest, WorkTask,
};

/// Longest a worker may park on `/v1/queue/next`
pub const MAX_DEQUEUE_WAIT: Duration = Duration::from_secs(30);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DigitalTwinService>,
    pub health_registry: HealthRegistry,
    pub logger: StructuredLogger,
}

impl AppState {
    pub fn new(
        service: Arc<DigitalTwinService>,
        health_registry: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            service,
            health_registry,
            logger,
        }
    }

    /// Reflect a prediction outcome in the inference component's health.
    /// Only collaborator failures count; caller errors leave it untouched.
    async fn record_inference<T>(&self, outcome: &Result<T, TwinError>) {
        match outcome {
            Ok(_) => self.health_registry.set_healthy(Component::Inference).await,
            Err(e) if e.kind() == ErrorKind::Dependency => {
                self.health_registry
                    .set_degraded(Component::Inference, e.to_string())
                    .await
            }
            Err(_) => {}
        }
    }
}

/// Service error rendered as a JSON body with a matching status code
#[derive(Debug)]
pub struct ApiError(TwinError);

impl From<TwinError> for ApiError {
    fn from(err: TwinError) -> Self {
        ApiError(err)
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match self.0.kind() {
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation"),
            ErrorKind::Capability => (StatusCode::BAD_REQUEST, "capability"),
            ErrorKind::Dependency => (StatusCode::BAD_GATEWAY, "dependency"),
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed on a dependency");
        }

        (
            status,
            Json(json!({ "error": self.0.to_string(), "kind": kind })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// Health and metrics

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

// Twins

#[derive(Debug, Deserialize)]
pub struct ProjectFilter {
    pub project_id: Option<String>,
}

async fn list_twins(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ProjectFilter>,
) -> ApiResult<Json<Vec<DigitalTwin>>> {
    let twins = state
        .service
        .list_twins(filter.project_id.as_deref())
        .await?;
    Ok(Json(twins))
}

async fn create_twin(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTwinRequest>,
) -> ApiResult<(StatusCode, Json<DigitalTwin>)> {
    let twin = state.service.create_twin(request).await?;
    Ok((StatusCode::CREATED, Json(twin)))
}

async fn get_twin(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
) -> ApiResult<Json<DigitalTwin>> {
    Ok(Json(state.service.get_twin(&twin_id).await?))
}

async fn update_twin(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
    Json(request): Json<UpdateTwinRequest>,
) -> ApiResult<Json<DigitalTwin>> {
    Ok(Json(state.service.update_twin(&twin_id, request).await?))
}

async fn delete_twin(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_twin(&twin_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_twin(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
) -> ApiResult<Json<SyncReport>> {
    Ok(Json(state.service.sync_with_storage(&twin_id).await?))
}

// Entities

#[derive(Debug, Deserialize)]
pub struct UpdateEntityBody {
    pub attributes: AttributeMap,
}

async fn list_entities(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
) -> ApiResult<Json<Vec<Entity>>> {
    Ok(Json(state.service.list_entities(&twin_id).await?))
}

async fn get_entity(
    State(state): State<Arc<AppState>>,
    Path((twin_id, entity_id)): Path<(String, String)>,
) -> ApiResult<Json<Entity>> {
    Ok(Json(state.service.get_entity(&twin_id, &entity_id).await?))
}

async fn update_entity(
    State(state): State<Arc<AppState>>,
    Path((twin_id, entity_id)): Path<(String, String)>,
    Json(body): Json<UpdateEntityBody>,
) -> ApiResult<Json<Entity>> {
    let entity = state
        .service
        .update_entity(&twin_id, &entity_id, body.attributes)
        .await?;
    Ok(Json(entity))
}

// Predictions

async fn predict(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
    Json(request): Json<PredictionRequest>,
) -> ApiResult<Json<PredictionResponse>> {
    let outcome = state.service.predict(&twin_id, request).await;
    state.record_inference(&outcome).await;
    Ok(Json(outcome?))
}

async fn batch_predict(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
    Json(request): Json<BatchPredictionRequest>,
) -> ApiResult<Json<Vec<Prediction>>> {
    let outcome = state.service.batch_predict(&twin_id, request).await;
    state.record_inference(&outcome).await;
    Ok(Json(outcome?))
}

async fn list_predictions(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
) -> ApiResult<Json<Vec<Prediction>>> {
    Ok(Json(state.service.list_predictions(&twin_id).await?))
}

// Scenarios

async fn list_scenarios(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
) -> ApiResult<Json<Vec<Scenario>>> {
    Ok(Json(state.service.list_scenarios(&twin_id).await?))
}

async fn create_scenario(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
    Json(request): Json<CreateScenarioRequest>,
) -> ApiResult<(StatusCode, Json<Scenario>)> {
    let scenario = state.service.create_scenario(&twin_id, request).await?;
    Ok((StatusCode::CREATED, Json(scenario)))
}

async fn get_scenario(
    State(state): State<Arc<AppState>>,
    Path((twin_id, scenario_id)): Path<(String, String)>,
) -> ApiResult<Json<Scenario>> {
    Ok(Json(
        state.service.get_scenario(&twin_id, &scenario_id).await?,
    ))
}

async fn delete_scenario(
    State(state): State<Arc<AppState>>,
    Path((twin_id, scenario_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.service.delete_scenario(&twin_id, &scenario_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Actions

async fn list_actions(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
) -> ApiResult<Json<Vec<Action>>> {
    Ok(Json(state.service.list_actions(&twin_id).await?))
}

async fn create_action(
    State(state): State<Arc<AppState>>,
    Path(twin_id): Path<String>,
    Json(request): Json<CreateActionRequest>,
) -> ApiResult<(StatusCode, Json<Action>)> {
    let action = state.service.create_action(&twin_id, request).await?;
    Ok((StatusCode::CREATED, Json(action)))
}

async fn get_action(
    State(state): State<Arc<AppState>>,
    Path((twin_id, action_id)): Path<(String, String)>,
) -> ApiResult<Json<Action>> {
    Ok(Json(state.service.get_action(&twin_id, &action_id).await?))
}

async fn delete_action(
    State(state): State<Arc<AppState>>,
    Path((twin_id, action_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.service.delete_action(&twin_id, &action_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Models

async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ProjectFilter>,
) -> ApiResult<Json<Vec<MlModel>>> {
    let models = state
        .service
        .registry()
        .list(filter.project_id.as_deref())
        .await?;
    Ok(Json(models))
}

async fn register_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterModelRequest>,
) -> ApiResult<(StatusCode, Json<MlModel>)> {
    let model = state.service.registry().register(request).await?;
    Ok((StatusCode::CREATED, Json(model)))
}

async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<MlModel>> {
    Ok(Json(state.service.registry().get(&model_id).await?))
}

async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.registry().delete(&model_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Status report from the out-of-process trainer
async fn update_model_status(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    Json(update): Json<ModelStatusUpdate>,
) -> ApiResult<Json<MlModel>> {
    let model = state
        .service
        .registry()
        .apply_status_update(&model_id, update)
        .await?;
    Ok(Json(model))
}

// Work tasks

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub spec: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStatusRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NextTaskQuery {
    /// Park up to this many milliseconds when the queue is empty
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueLength {
    pub length: usize,
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<(StatusCode, Json<WorkTask>)> {
    if request.task_type.trim().is_empty() {
        return Err(TwinError::validation("task_type must not be empty").into());
    }

    let task = WorkTask::new(request.task_type, request.priority, request.spec);
    state.service.dispatcher().enqueue(task.clone())?;
    info!(
        task_id = %task.id,
        task_type = %task.task_type,
        priority = task.priority,
        "Task submitted"
    );
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<WorkTask>> {
    let task = state
        .service
        .dispatcher()
        .get(&task_id)?
        .ok_or_else(|| TwinError::not_found(RecordKind::Task, task_id.as_str()))?;
    Ok(Json(task))
}

async fn update_task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(request): Json<TaskStatusRequest>,
) -> ApiResult<Json<WorkTask>> {
    let dispatcher = state.service.dispatcher();
    let from = dispatcher
        .get(&task_id)?
        .map(|t| t.status)
        .ok_or_else(|| TwinError::not_found(RecordKind::Task, task_id.as_str()))?;

    let task = dispatcher.update_status(&task_id, request.status, request.error)?;
    state
        .logger
        .log_task_transition(&task_id, &from.to_string(), &task.status.to_string());
    Ok(Json(task))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<WorkTask>> {
    let task = state.service.dispatcher().cancel(&task_id)?;
    state
        .logger
        .log_task_transition(&task_id, "queued", &task.status.to_string());
    Ok(Json(task))
}

/// Hand the most urgent task to a worker, or 204 when none is queued
async fn next_task(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NextTaskQuery>,
) -> ApiResult<Response> {
    let dispatcher = state.service.dispatcher();
    let task = match query.wait_ms {
        Some(ms) if ms > 0 => {
            let wait = Duration::from_millis(ms).min(MAX_DEQUEUE_WAIT);
            dispatcher.dequeue_wait(wait).await?
        }
        _ => dispatcher.dequeue()?,
    };

    Ok(match task {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn queue_length(State(state): State<Arc<AppState>>) -> ApiResult<Json<QueueLength>> {
    let length = state.service.dispatcher().len()?;
    Ok(Json(QueueLength { length }))
}

async fn queue_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<DispatcherStats>> {
    Ok(Json(state.service.dispatcher().stats()?))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/twins", get(list_twins).post(create_twin))
        .route(
            "/v1/twins/:twin_id",
            get(get_twin).patch(update_twin).delete(delete_twin),
        )
        .route("/v1/twins/:twin_id/sync", post(sync_twin))
        .route("/v1/twins/:twin_id/entities", get(list_entities))
        .route(
            "/v1/twins/:twin_id/entities/:entity_id",
            get(get_entity).patch(update_entity),
        )
        .route("/v1/twins/:twin_id/predict", post(predict))
        .route("/v1/twins/:twin_id/predict/batch", post(batch_predict))
        .route("/v1/twins/:twin_id/predictions", get(list_predictions))
        .route(
            "/v1/twins/:twin_id/scenarios",
            get(list_scenarios).post(create_scenario),
        )
        .route(
            "/v1/twins/:twin_id/scenarios/:scenario_id",
            get(get_scenario).delete(delete_scenario),
        )
        .route(
            "/v1/twins/:twin_id/actions",
            get(list_actions).post(create_action),
        )
        .route(
            "/v1/twins/:twin_id/actions/:action_id",
            get(get_action).delete(delete_action),
        )
        .route("/v1/models", get(list_models).post(register_model))
        .route("/v1/models/:model_id", get(get_model).delete(delete_model))
        .route("/v1/models/:model_id/status", post(update_model_status))
        .route("/v1/tasks", post(submit_task))
        .route("/v1/tasks/:task_id", get(get_task))
        .route("/v1/tasks/:task_id/status", post(update_task_status))
        .route("/v1/tasks/:task_id/cancel", post(cancel_task))
        .route("/v1/queue/next", post(next_task))
        .route("/v1/queue/length", get(queue_length))
        .route("/v1/queue/stats", get(queue_stats))
        .with_state(state)
}

/// Start the API server and run until `shutdown` resolves
pub async fn serve<F>(port: u16, state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
