//! HTTP routing over [`StewardService`]
//!
//! Every response is an envelope `{ status, message, <kind>: ... }`; errors
//! carry `error` with the variant name instead of a payload.

use crate::service::StewardService;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use steward_core::{Entity, EntityId, Error};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

type AppState = Arc<StewardService>;
type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A core error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_)
            | Error::TypeMismatch { .. }
            | Error::Compile(_)
            | Error::Eval(_)
            | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. } | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NoCapableNode(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            Error::Validation(_) => "validation",
            Error::TypeMismatch { .. } => "type_mismatch",
            Error::NotFound { .. } => "not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Conflict(_) => "conflict",
            Error::Compile(_) => "compile",
            Error::Eval(_) => "eval",
            Error::NoCapableNode(_) => "no_capable_node",
            Error::Json(_) => "json",
            Error::Config(_) | Error::Io(_) | Error::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = json!({
            "status": status.as_u16(),
            "message": self.0.to_string(),
            "error": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}

fn reply<T: Serialize>(status: StatusCode, message: impl Into<String>, kind: &str, body: T) -> ApiResult {
    let body = serde_json::to_value(body).map_err(Error::from)?;
    let mut envelope = serde_json::Map::new();
    envelope.insert("status".into(), json!(status.as_u16()));
    envelope.insert("message".into(), Value::String(message.into()));
    envelope.insert(kind.into(), body);
    Ok((status, Json(Value::Object(envelope))))
}

fn entity(body: Value) -> Result<Entity, ApiError> {
    Ok(Entity::from_value(body)?)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(service: Arc<StewardService>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/nodes", get(list_nodes).post(create_node))
        .route("/nodes/whoami", post(whoami))
        .route("/nodes/:id", get(get_node).put(update_node).delete(delete_node))
        .route("/nodes/:id/tasks", get(node_task))
        .route("/nodes/:id/tasks_blocking", get(node_task_blocking))
        .route("/nodes/:id/tree", get(node_tree))
        .route("/nodes/:id/adventures", get(node_adventures))
        .route("/nodes/:id/solve", post(solve))
        .route("/facts", get(list_facts).post(create_fact))
        .route("/facts/:id", get(get_fact).put(update_fact).delete(delete_fact))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task).put(update_task).delete(delete_task))
        .route("/adventures", get(list_adventures).post(create_adventure))
        .route(
            "/adventures/:id",
            get(get_adventure).put(update_adventure).delete(delete_adventure),
        )
        .route("/adventures/:id/execute", post(execute_adventure))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(service)
}

/// Bind per config and serve until Ctrl-C. Pending long polls are released
/// through the service's shutdown token before the server drains.
pub async fn serve(service: Arc<StewardService>) -> anyhow::Result<()> {
    let server = service.config().server.clone();
    let bind_addr: SocketAddr = format!("{}:{}", server.bind.to_addr(), server.port).parse()?;

    info!("Steward v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!(
        "  Long poll:    {}s",
        service.config().dispatch.long_poll_timeout_secs
    );
    info!(
        "  Adventurator: {}",
        service.config().dispatch.adventurator_capability
    );

    let shutdown = service.shutdown_token().clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                error!("Failed to listen for Ctrl-C");
                return;
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

async fn health_handler(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.health())
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    filter: Option<String>,
}

async fn list_nodes(State(service): State<AppState>, Query(params): Query<ListParams>) -> ApiResult {
    let nodes = match params.filter.as_deref() {
        Some(expression) => service.graph().query_nodes(expression)?,
        None => service.graph().list_nodes(),
    };
    reply(StatusCode::OK, "success", "nodes", nodes)
}

async fn create_node(State(service): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let node = service.graph().create_node(entity(body)?)?;
    reply(StatusCode::CREATED, "node created", "node", node)
}

async fn get_node(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    reply(StatusCode::OK, "success", "node", service.graph().get_node(id)?)
}

async fn update_node(
    State(service): State<AppState>,
    Path(id): Path<EntityId>,
    Json(body): Json<Value>,
) -> ApiResult {
    let node = service.graph().update_node(id, entity(body)?)?;
    reply(StatusCode::OK, "node updated", "node", node)
}

async fn delete_node(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    let node = service.graph().delete_node(id)?;
    reply(StatusCode::OK, "node deleted", "node", node)
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    hostname: String,
}

async fn whoami(State(service): State<AppState>, Json(body): Json<WhoAmI>) -> ApiResult {
    let node = service.register_or_get(&body.hostname)?;
    reply(StatusCode::OK, "success", "node", node)
}

async fn node_task(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    let task = service.pending_task_for_node(id)?;
    reply(StatusCode::OK, "task delivered", "task", task)
}

async fn node_task_blocking(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    match service.long_poll_pending_task(id).await? {
        Some(task) => reply(StatusCode::OK, "task delivered", "task", task),
        None => reply(StatusCode::OK, "no task", "task", Value::Null),
    }
}

async fn node_tree(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    reply(StatusCode::OK, "success", "tree", service.node_tree(id)?)
}

async fn node_adventures(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    let adventures = service.eligible_adventures(id)?;
    reply(StatusCode::OK, "success", "adventures", adventures)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SolveRequest {
    constraints: Vec<String>,
    plan: Option<Value>,
}

async fn solve(
    State(service): State<AppState>,
    Path(id): Path<EntityId>,
    Json(body): Json<SolveRequest>,
) -> ApiResult {
    let outcome = service.solve(id, &body.constraints, body.plan).await?;
    let (status, message) = match &outcome.task {
        Some(_) => (StatusCode::ACCEPTED, "task created"),
        None if outcome.solve.requires_input => (StatusCode::OK, "input required"),
        None => (StatusCode::OK, "not solvable"),
    };
    reply(status, message, "solution", outcome)
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

async fn list_facts(State(service): State<AppState>) -> ApiResult {
    reply(StatusCode::OK, "success", "facts", service.graph().list_facts())
}

async fn create_fact(State(service): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let fact = service.graph().create_fact(entity(body)?)?;
    reply(StatusCode::CREATED, "fact set", "fact", fact)
}

async fn get_fact(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    reply(StatusCode::OK, "success", "fact", service.graph().get_fact(id)?)
}

async fn update_fact(
    State(service): State<AppState>,
    Path(id): Path<EntityId>,
    Json(body): Json<Value>,
) -> ApiResult {
    let fact = service.graph().update_fact(id, entity(body)?)?;
    reply(StatusCode::OK, "fact updated", "fact", fact)
}

async fn delete_fact(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    let fact = service.graph().delete_fact(id)?;
    reply(StatusCode::OK, "fact deleted", "fact", fact)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn list_tasks(State(service): State<AppState>) -> ApiResult {
    reply(StatusCode::OK, "success", "tasks", service.ledger().list())
}

async fn create_task(State(service): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let task = service.create_task(entity(body)?)?;
    reply(StatusCode::CREATED, "task created", "task", task)
}

async fn get_task(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    reply(StatusCode::OK, "success", "task", service.ledger().get(id)?)
}

async fn update_task(
    State(service): State<AppState>,
    Path(id): Path<EntityId>,
    Json(body): Json<Value>,
) -> ApiResult {
    let task = service.update_task(id, entity(body)?)?;
    reply(StatusCode::OK, "task updated", "task", task)
}

async fn delete_task(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    let task = service.ledger().delete(id)?;
    reply(StatusCode::OK, "task deleted", "task", task)
}

// ---------------------------------------------------------------------------
// Adventures
// ---------------------------------------------------------------------------

async fn list_adventures(State(service): State<AppState>) -> ApiResult {
    reply(StatusCode::OK, "success", "adventures", service.catalog().list())
}

async fn create_adventure(State(service): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let adventure = service.catalog().create(entity(body)?)?;
    reply(StatusCode::CREATED, "adventure created", "adventure", adventure)
}

async fn get_adventure(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    reply(StatusCode::OK, "success", "adventure", service.catalog().get(id)?)
}

async fn update_adventure(
    State(service): State<AppState>,
    Path(id): Path<EntityId>,
    Json(body): Json<Value>,
) -> ApiResult {
    let adventure = service.catalog().update(id, entity(body)?)?;
    reply(StatusCode::OK, "adventure updated", "adventure", adventure)
}

async fn delete_adventure(State(service): State<AppState>, Path(id): Path<EntityId>) -> ApiResult {
    let adventure = service.catalog().delete(id)?;
    reply(StatusCode::OK, "adventure deleted", "adventure", adventure)
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    nodes: Vec<EntityId>,
}

async fn execute_adventure(
    State(service): State<AppState>,
    Path(id): Path<EntityId>,
    Json(body): Json<ExecuteRequest>,
) -> ApiResult {
    let task = service.execute_adventure(id, &body.nodes)?;
    reply(StatusCode::ACCEPTED, "adventure dispatched", "task", task)
}
