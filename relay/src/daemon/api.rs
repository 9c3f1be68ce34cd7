//! HTTP control surface
//!
//! Every route except `POST /execute` answers with a [`relay_common::Envelope`].

use std::time::{Duration, Instant};

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use relay_common::{ApiError, Envelope, ErrorCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::lifecycle::DaemonState;
use super::registry::DaemonDescriptor;
use crate::command::{CommandExecutor, CommandOutput, CommandRequest, CommandRunner};
use crate::pool::{ConnectionRecord, PooledConnection};

/// Delay between acknowledging `POST /shutdown` and starting the teardown
const SHUTDOWN_DELAY: Duration = Duration::from_millis(100);

type ApiResponse = (StatusCode, Json<Envelope<Value>>);

/// State shared by every route
#[derive(Clone)]
pub struct ApiState {
    pub executor: CommandExecutor,
    pub descriptor: DaemonDescriptor,
    pub started: Instant,
    pub state: watch::Receiver<DaemonState>,
    pub shutdown: CancellationToken,
}

/// `GET /status` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub pid: u32,
    pub parent_pid: u32,
    pub port: u16,
    pub uptime_secs: u64,
    pub state: DaemonState,
    pub servers: usize,
    pub connections: usize,
    pub version: String,
}

/// Result of a connection-creating route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionResponse {
    /// `created` or `noop`
    pub status: String,
    pub connection: ConnectionRecord,
}

impl From<PooledConnection> for ConnectionResponse {
    fn from(conn: PooledConnection) -> Self {
        Self {
            status: if conn.created { "created" } else { "noop" }.to_string(),
            connection: conn.record,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectBody {
    pub instance: Option<String>,
    /// Pick the next free numeric instance tag
    #[serde(default)]
    pub generate: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstanceQuery {
    pub instance: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvokeBody {
    #[serde(default)]
    pub arguments: Option<Map<String, Value>>,
    pub instance: Option<String>,
}

/// Build the control-surface router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/shutdown", post(shutdown))
        .route("/servers", get(list_servers))
        .route("/servers/:name", get(get_server))
        .route(
            "/servers/:name/connections",
            get(list_server_connections)
                .post(create_connection)
                .delete(delete_default_connection),
        )
        .route(
            "/servers/:name/connections/:instance",
            get(get_instance_connection).delete(delete_instance_connection),
        )
        .route("/servers/:name/reconnect", post(reconnect))
        .route("/connections", get(list_connections))
        .route(
            "/connections/:id",
            get(get_connection).delete(delete_connection),
        )
        .route("/servers/:name/tools", get(list_tools))
        .route("/servers/:name/tools/:tool", get(describe_tool))
        .route("/servers/:name/tools/:tool/invoke", post(invoke_tool))
        .route("/execute", post(execute))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::BackendNotFound | ErrorCode::ConnectionNotFound | ErrorCode::ToolNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorCode::NotConnected => StatusCode::CONFLICT,
        ErrorCode::InvalidIdFormat | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::ExecutionFailed => StatusCode::BAD_GATEWAY,
    }
}

fn failure(error: ApiError) -> ApiResponse {
    (status_for(error.code), Json(Envelope::err(error)))
}

/// Optional JSON body: empty means `T::default()`, malformed is `invalid-request`
///
/// No content type is required so bare `curl -X POST` calls work.
pub struct JsonOrDefault<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonOrDefault<T>
where
    T: DeserializeOwned + Default,
    S: Send + Sync,
{
    type Rejection = ApiResponse;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            failure(ApiError::invalid_request(format!(
                "failed to read request body: {}",
                e
            )))
        })?;
        parse_body(&bytes).map(Self).map_err(failure)
    }
}

/// Query string whose rejection is an envelope
pub struct QueryParams<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for QueryParams<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiResponse;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(failure(ApiError::invalid_request(rejection.body_text()))),
        }
    }
}

fn parse_body<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError::invalid_request(format!("invalid request body: {}", e)))
}

fn to_value<T: Serialize>(data: T) -> Result<Value, ApiError> {
    serde_json::to_value(data)
        .map_err(|e| ApiError::execution_failed(format!("failed to encode response: {}", e)))
}

fn respond<T: Serialize>(result: Result<T, ApiError>) -> ApiResponse {
    respond_with(StatusCode::OK, result)
}

fn respond_with<T: Serialize>(status: StatusCode, result: Result<T, ApiError>) -> ApiResponse {
    match result.and_then(to_value) {
        Ok(value) => (status, Json(Envelope::ok(value))),
        Err(e) => failure(e),
    }
}

fn respond_list<T: Serialize>(items: Vec<T>) -> ApiResponse {
    let count = items.len();
    match to_value(items) {
        Ok(value) => (StatusCode::OK, Json(Envelope::ok_counted(value, count))),
        Err(e) => failure(e),
    }
}

fn parse_id(raw: &str) -> Result<u64, ApiError> {
    raw.parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::invalid_id(raw))
}

// ============================================================================
// Daemon
// ============================================================================

async fn status(State(state): State<ApiState>) -> ApiResponse {
    let current = *state.state.borrow();
    let status = DaemonStatus {
        pid: state.descriptor.pid,
        parent_pid: state.descriptor.parent_pid,
        port: state.descriptor.port,
        uptime_secs: state.started.elapsed().as_secs(),
        state: current,
        servers: state.executor.catalog().names().await.len(),
        connections: state.executor.pool().len().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    respond(Ok::<_, ApiError>(status))
}

async fn shutdown(State(state): State<ApiState>) -> ApiResponse {
    tracing::info!("Shutdown requested over the control surface");
    let token = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_DELAY).await;
        token.cancel();
    });
    respond(Ok::<_, ApiError>(
        serde_json::json!({ "message": "shutting down" }),
    ))
}

// ============================================================================
// Servers and connections
// ============================================================================

async fn list_servers(State(state): State<ApiState>) -> ApiResponse {
    respond_list(state.executor.list_servers().await)
}

async fn get_server(State(state): State<ApiState>, Path(name): Path<String>) -> ApiResponse {
    respond(state.executor.describe_server(&name).await)
}

async fn list_server_connections(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResponse {
    if let Err(e) = state.executor.server_config(&name).await {
        return failure(e);
    }
    respond_list(state.executor.list_connections(Some(&name)).await)
}

async fn create_connection(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    JsonOrDefault(body): JsonOrDefault<ConnectBody>,
) -> ApiResponse {
    match state
        .executor
        .connect(&name, body.instance.as_deref(), body.generate)
        .await
    {
        Ok(conn) if conn.created => {
            respond_with(StatusCode::CREATED, Ok(ConnectionResponse::from(conn)))
        }
        Ok(conn) => respond(Ok(ConnectionResponse::from(conn))),
        Err(e) => failure(e),
    }
}

async fn delete_default_connection(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResponse {
    respond(state.executor.disconnect(&name, None).await)
}

async fn get_instance_connection(
    State(state): State<ApiState>,
    Path((name, instance)): Path<(String, String)>,
) -> ApiResponse {
    let found = state
        .executor
        .pool()
        .get(&name, Some(&instance))
        .await
        .map(|c| c.record)
        .ok_or_else(|| ApiError::connection_not_found(format!("{}#{}", name, instance)));
    respond(found)
}

async fn delete_instance_connection(
    State(state): State<ApiState>,
    Path((name, instance)): Path<(String, String)>,
) -> ApiResponse {
    respond(state.executor.disconnect(&name, Some(&instance)).await)
}

async fn reconnect(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    JsonOrDefault(body): JsonOrDefault<ConnectBody>,
) -> ApiResponse {
    respond(
        state
            .executor
            .reconnect(&name, body.instance.as_deref())
            .await
            .map(|conn| ConnectionResponse {
                status: "reconnected".to_string(),
                connection: conn.record,
            }),
    )
}

async fn list_connections(State(state): State<ApiState>) -> ApiResponse {
    respond_list(state.executor.list_connections(None).await)
}

async fn get_connection(State(state): State<ApiState>, Path(raw): Path<String>) -> ApiResponse {
    let id = match parse_id(&raw) {
        Ok(id) => id,
        Err(e) => return failure(e),
    };
    let found = state
        .executor
        .pool()
        .get_by_id(id)
        .await
        .map(|c| c.record)
        .ok_or_else(|| ApiError::connection_not_found(id));
    respond(found)
}

async fn delete_connection(State(state): State<ApiState>, Path(raw): Path<String>) -> ApiResponse {
    match parse_id(&raw) {
        Ok(id) => respond(state.executor.disconnect_by_id(id).await),
        Err(e) => failure(e),
    }
}

// ============================================================================
// Tools
// ============================================================================

async fn list_tools(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    QueryParams(query): QueryParams<InstanceQuery>,
) -> ApiResponse {
    match state
        .executor
        .list_tools(&name, query.instance.as_deref())
        .await
    {
        Ok(tools) => respond_list(tools),
        Err(e) => failure(e),
    }
}

async fn describe_tool(
    State(state): State<ApiState>,
    Path((name, tool)): Path<(String, String)>,
    QueryParams(query): QueryParams<InstanceQuery>,
) -> ApiResponse {
    respond(
        state
            .executor
            .describe_tool(&name, &tool, query.instance.as_deref())
            .await,
    )
}

async fn invoke_tool(
    State(state): State<ApiState>,
    Path((name, tool)): Path<(String, String)>,
    JsonOrDefault(body): JsonOrDefault<InvokeBody>,
) -> ApiResponse {
    respond(
        state
            .executor
            .invoke_tool(&name, &tool, body.arguments, body.instance.as_deref())
            .await,
    )
}

// ============================================================================
// Freeform commands
// ============================================================================

/// Malformed requests come back as a usage error with a 400 status
async fn execute(State(state): State<ApiState>, body: Bytes) -> (StatusCode, Json<CommandOutput>) {
    let request: CommandRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(CommandOutput::usage(format!("invalid command request: {}", e))),
            )
        }
    };
    tracing::debug!("Executing '{}' {:?}", request.command, request.args);
    (StatusCode::OK, Json(state.executor.run(&request).await))
}
