use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sqlgate::{
    ConfirmationTokenStore, Database, ExecutionGateway, GatewayError, ProposeOutcome,
    SqlExecutor, TokenStoreConfig,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::models::{
    ConfirmBody, ConfirmationRequiredResponse, ConfirmedExecutionResponse, ErrorBody, ProposeBody,
    QueryResultResponse, SchemaResponse,
};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let tokens = Arc::new(ConfirmationTokenStore::new(config.tokens));
    let sweeper = tokens.spawn_sweeper();
    let executor: Arc<dyn SqlExecutor> = Arc::new(db.clone());
    let state = Arc::new(AppState {
        gateway: ExecutionGateway::new(executor, tokens),
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        token_expiration_ms = config.tokens.expiration.as_millis() as u64,
        "sqlgate-daemon listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server exited")?;

    sweeper.shutdown().await;
    db.close().await;
    info!("sqlgate-daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for ctrl-c; shutting down");
        return;
    }
    info!("ctrl-c received; shutting down");
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/v1/schema", get(schema))
        .route("/api/v1/query", post(propose_query))
        .route("/api/v1/query/execute", post(execute_query))
        .with_state(state)
}

pub(crate) struct AppState {
    pub(crate) gateway: ExecutionGateway<dyn SqlExecutor>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub db_url: String,
    pub tokens: TokenStoreConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("SQLGATE_API_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid SQLGATE_API_ADDR")?;

        let db_url = lookup("SQLGATE_DB_DSN")
            .or_else(|| lookup("DATABASE_URL"))
            .context("SQLGATE_DB_DSN or DATABASE_URL must be configured")?;

        let defaults = TokenStoreConfig::default();
        let tokens = TokenStoreConfig {
            expiration: millis_setting(
                "SQLGATE_TOKEN_EXPIRATION_MS",
                lookup("SQLGATE_TOKEN_EXPIRATION_MS"),
                defaults.expiration,
            )?,
            cleanup_interval: millis_setting(
                "SQLGATE_TOKEN_CLEANUP_INTERVAL_MS",
                lookup("SQLGATE_TOKEN_CLEANUP_INTERVAL_MS"),
                defaults.cleanup_interval,
            )?,
        };

        Ok(Self {
            listen_addr,
            db_url,
            tokens,
        })
    }
}

fn millis_setting(name: &str, raw: Option<String>, default: Duration) -> Result<Duration> {
    match raw {
        Some(value) if !value.trim().is_empty() => {
            let millis: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("invalid {name}: '{value}' is not a whole number of milliseconds"))?;
            anyhow::ensure!(millis > 0, "invalid {name}: must be greater than zero");
            Ok(Duration::from_millis(millis))
        }
        _ => Ok(default),
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain"))
)]
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active = state.gateway.tokens().active_token_count();
    (
        StatusCode::OK,
        format!(
            "# TYPE sqlgate_up gauge\nsqlgate_up 1\n\
             # TYPE sqlgate_active_confirmation_tokens gauge\n\
             sqlgate_active_confirmation_tokens {active}\n"
        ),
    )
}

#[utoipa::path(
    get,
    path = "/api/v1/schema",
    responses(
        (status = 200, description = "Database schema as SQL text", body = SchemaResponse),
        (status = 500, description = "Schema could not be read", body = ErrorBody)
    )
)]
async fn schema(State(state): State<Arc<AppState>>) -> Result<Json<SchemaResponse>, ApiError> {
    let schema = state
        .gateway
        .executor()
        .schema()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(SchemaResponse { schema }))
}

#[utoipa::path(
    post,
    path = "/api/v1/query",
    request_body = ProposeBody,
    responses(
        (status = 200, description = "Read-only query executed", body = QueryResultResponse),
        (status = 202, description = "Data-modifying query awaiting confirmation", body = ConfirmationRequiredResponse),
        (status = 400, description = "Malformed request", body = ErrorBody),
        (status = 403, description = "Statement type is not allowed", body = ErrorBody),
        (status = 500, description = "Query execution failed", body = ErrorBody)
    )
)]
async fn propose_query(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ProposeBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload.map_err(ApiError::from)?;

    let response = match state.gateway.propose(&payload.sql).await? {
        ProposeOutcome::Executed(result) => {
            (StatusCode::OK, Json(QueryResultResponse::from(result))).into_response()
        }
        ProposeOutcome::NeedsConfirmation(pending) => (
            StatusCode::ACCEPTED,
            Json(ConfirmationRequiredResponse::from(pending)),
        )
            .into_response(),
    };
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/api/v1/query/execute",
    request_body = ConfirmBody,
    responses(
        (status = 200, description = "Confirmed query executed", body = ConfirmedExecutionResponse),
        (status = 400, description = "Missing or empty token", body = ErrorBody),
        (status = 401, description = "Invalid or expired confirmation token", body = ErrorBody),
        (status = 500, description = "Confirmed query failed; the token is spent", body = ErrorBody)
    )
)]
async fn execute_query(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConfirmBody>, JsonRejection>,
) -> Result<Json<ConfirmedExecutionResponse>, ApiError> {
    let Json(payload) = payload.map_err(ApiError::from)?;
    let confirmed = state.gateway.confirm_and_execute(&payload.token).await?;
    Ok(Json(ConfirmedExecutionResponse::from(confirmed)))
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
    query: Option<String>,
    keyword: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            query: None,
            keyword: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidInput(message) => ApiError::bad_request(message),
            GatewayError::Forbidden { ref keyword } => ApiError {
                keyword: Some(keyword.clone()),
                ..ApiError::new(StatusCode::FORBIDDEN, err.to_string())
            },
            GatewayError::Unauthorized => ApiError::new(StatusCode::UNAUTHORIZED, err.to_string()),
            GatewayError::Execution { query, message } => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message,
                query: Some(query),
                keyword: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "api error");
        } else {
            warn!(status = %self.status, message = %self.message, "request rejected");
        }
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
            query: self.query,
            keyword: self.keyword,
        });
        (self.status, body).into_response()
    }
}

pub mod docs {
    use super::*;
    use crate::models::EstimatedImpactDto;
    use sqlgate::QueryType;
    use utoipa::OpenApi;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "SQLGate Daemon API", version = "0.1.0"),
        paths(healthz, metrics, schema, propose_query, execute_query),
        components(schemas(
            ProposeBody,
            ConfirmBody,
            QueryResultResponse,
            ConfirmationRequiredResponse,
            ConfirmedExecutionResponse,
            EstimatedImpactDto,
            QueryType,
            SchemaResponse,
            ErrorBody
        )),
        tags((name = "sqlgate", description = "Guarded SQL execution"))
    )]
    pub struct ApiDoc;
}
