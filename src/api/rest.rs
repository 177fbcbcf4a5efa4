use crate::config::Config;
use crate::db::repositories::{NotificationsRepository, UserTokensRepository};
use crate::db::DatabaseService;
use crate::error::Error;
use crate::pipeline::StreamSupervisor;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use uuid::Uuid;

/// Part boundary for the multipart/x-mixed-replace stream
const MJPEG_BOUNDARY: &str = "frame";

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<StreamSupervisor>,
    pub notifications: NotificationsRepository,
    pub tokens: UserTokensRepository,
    pub db: Arc<DatabaseService>,
}

/// Handler error with an HTTP status derived from the failure kind.
struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<Error>() {
            Some(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(Error::SourceUnresolvable(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Some(Error::SourceOpen(_)) => StatusCode::BAD_GATEWAY,
            Some(Error::Api(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// REST API server
pub struct RestApi {
    address: String,
    port: u16,
    router: Router,
}

impl RestApi {
    pub fn new(config: &Config, state: AppState) -> Self {
        let router = Router::new()
            .route("/health", get(health))
            .route("/api/streams", get(active_streams))
            .route("/api/cameras/:id/stream", get(camera_stream))
            .route("/api/cameras/:id/stream/stop", post(stop_camera_stream))
            .route("/api/cameras/:id/notifications", get(camera_notifications))
            .route("/api/users/:id/notifications", get(user_notifications))
            .route("/api/users/:id/token", put(register_token))
            .nest_service(
                "/snapshots",
                ServeDir::new(&config.snapshots.storage_path),
            )
            .layer(CorsLayer::permissive())
            .with_state(state);

        Self {
            address: config.api.address.clone(),
            port: config.api.port,
            router,
        }
    }

    /// Serve until the shutdown future resolves.
    pub async fn start<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.address, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Api(format!("Failed to bind {}: {}", addr, e)))?;

        info!("API server listening on {}", addr);
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Api(format!("Server error: {}", e)))?;

        Ok(())
    }
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let database_up = state.db.health_check().await?;
    Ok(Json(json!({
        "status": if database_up { "ok" } else { "degraded" },
        "database": database_up,
        "active_streams": state.supervisor.active_cameras().await.len(),
    })))
}

async fn active_streams(State(state): State<AppState>) -> Json<Vec<Uuid>> {
    Json(state.supervisor.active_cameras().await)
}

/// Attach the caller to the camera's annotated MJPEG stream. Multiple
/// concurrent viewers share one session per camera.
async fn camera_stream(
    State(state): State<AppState>,
    Path(camera_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let frames = state.supervisor.subscribe(camera_id).await?;

    // Lagged receivers skip to the freshest frame instead of erroring out
    let body = Body::from_stream(BroadcastStream::new(frames).filter_map(|frame| async move {
        frame
            .ok()
            .map(|jpeg| Ok::<_, Infallible>(mjpeg_part(&jpeg)))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| ApiError(Error::Api(format!("Failed to build stream response: {}", e)).into()))
}

/// Frame one encoded JPEG as a multipart part.
fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 128);
    part.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            MJPEG_BOUNDARY,
            jpeg.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

async fn stop_camera_stream(
    State(state): State<AppState>,
    Path(camera_id): Path<Uuid>,
) -> Json<serde_json::Value> {
    let stopped = state.supervisor.invalidate(camera_id).await;
    Json(json!({ "stopped": stopped }))
}

#[derive(Deserialize)]
struct NotificationQuery {
    limit: Option<i64>,
}

async fn camera_notifications(
    State(state): State<AppState>,
    Path(camera_id): Path<Uuid>,
    Query(query): Query<NotificationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let notifications = state
        .notifications
        .get_by_camera(&camera_id, query.limit)
        .await?;
    Ok(Json(notifications))
}

async fn user_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<NotificationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let notifications = state
        .notifications
        .get_by_user(&user_id, query.limit)
        .await?;
    Ok(Json(notifications))
}

#[derive(Deserialize)]
struct RegisterTokenRequest {
    token: String,
}

async fn register_token(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<RegisterTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.token.trim().is_empty() {
        return Err(ApiError(Error::Api("Token must not be empty".to_string()).into()));
    }
    let registered = state.tokens.upsert(&user_id, request.token.trim()).await?;
    Ok(Json(registered))
}
