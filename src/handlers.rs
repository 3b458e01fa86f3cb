use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api_callbacks;
use crate::api_cameras;
use crate::api_docs;
use crate::config::Config;
use crate::errors::ManagerError;
use crate::AppState;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ApiResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<BTreeMap<String, String>>,
}

impl ApiResponse {
    /// Bare `{"status": ...}` body used by stream actions and callbacks
    pub fn status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            error: None,
            code: None,
            fields: None,
        }
    }

    pub fn error(message: &str, code: u16) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(message.to_string()),
            code: Some(code),
            fields: None,
        }
    }

    pub fn validation(fields: BTreeMap<String, String>) -> Self {
        Self {
            fields: Some(fields),
            ..Self::error("Invalid input", 400)
        }
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        match self {
            ManagerError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, Json(ApiResponse::error(&self.to_string(), 404))).into_response()
            }
            ManagerError::Validation { fields } => {
                (StatusCode::BAD_REQUEST, Json(ApiResponse::validation(fields))).into_response()
            }
            other => {
                error!("Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiResponse::error(&other.to_string(), 500)))
                    .into_response()
            }
        }
    }
}

/// Register a route both with and without a trailing slash.
fn route_both(router: Router<AppState>, path: &str, method_router: MethodRouter<AppState>) -> Router<AppState> {
    router
        .route(path, method_router.clone())
        .route(&format!("{}/", path), method_router)
}

pub fn api_router() -> Router<AppState> {
    let mut router = Router::new();

    router = route_both(router, "/cameras", get(api_cameras::list_cameras).post(api_cameras::create_camera));
    router = route_both(
        router,
        "/cameras/:id",
        get(api_cameras::get_camera)
            .put(api_cameras::update_camera)
            .patch(api_cameras::partial_update_camera)
            .delete(api_cameras::delete_camera),
    );
    router = route_both(router, "/cameras/:id/start", post(api_cameras::start_camera_stream));
    router = route_both(router, "/cameras/:id/stop", post(api_cameras::stop_camera_stream));
    router = route_both(router, "/cameras/:id/restart", post(api_cameras::restart_camera_stream));

    router = route_both(router, "/stream/on_connect", post(api_callbacks::on_connect));
    router = route_both(router, "/stream/on_publish", post(api_callbacks::on_publish));
    router = route_both(router, "/stream/on_publish_done", post(api_callbacks::on_publish_done));
    router = route_both(router, "/stream/on_play", post(api_callbacks::on_play));
    router = route_both(router, "/stream/on_done", post(api_callbacks::on_done));

    router
}

pub fn build_router(state: AppState, config: &Config) -> Router {
    let openapi = api_docs::openapi(&config.server.api_prefix);
    let api = route_both(
        api_router(),
        "/openapi.json",
        get(move || async move { Json(openapi) }),
    );
    let mut app: Router<AppState> = if config.server.api_prefix.is_empty() {
        api
    } else {
        Router::new().nest(&config.server.api_prefix, api)
    };

    if config.streaming.serve_hls {
        info!("Serving HLS output from '{}' at /hls", config.streaming.hls_root);
        app = app.nest_service("/hls", ServeDir::new(&config.streaming.hls_root));
    }

    app.fallback(not_found)
        .layer(cors_layer(config.server.cors_allow_origin.as_deref()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(ApiResponse::error("Resource was not found.", 404))).into_response()
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    match origin {
        Some("*") | None => CorsLayer::permissive(),
        Some(origin) => match origin.parse::<axum::http::HeaderValue>() {
            Ok(origin_header) => CorsLayer::new()
                .allow_origin(origin_header)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
            Err(_) => {
                warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                CorsLayer::permissive()
            }
        },
    }
}
