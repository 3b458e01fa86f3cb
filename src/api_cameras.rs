use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};

use crate::camera::{Camera, CameraId, CameraPayload};
use crate::errors::{ManagerError, Result};
use crate::handlers::ApiResponse;
use crate::AppState;

/// Camera as returned by the API: stored fields plus computed URLs
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CameraResponse {
    #[serde(flatten)]
    camera: Camera,
    #[schema(example = "rtmp://192.168.1.50:1935/live/stream1")]
    rtmp_url: String,
    #[schema(example = "rtsp://192.168.1.50:554/stream")]
    rtsp_url: String,
    source_url: String,
}

impl From<Camera> for CameraResponse {
    fn from(camera: Camera) -> Self {
        Self {
            rtmp_url: camera.rtmp_url(),
            rtsp_url: camera.rtsp_url(),
            source_url: camera.source_url(),
            camera,
        }
    }
}

fn parse_id(raw: &str) -> Result<CameraId> {
    raw.parse::<CameraId>().map_err(|_| ManagerError::camera_not_found(raw))
}

fn payload_or_error(body: std::result::Result<Json<CameraPayload>, JsonRejection>) -> Result<CameraPayload> {
    match body {
        Ok(Json(payload)) => Ok(payload),
        Err(rejection) => {
            let mut fields = BTreeMap::new();
            fields.insert("body".to_string(), rejection.body_text());
            Err(ManagerError::validation(fields))
        }
    }
}

#[utoipa::path(
    get,
    path = "/cameras",
    tag = "cameras",
    responses((status = 200, description = "All cameras", body = [CameraResponse]))
)]
pub async fn list_cameras(State(state): State<AppState>) -> Result<Json<Vec<CameraResponse>>> {
    let cameras = state.database.list_cameras().await?;
    Ok(Json(cameras.into_iter().map(CameraResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/cameras/{id}",
    tag = "cameras",
    params(("id" = i64, Path, description = "Camera id")),
    responses(
        (status = 200, description = "Camera", body = CameraResponse),
        (status = 404, description = "Unknown camera", body = ApiResponse)
    )
)]
pub async fn get_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CameraResponse>> {
    let camera = state.database.get_camera(parse_id(&id)?).await?;
    Ok(Json(camera.into()))
}

/// Register a camera. A camera created as active starts streaming right away.
#[utoipa::path(
    post,
    path = "/cameras",
    tag = "cameras",
    request_body = CameraPayload,
    responses(
        (status = 201, description = "Camera created", body = CameraResponse),
        (status = 400, description = "Invalid input", body = ApiResponse)
    )
)]
pub async fn create_camera(
    State(state): State<AppState>,
    body: std::result::Result<Json<CameraPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<CameraResponse>)> {
    let fields = payload_or_error(body)?.into_new()?;
    let mut camera = state.database.create_camera(&fields).await?;
    info!(camera_id = camera.id, "Camera '{}' created", camera);

    // Cameras registered as active go straight to streaming
    if camera.is_active() {
        if let Err(e) = state.stream_manager.start_stream(&camera).await {
            warn!(camera_id = camera.id, "Camera '{}' created but stream setup failed: {}", camera, e);
        }
        camera = state.database.get_camera(camera.id).await?;
    }

    Ok((StatusCode::CREATED, Json(camera.into())))
}

async fn apply_update(
    state: &AppState,
    raw_id: &str,
    body: std::result::Result<Json<CameraPayload>, JsonRejection>,
    partial: bool,
) -> Result<Json<CameraResponse>> {
    let id = parse_id(raw_id)?;
    let existing = state.database.get_camera(id).await?;
    let payload = payload_or_error(body)?;

    let mut fields = existing.fields.clone();
    payload.apply(&mut fields, partial)?;

    let camera = state.database.update_camera(id, &fields).await?;
    info!(camera_id = id, "Camera '{}' updated", camera);
    Ok(Json(camera.into()))
}

#[utoipa::path(
    put,
    path = "/cameras/{id}",
    tag = "cameras",
    params(("id" = i64, Path, description = "Camera id")),
    request_body = CameraPayload,
    responses(
        (status = 200, description = "Camera replaced", body = CameraResponse),
        (status = 400, description = "Invalid input", body = ApiResponse),
        (status = 404, description = "Unknown camera", body = ApiResponse)
    )
)]
pub async fn update_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<CameraPayload>, JsonRejection>,
) -> Result<Json<CameraResponse>> {
    apply_update(&state, &id, body, false).await
}

#[utoipa::path(
    patch,
    path = "/cameras/{id}",
    tag = "cameras",
    params(("id" = i64, Path, description = "Camera id")),
    request_body = CameraPayload,
    responses(
        (status = 200, description = "Camera updated", body = CameraResponse),
        (status = 400, description = "Invalid input", body = ApiResponse),
        (status = 404, description = "Unknown camera", body = ApiResponse)
    )
)]
pub async fn partial_update_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<CameraPayload>, JsonRejection>,
) -> Result<Json<CameraResponse>> {
    apply_update(&state, &id, body, true).await
}

#[utoipa::path(
    delete,
    path = "/cameras/{id}",
    tag = "cameras",
    params(("id" = i64, Path, description = "Camera id")),
    responses(
        (status = 204, description = "Camera deleted"),
        (status = 404, description = "Unknown camera", body = ApiResponse)
    )
)]
pub async fn delete_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let camera = state.database.get_camera(parse_id(&id)?).await?;

    if state.stream_manager.teardown(camera.id).await {
        info!(camera_id = camera.id, "Stopped relay for deleted camera {}", camera.id);
    }
    state.database.delete_camera(camera.id).await?;

    info!(camera_id = camera.id, "Camera '{}' deleted", camera);
    Ok(StatusCode::NO_CONTENT)
}

fn action_response(result: Result<()>, done: &str, failed: &str) -> Response {
    match result {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::status(done))).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiResponse::status(failed))).into_response(),
    }
}

/// Start streaming from the camera source URL
#[utoipa::path(
    post,
    path = "/cameras/{id}/start",
    tag = "cameras",
    params(("id" = i64, Path, description = "Camera id")),
    responses(
        (status = 200, description = "Done", body = ApiResponse, example = json!({"status": "stream started"})),
        (status = 404, description = "Unknown camera", body = ApiResponse),
        (status = 500, description = "Stream action failed", body = ApiResponse, example = json!({"status": "failed to start stream"}))
    )
)]
pub async fn start_camera_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let camera = state.database.get_camera(parse_id(&id)?).await?;
    let result = state.stream_manager.start_stream(&camera).await;
    Ok(action_response(result, "stream started", "failed to start stream"))
}

/// Stop streaming from the camera source URL
#[utoipa::path(
    post,
    path = "/cameras/{id}/stop",
    tag = "cameras",
    params(("id" = i64, Path, description = "Camera id")),
    responses(
        (status = 200, description = "Done", body = ApiResponse, example = json!({"status": "stream stopped"})),
        (status = 404, description = "Unknown camera", body = ApiResponse),
        (status = 500, description = "Stream action failed", body = ApiResponse, example = json!({"status": "failed to stop stream"}))
    )
)]
pub async fn stop_camera_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let camera = state.database.get_camera(parse_id(&id)?).await?;
    let result = state.stream_manager.stop_stream(&camera).await;
    Ok(action_response(result, "stream stopped", "failed to stop stream"))
}

/// Restart streaming from the camera source URL
#[utoipa::path(
    post,
    path = "/cameras/{id}/restart",
    tag = "cameras",
    params(("id" = i64, Path, description = "Camera id")),
    responses(
        (status = 200, description = "Done", body = ApiResponse, example = json!({"status": "stream restarted"})),
        (status = 404, description = "Unknown camera", body = ApiResponse),
        (status = 500, description = "Stream action failed", body = ApiResponse, example = json!({"status": "failed to restart stream"}))
    )
)]
pub async fn restart_camera_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let camera = state.database.get_camera(parse_id(&id)?).await?;
    let result = state.stream_manager.restart_stream(&camera).await;
    Ok(action_response(result, "stream restarted", "failed to restart stream"))
}
