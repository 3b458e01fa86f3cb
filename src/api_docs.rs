//! OpenAPI description of the camera and callback endpoints, served as
//! `{api_prefix}/openapi.json`.

use utoipa::openapi::server::Server;
use utoipa::OpenApi;

use crate::api_callbacks::{self, CallbackPayload};
use crate::api_cameras::{self, CameraResponse};
use crate::camera::{Camera, CameraFields, CameraPayload, StreamProtocol};
use crate::handlers::ApiResponse;

#[derive(OpenApi)]
#[openapi(
    info(title = "CCTV manager API", description = "Camera registry, stream control and RTMP server callbacks"),
    paths(
        api_cameras::list_cameras,
        api_cameras::create_camera,
        api_cameras::get_camera,
        api_cameras::update_camera,
        api_cameras::partial_update_camera,
        api_cameras::delete_camera,
        api_cameras::start_camera_stream,
        api_cameras::stop_camera_stream,
        api_cameras::restart_camera_stream,
        api_callbacks::on_connect,
        api_callbacks::on_publish,
        api_callbacks::on_publish_done,
        api_callbacks::on_play,
        api_callbacks::on_done,
    ),
    components(schemas(
        Camera,
        CameraFields,
        CameraPayload,
        CameraResponse,
        StreamProtocol,
        ApiResponse,
        CallbackPayload,
    )),
    tags(
        (name = "cameras", description = "Camera registry and stream actions"),
        (name = "stream callbacks", description = "Notifications posted by the RTMP media server"),
    )
)]
pub struct ApiDoc;

/// Build the document with the configured prefix as its server base path.
pub fn openapi(api_prefix: &str) -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    if !api_prefix.is_empty() {
        doc.servers = Some(vec![Server::new(api_prefix)]);
    }
    doc
}
