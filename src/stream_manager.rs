use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::camera::{Camera, CameraId, StreamProtocol};
use crate::config::{RelayMode, StreamingConfig};
use crate::database::DatabaseProvider;
use crate::errors::{ManagerError, Result};

/// Sets up HLS relaying for cameras and tracks the ffmpeg children it spawned.
///
/// The process map is best effort: an entry means "we spawned it and have not
/// torn it down yet", not that ffmpeg is still healthy.
pub struct StreamManager {
    database: Arc<dyn DatabaseProvider>,
    config: StreamingConfig,
    stop_timeout: Duration,
    processes: Mutex<HashMap<CameraId, Child>>,
}

impl StreamManager {
    pub fn new(database: Arc<dyn DatabaseProvider>, config: StreamingConfig) -> Result<Self> {
        let stop_timeout = config.stop_timeout()?;
        info!(
            "Stream manager ready (relay mode: {}, HLS root: {}, HLS base URL: {})",
            config.relay_mode, config.hls_root, config.hls_base_url
        );
        Ok(Self {
            database,
            config,
            stop_timeout,
            processes: Mutex::new(HashMap::new()),
        })
    }

    pub fn hls_dir(&self, camera_id: CameraId) -> PathBuf {
        Path::new(&self.config.hls_root).join(camera_id.to_string())
    }

    pub fn hls_url(&self, camera_id: CameraId) -> String {
        format!("{}/{}/index.m3u8", self.config.hls_base_url.trim_end_matches('/'), camera_id)
    }

    pub fn publish_url(&self, camera_id: CameraId) -> String {
        format!("{}/{}", self.config.ffmpeg.publish_base_url.trim_end_matches('/'), camera_id)
    }

    /// Prepare the HLS output for a camera, launch the relay when running in
    /// ffmpeg mode, and record the camera as streaming. On failure the camera
    /// is recorded as inactive and the error returned.
    pub async fn start_stream(&self, camera: &Camera) -> Result<()> {
        match self.try_start(camera).await {
            Ok(hls_url) => {
                info!(camera_id = camera.id, "Stream setup for camera {} - source URL: {}", camera.id, camera.source_url());
                info!(camera_id = camera.id, "HLS URL set to: {}", hls_url);
                Ok(())
            }
            Err(e) => {
                error!(camera_id = camera.id, "Failed to setup stream for camera {}: {}", camera.id, e);
                if let Err(db_err) = self.database.set_active(camera.id, false).await {
                    error!(camera_id = camera.id, "Failed to mark camera {} inactive: {}", camera.id, db_err);
                }
                Err(e)
            }
        }
    }

    async fn try_start(&self, camera: &Camera) -> Result<String> {
        tokio::fs::create_dir_all(self.hls_dir(camera.id)).await?;

        let spawned = match self.config.relay_mode {
            RelayMode::Ffmpeg => self.spawn_relay(camera).await?,
            RelayMode::External => false,
        };

        let hls_url = self.hls_url(camera.id);
        if let Err(e) = self.database.set_stream_state(camera.id, true, Some(&hls_url)).await {
            // A relay spawned by this call must not outlive the failed start
            if spawned {
                self.teardown(camera.id).await;
            }
            return Err(e);
        }
        Ok(hls_url)
    }

    /// Tear down any relay for the camera and record it as inactive.
    pub async fn stop_stream(&self, camera: &Camera) -> Result<()> {
        self.teardown(camera.id).await;

        match self.database.set_active(camera.id, false).await {
            Ok(()) => {
                info!(camera_id = camera.id, "Stopped stream for camera {}", camera.id);
                Ok(())
            }
            Err(e) => {
                error!(camera_id = camera.id, "Error stopping stream for camera {}: {}", camera.id, e);
                Err(e)
            }
        }
    }

    pub async fn restart_stream(&self, camera: &Camera) -> Result<()> {
        if let Err(e) = self.stop_stream(camera).await {
            warn!(camera_id = camera.id, "Continuing restart of camera {} after stop failure: {}", camera.id, e);
        }
        self.start_stream(camera).await
    }

    /// Stop the tracked relay for a camera, if any. Returns whether one was tracked.
    pub async fn teardown(&self, camera_id: CameraId) -> bool {
        let child = {
            let mut processes = self.processes.lock().await;
            processes.remove(&camera_id)
        };

        match child {
            Some(child) => {
                self.terminate(camera_id, child).await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let children: Vec<(CameraId, Child)> = {
            let mut processes = self.processes.lock().await;
            processes.drain().collect()
        };

        for (camera_id, child) in children {
            self.terminate(camera_id, child).await;
        }
        info!("All streams stopped");
    }

    pub async fn tracked_ids(&self) -> Vec<CameraId> {
        let processes = self.processes.lock().await;
        let mut ids: Vec<CameraId> = processes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn ffmpeg_args(&self, camera: &Camera) -> Vec<String> {
        let ffmpeg = &self.config.ffmpeg;
        let mut args: Vec<String> = ffmpeg.extra_input_args.clone();

        if camera.fields.protocol == StreamProtocol::Rtsp {
            args.extend(["-rtsp_transport".to_string(), ffmpeg.rtsp_transport.clone()]);
        }
        args.extend([
            "-i".to_string(), camera.source_url(),
            "-c".to_string(), "copy".to_string(), // Relay only, no transcoding
        ]);
        args.extend(ffmpeg.extra_output_args.iter().cloned());
        args.extend([
            "-f".to_string(), "flv".to_string(),
            self.publish_url(camera.id),
        ]);
        args
    }

    /// Launch the relay unless one is already running. Returns whether a new
    /// child was spawned.
    async fn spawn_relay(&self, camera: &Camera) -> Result<bool> {
        let mut processes = self.processes.lock().await;

        if let Some(child) = processes.get_mut(&camera.id) {
            match child.try_wait() {
                Ok(None) => {
                    debug!(camera_id = camera.id, "Relay for camera {} already running", camera.id);
                    return Ok(false);
                }
                Ok(Some(status)) => {
                    info!(camera_id = camera.id, "Previous relay for camera {} exited with {}", camera.id, status);
                }
                Err(e) => {
                    warn!(camera_id = camera.id, "Could not poll relay for camera {}: {}", camera.id, e);
                }
            }
            processes.remove(&camera.id);
        }

        let args = self.ffmpeg_args(camera);
        let log_stderr = self.config.ffmpeg.log_stderr;
        info!(camera_id = camera.id, "Starting {} {}", self.config.ffmpeg.binary, args.join(" "));

        let mut child = Command::new(&self.config.ffmpeg.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(if log_stderr { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ManagerError::ffmpeg(format!("Failed to spawn {}: {}", self.config.ffmpeg.binary, e)))?;

        if let Some(stderr) = child.stderr.take() {
            let camera_id = camera.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(camera_id, "ffmpeg: {}", line);
                }
            });
        }

        processes.insert(camera.id, child);
        Ok(true)
    }

    async fn terminate(&self, camera_id: CameraId, mut child: Child) {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(camera_id, "Relay for camera {} had already exited with {}", camera_id, status);
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(camera_id, "Could not poll relay for camera {}: {}", camera_id, e),
        }

        send_terminate(&child);

        let waited = tokio::time::timeout(self.stop_timeout, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                info!(camera_id, "Relay for camera {} stopped ({})", camera_id, status);
            }
            Ok(Err(e)) => {
                warn!(camera_id, "Error waiting for relay of camera {}: {}", camera_id, e);
            }
            Err(_) => {
                warn!(camera_id, "Relay for camera {} ignored terminate after {:?}, killing", camera_id, self.stop_timeout);
                if let Err(e) = child.kill().await {
                    error!(camera_id, "Failed to kill relay for camera {}: {}", camera_id, e);
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to pid {}: {}", pid, e);
        }
    }
}

// No graceful signal available; the timeout path falls through to kill().
#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraFields;
    use crate::config::FfmpegConfig;
    use crate::database::SqliteDatabase;

    fn temp_root() -> String {
        std::env::temp_dir()
            .join(format!("cctv-manager-test-{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string()
    }

    async fn setup(config: StreamingConfig) -> (Arc<dyn DatabaseProvider>, StreamManager) {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        let db: Arc<dyn DatabaseProvider> = Arc::new(db);
        let manager = StreamManager::new(db.clone(), config).unwrap();
        (db, manager)
    }

    fn external_config() -> StreamingConfig {
        StreamingConfig {
            hls_root: temp_root(),
            hls_base_url: "http://media.local/hls/".to_string(),
            ..StreamingConfig::default()
        }
    }

    fn ffmpeg_config(ffmpeg: FfmpegConfig) -> StreamingConfig {
        StreamingConfig {
            relay_mode: RelayMode::Ffmpeg,
            stop_timeout: "2s".to_string(),
            ffmpeg,
            ..external_config()
        }
    }

    #[tokio::test]
    async fn start_sets_hls_url_and_creates_directory() {
        let (db, manager) = setup(external_config()).await;
        let cam = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();

        manager.start_stream(&cam).await.unwrap();

        let cam = db.get_camera(cam.id).await.unwrap();
        assert!(cam.is_active());
        assert_eq!(cam.hls_url, Some(format!("http://media.local/hls/{}/index.m3u8", cam.id)));
        assert!(manager.hls_dir(cam.id).is_dir());
        assert!(manager.tracked_ids().await.is_empty());

        let _ = std::fs::remove_dir_all(&manager.config.hls_root);
    }

    #[tokio::test]
    async fn stop_marks_inactive_and_keeps_hls_url() {
        let (db, manager) = setup(external_config()).await;
        let cam = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();
        manager.start_stream(&cam).await.unwrap();

        manager.stop_stream(&cam).await.unwrap();
        let cam = db.get_camera(cam.id).await.unwrap();
        assert!(!cam.is_active());
        assert!(cam.hls_url.is_some());

        manager.restart_stream(&cam).await.unwrap();
        assert!(db.get_camera(cam.id).await.unwrap().is_active());

        let _ = std::fs::remove_dir_all(&manager.config.hls_root);
    }

    #[tokio::test]
    async fn stop_of_deleted_camera_fails() {
        let (db, manager) = setup(external_config()).await;
        let cam = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();
        db.delete_camera(cam.id).await.unwrap();

        assert!(manager.stop_stream(&cam).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn failed_spawn_marks_camera_inactive() {
        let (db, manager) = setup(ffmpeg_config(FfmpegConfig {
            binary: "/nonexistent/bin/ffmpeg".to_string(),
            ..FfmpegConfig::default()
        })).await;
        let mut fields = CameraFields::new("Porch", "10.0.0.2");
        fields.active = true;
        let cam = db.create_camera(&fields).await.unwrap();

        let err = manager.start_stream(&cam).await.unwrap_err();
        assert!(matches!(err, ManagerError::Ffmpeg { .. }));

        let cam = db.get_camera(cam.id).await.unwrap();
        assert!(!cam.is_active());
        assert_eq!(cam.hls_url, None);
        assert!(manager.tracked_ids().await.is_empty());

        let _ = std::fs::remove_dir_all(&manager.config.hls_root);
    }

    #[tokio::test]
    async fn builds_relay_arguments() {
        let (db, manager) = setup(ffmpeg_config(FfmpegConfig {
            publish_base_url: "rtmp://media.local:1935/live/".to_string(),
            extra_input_args: vec!["-re".to_string()],
            extra_output_args: vec!["-loglevel".to_string(), "warning".to_string()],
            ..FfmpegConfig::default()
        })).await;

        let mut fields = CameraFields::new("Porch", "10.0.0.2");
        fields.protocol = StreamProtocol::Rtsp;
        fields.rtsp_path = "live/ch0".to_string();
        let cam = db.create_camera(&fields).await.unwrap();

        let expected_target = format!("rtmp://media.local:1935/live/{}", cam.id);
        assert_eq!(manager.ffmpeg_args(&cam), vec![
            "-re", "-rtsp_transport", "tcp",
            "-i", "rtsp://10.0.0.2:554/live/ch0",
            "-c", "copy",
            "-loglevel", "warning",
            "-f", "flv", expected_target.as_str(),
        ]);

        let rtmp_cam = db.create_camera(&CameraFields::new("Yard", "10.0.0.3")).await.unwrap();
        let args = manager.ffmpeg_args(&rtmp_cam);
        assert!(!args.contains(&"-rtsp_transport".to_string()));
        assert_eq!(args[2], "rtmp://10.0.0.3:1935/live/stream1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tracks_and_terminates_relay_process() {
        // `sh -c 'sleep 30' relay <ffmpeg args...>` stands in for a long-running ffmpeg
        let (db, manager) = setup(ffmpeg_config(FfmpegConfig {
            binary: "sh".to_string(),
            extra_input_args: vec!["-c".to_string(), "sleep 30".to_string(), "relay".to_string()],
            ..FfmpegConfig::default()
        })).await;
        let cam = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();

        manager.start_stream(&cam).await.unwrap();
        assert_eq!(manager.tracked_ids().await, vec![cam.id]);

        // A second start keeps the running relay
        manager.start_stream(&cam).await.unwrap();
        assert_eq!(manager.tracked_ids().await, vec![cam.id]);

        let started = std::time::Instant::now();
        manager.stop_stream(&cam).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(manager.tracked_ids().await.is_empty());
        assert!(!manager.teardown(cam.id).await);

        manager.start_stream(&cam).await.unwrap();
        manager.stop_all().await;
        assert!(manager.tracked_ids().await.is_empty());

        let _ = std::fs::remove_dir_all(&manager.config.hls_root);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_state_write_tears_down_spawned_relay() {
        let (db, manager) = setup(ffmpeg_config(FfmpegConfig {
            binary: "sh".to_string(),
            extra_input_args: vec!["-c".to_string(), "sleep 30".to_string(), "relay".to_string()],
            ..FfmpegConfig::default()
        })).await;
        let cam = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();
        db.delete_camera(cam.id).await.unwrap();

        let started = std::time::Instant::now();
        let err = manager.start_stream(&cam).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.tracked_ids().await.is_empty());
        assert!(started.elapsed() < Duration::from_secs(10));

        let _ = std::fs::remove_dir_all(&manager.config.hls_root);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_all_kills_relay_that_ignores_terminate() {
        let (db, manager) = setup(StreamingConfig {
            stop_timeout: "500ms".to_string(),
            ..ffmpeg_config(FfmpegConfig {
                binary: "sh".to_string(),
                extra_input_args: vec![
                    "-c".to_string(),
                    "trap '' TERM; sleep 30".to_string(),
                    "relay".to_string(),
                ],
                ..FfmpegConfig::default()
            })
        }).await;
        let cam = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();

        manager.start_stream(&cam).await.unwrap();
        assert_eq!(manager.tracked_ids().await, vec![cam.id]);
        // Let the shell install its trap before the terminate arrives
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        manager.stop_all().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
        assert!(manager.tracked_ids().await.is_empty());

        let _ = std::fs::remove_dir_all(&manager.config.hls_root);
    }
}
