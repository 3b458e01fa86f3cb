use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::errors::{ManagerError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayMode {
    /// An externally-run RTMP server ingests the camera and produces HLS
    #[serde(rename = "external")]
    External,
    /// A spawned ffmpeg pulls the camera feed and republishes it as RTMP
    #[serde(rename = "ffmpeg")]
    Ffmpeg,
}

impl Default for RelayMode {
    fn default() -> Self {
        Self::External
    }
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayMode::External => write!(f, "external"),
            RelayMode::Ffmpeg => write!(f, "ffmpeg"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    pub tls: Option<TlsConfig>,
    pub cors_allow_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    #[serde(default)]
    pub relay_mode: RelayMode,
    pub hls_root: String,
    pub hls_base_url: String,
    #[serde(default)]
    pub serve_hls: bool,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: String, // Grace period before ffmpeg is killed (e.g. "5s", "1500ms")
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_binary")]
    pub binary: String,
    #[serde(default = "default_publish_base_url")]
    pub publish_base_url: String, // Camera id is appended as the RTMP stream name
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,   // -rtsp_transport, only applied to rtsp sources
    #[serde(default)]
    pub extra_input_args: Vec<String>,
    #[serde(default)]
    pub extra_output_args: Vec<String>,
    #[serde(default)]
    pub log_stderr: bool,
}

fn default_api_prefix() -> String { "/api".to_string() }
fn default_stop_timeout() -> String { "5s".to_string() }
fn default_ffmpeg_binary() -> String { "ffmpeg".to_string() }
fn default_publish_base_url() -> String { "rtmp://localhost:1935/live".to_string() }
fn default_rtsp_transport() -> String { "tcp".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_prefix: default_api_prefix(),
            tls: Some(TlsConfig {
                enabled: false,
                cert_path: "certs/server.crt".to_string(),
                key_path: "certs/server.key".to_string(),
            }),
            cors_allow_origin: Some("*".to_string()),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/cctv_manager.db".to_string(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            relay_mode: RelayMode::External,
            hls_root: "hls".to_string(),
            hls_base_url: "http://localhost:8080/hls".to_string(),
            serve_hls: false,
            stop_timeout: default_stop_timeout(),
            ffmpeg: FfmpegConfig::default(),
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: default_ffmpeg_binary(),
            publish_base_url: default_publish_base_url(),
            rtsp_transport: default_rtsp_transport(),
            extra_input_args: Vec::new(),
            extra_output_args: Vec::new(),
            log_stderr: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

impl StreamingConfig {
    pub fn stop_timeout(&self) -> Result<Duration> {
        crate::utils::parse_duration(&self.stop_timeout)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::parse(path, &content)?;
        config.validate()?;
        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    fn parse(path: &str, content: &str) -> Result<Self> {
        let extension = Path::new(path).extension().and_then(|s| s.to_str());
        let config: Config = match extension {
            Some("json") => serde_json::from_str(content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(content)?,
            _ => toml::from_str(content)?,
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let prefix = &self.server.api_prefix;
        if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.ends_with('/')) {
            return Err(ManagerError::config(format!(
                "api_prefix '{}' must start with '/' and must not end with '/'",
                prefix
            )));
        }

        url::Url::parse(&self.streaming.hls_base_url)?;
        if self.streaming.relay_mode == RelayMode::Ffmpeg {
            url::Url::parse(&self.streaming.ffmpeg.publish_base_url)?;
        }
        self.streaming.stop_timeout()?;
        Ok(())
    }
}
