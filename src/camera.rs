use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::{ManagerError, Result};

pub type CameraId = i64;

const MAX_TEXT_LEN: usize = 255;

pub const DEFAULT_RTMP_PORT: u16 = 1935;
pub const DEFAULT_APP_NAME: &str = "live";
pub const DEFAULT_STREAM_ID: &str = "stream1";
pub const DEFAULT_RTSP_PORT: u16 = 554;
pub const DEFAULT_RTSP_PATH: &str = "stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum StreamProtocol {
    #[serde(rename = "rtmp")]
    Rtmp,
    #[serde(rename = "rtsp")]
    Rtsp,
}

impl Default for StreamProtocol {
    fn default() -> Self {
        Self::Rtmp
    }
}

impl StreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::Rtmp => "rtmp",
            StreamProtocol::Rtsp => "rtsp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rtmp" => Some(StreamProtocol::Rtmp),
            "rtsp" => Some(StreamProtocol::Rtsp),
            _ => None,
        }
    }
}

impl From<String> for StreamProtocol {
    fn from(s: String) -> Self {
        Self::parse(&s).unwrap_or_default()
    }
}

/// Client-writable part of a camera record
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CameraFields {
    #[schema(example = "Driveway")]
    pub name: String,
    #[schema(example = "192.168.1.50")]
    pub ip_address: String,
    pub protocol: StreamProtocol,
    pub rtmp_port: u16,
    pub app_name: String,
    pub stream_id: String,
    pub rtsp_port: u16,
    pub rtsp_path: String,
    pub active: bool,
}

impl CameraFields {
    pub fn new(name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip_address: ip_address.into(),
            protocol: StreamProtocol::Rtmp,
            rtmp_port: DEFAULT_RTMP_PORT,
            app_name: DEFAULT_APP_NAME.to_string(),
            stream_id: DEFAULT_STREAM_ID.to_string(),
            rtsp_port: DEFAULT_RTSP_PORT,
            rtsp_path: DEFAULT_RTSP_PATH.to_string(),
            active: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Camera {
    pub id: CameraId,
    #[serde(flatten)]
    pub fields: CameraFields,
    pub hls_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Camera {
    pub fn rtmp_url(&self) -> String {
        format!(
            "rtmp://{}:{}/{}/{}",
            url_host(&self.fields.ip_address),
            self.fields.rtmp_port,
            self.fields.app_name,
            self.fields.stream_id
        )
    }

    pub fn rtsp_url(&self) -> String {
        format!(
            "rtsp://{}:{}/{}",
            url_host(&self.fields.ip_address),
            self.fields.rtsp_port,
            self.fields.rtsp_path.trim_start_matches('/')
        )
    }

    /// URL the camera feed is pulled from, per the selected protocol
    pub fn source_url(&self) -> String {
        match self.fields.protocol {
            StreamProtocol::Rtmp => self.rtmp_url(),
            StreamProtocol::Rtsp => self.rtsp_url(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.fields.active
    }
}

impl std::fmt::Display for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fields.name)
    }
}

fn url_host(ip_address: &str) -> String {
    match ip_address.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
        _ => ip_address.to_string(),
    }
}

/// Create/update body for a camera. Read-only attributes (`id`, `hls_url`,
/// timestamps, computed URLs) are accepted and ignored.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct CameraPayload {
    pub name: Option<String>,
    pub ip_address: Option<String>,
    pub protocol: Option<String>,
    pub rtmp_port: Option<i64>,
    pub app_name: Option<String>,
    pub stream_id: Option<String>,
    pub rtsp_port: Option<i64>,
    pub rtsp_path: Option<String>,
    pub active: Option<bool>,
}

impl CameraPayload {
    /// Build the fields of a new camera, applying model defaults.
    pub fn into_new(self) -> Result<CameraFields> {
        let mut fields = CameraFields::new(String::new(), String::new());
        self.apply(&mut fields, false)?;
        Ok(fields)
    }

    /// Validate and merge into existing fields. With `partial` unset, the
    /// required fields must be present, as for a full replace.
    pub fn apply(self, fields: &mut CameraFields, partial: bool) -> Result<()> {
        let mut errors = BTreeMap::new();

        let name = self.name.map(|n| n.trim().to_string());
        match &name {
            None if !partial => { errors.insert("name".to_string(), REQUIRED.to_string()); }
            Some(n) => check_text("name", n, &mut errors),
            None => {}
        }

        let ip_address = self.ip_address.map(|ip| ip.trim().to_string());
        match &ip_address {
            None if !partial => { errors.insert("ip_address".to_string(), REQUIRED.to_string()); }
            Some(ip) if ip.is_empty() => { errors.insert("ip_address".to_string(), BLANK.to_string()); }
            Some(ip) if ip.parse::<IpAddr>().is_err() => {
                errors.insert("ip_address".to_string(), "Enter a valid IPv4 or IPv6 address.".to_string());
            }
            _ => {}
        }

        let protocol = match self.protocol.as_deref() {
            Some(p) => match StreamProtocol::parse(p) {
                Some(protocol) => Some(protocol),
                None => {
                    errors.insert("protocol".to_string(), format!("\"{}\" is not a valid choice.", p));
                    None
                }
            },
            None => None,
        };

        let rtmp_port = self.rtmp_port.and_then(|p| check_port("rtmp_port", p, &mut errors));
        let rtsp_port = self.rtsp_port.and_then(|p| check_port("rtsp_port", p, &mut errors));

        for (field, value) in [
            ("app_name", &self.app_name),
            ("stream_id", &self.stream_id),
            ("rtsp_path", &self.rtsp_path),
        ] {
            if let Some(value) = value {
                check_text(field, value, &mut errors);
            }
        }

        if !errors.is_empty() {
            return Err(ManagerError::validation(errors));
        }

        if let Some(name) = name { fields.name = name; }
        if let Some(ip) = ip_address { fields.ip_address = ip; }
        if let Some(protocol) = protocol { fields.protocol = protocol; }
        if let Some(port) = rtmp_port { fields.rtmp_port = port; }
        if let Some(app_name) = self.app_name { fields.app_name = app_name; }
        if let Some(stream_id) = self.stream_id { fields.stream_id = stream_id; }
        if let Some(port) = rtsp_port { fields.rtsp_port = port; }
        if let Some(rtsp_path) = self.rtsp_path { fields.rtsp_path = rtsp_path; }
        if let Some(active) = self.active { fields.active = active; }
        Ok(())
    }
}

const REQUIRED: &str = "This field is required.";
const BLANK: &str = "This field may not be blank.";

fn check_text(field: &str, value: &str, errors: &mut BTreeMap<String, String>) {
    if value.trim().is_empty() {
        errors.insert(field.to_string(), BLANK.to_string());
    } else if value.chars().count() > MAX_TEXT_LEN {
        errors.insert(
            field.to_string(),
            format!("Ensure this field has no more than {} characters.", MAX_TEXT_LEN),
        );
    }
}

fn check_port(field: &str, value: i64, errors: &mut BTreeMap<String, String>) -> Option<u16> {
    match u16::try_from(value) {
        Ok(port) if port > 0 => Some(port),
        _ => {
            errors.insert(field.to_string(), "Ensure this value is between 1 and 65535.".to_string());
            None
        }
    }
}
