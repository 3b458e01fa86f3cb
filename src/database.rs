use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::camera::{Camera, CameraFields, CameraId, StreamProtocol};
use crate::errors::{ManagerError, Result};

const TABLE_CAMERAS: &str = "cameras";

#[async_trait]
pub trait DatabaseProvider: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn list_cameras(&self) -> Result<Vec<Camera>>;

    async fn get_camera(&self, id: CameraId) -> Result<Camera>;

    async fn create_camera(&self, fields: &CameraFields) -> Result<Camera>;

    async fn update_camera(&self, id: CameraId, fields: &CameraFields) -> Result<Camera>;

    async fn delete_camera(&self, id: CameraId) -> Result<()>;

    /// Flip the published state only, leaving `hls_url` untouched
    async fn set_active(&self, id: CameraId, active: bool) -> Result<()>;

    /// Backend-owned stream state: the only path that writes `hls_url`
    async fn set_stream_state(&self, id: CameraId, active: bool, hls_url: Option<&str>) -> Result<()>;
}

pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub async fn new(database_path: &str) -> Result<Self> {
        // Ensure the directory exists
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        info!("Opened camera database at {}", database_path);
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every pooled connection to
    /// `:memory:` would otherwise see its own empty schema.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }
}

fn camera_from_row(row: &SqliteRow) -> Result<Camera> {
    let rtmp_port: i64 = row.try_get("rtmp_port")?;
    let rtsp_port: i64 = row.try_get("rtsp_port")?;
    let protocol: String = row.try_get("protocol")?;

    Ok(Camera {
        id: row.try_get("id")?,
        fields: CameraFields {
            name: row.try_get("name")?,
            ip_address: row.try_get("ip_address")?,
            protocol: StreamProtocol::from(protocol),
            rtmp_port: u16::try_from(rtmp_port)
                .map_err(|_| ManagerError::server(format!("Stored rtmp_port {} out of range", rtmp_port)))?,
            app_name: row.try_get("app_name")?,
            stream_id: row.try_get("stream_id")?,
            rtsp_port: u16::try_from(rtsp_port)
                .map_err(|_| ManagerError::server(format!("Stored rtsp_port {} out of range", rtsp_port)))?,
            rtsp_path: row.try_get("rtsp_path")?,
            active: row.try_get("active")?,
        },
        hls_url: row.try_get("hls_url")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait]
impl DatabaseProvider for SqliteDatabase {
    async fn initialize(&self) -> Result<()> {
        let create_cameras_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                protocol TEXT NOT NULL DEFAULT 'rtmp',
                rtmp_port INTEGER NOT NULL DEFAULT 1935,
                app_name TEXT NOT NULL DEFAULT 'live',
                stream_id TEXT NOT NULL DEFAULT 'stream1',
                rtsp_port INTEGER NOT NULL DEFAULT 554,
                rtsp_path TEXT NOT NULL DEFAULT 'stream',
                hls_url TEXT,
                active BOOLEAN NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
            TABLE_CAMERAS
        );
        sqlx::query(&create_cameras_query)
            .execute(&self.pool)
            .await?;

        debug!("Camera schema initialized");
        Ok(())
    }

    async fn list_cameras(&self) -> Result<Vec<Camera>> {
        let query = format!("SELECT * FROM {} ORDER BY id ASC", TABLE_CAMERAS);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(camera_from_row).collect()
    }

    async fn get_camera(&self, id: CameraId) -> Result<Camera> {
        let query = format!("SELECT * FROM {} WHERE id = ?", TABLE_CAMERAS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => camera_from_row(&row),
            None => Err(ManagerError::camera_not_found(id)),
        }
    }

    async fn create_camera(&self, fields: &CameraFields) -> Result<Camera> {
        let now = Utc::now();
        let query = format!(
            r#"
            INSERT INTO {} (name, ip_address, protocol, rtmp_port, app_name, stream_id,
                            rtsp_port, rtsp_path, hls_url, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)
            "#,
            TABLE_CAMERAS
        );
        let result = sqlx::query(&query)
            .bind(&fields.name)
            .bind(&fields.ip_address)
            .bind(fields.protocol.as_str())
            .bind(i64::from(fields.rtmp_port))
            .bind(&fields.app_name)
            .bind(&fields.stream_id)
            .bind(i64::from(fields.rtsp_port))
            .bind(&fields.rtsp_path)
            .bind(fields.active)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        self.get_camera(result.last_insert_rowid()).await
    }

    async fn update_camera(&self, id: CameraId, fields: &CameraFields) -> Result<Camera> {
        let query = format!(
            r#"
            UPDATE {} SET name = ?, ip_address = ?, protocol = ?, rtmp_port = ?, app_name = ?,
                          stream_id = ?, rtsp_port = ?, rtsp_path = ?, active = ?, updated_at = ?
            WHERE id = ?
            "#,
            TABLE_CAMERAS
        );
        let result = sqlx::query(&query)
            .bind(&fields.name)
            .bind(&fields.ip_address)
            .bind(fields.protocol.as_str())
            .bind(i64::from(fields.rtmp_port))
            .bind(&fields.app_name)
            .bind(&fields.stream_id)
            .bind(i64::from(fields.rtsp_port))
            .bind(&fields.rtsp_path)
            .bind(fields.active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ManagerError::camera_not_found(id));
        }
        self.get_camera(id).await
    }

    async fn delete_camera(&self, id: CameraId) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE id = ?", TABLE_CAMERAS);
        let result = sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ManagerError::camera_not_found(id));
        }
        Ok(())
    }

    async fn set_active(&self, id: CameraId, active: bool) -> Result<()> {
        let query = format!("UPDATE {} SET active = ?, updated_at = ? WHERE id = ?", TABLE_CAMERAS);
        let result = sqlx::query(&query)
            .bind(active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ManagerError::camera_not_found(id));
        }
        Ok(())
    }

    async fn set_stream_state(&self, id: CameraId, active: bool, hls_url: Option<&str>) -> Result<()> {
        let query = format!(
            "UPDATE {} SET active = ?, hls_url = ?, updated_at = ? WHERE id = ?",
            TABLE_CAMERAS
        );
        let result = sqlx::query(&query)
            .bind(active)
            .bind(hls_url)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ManagerError::camera_not_found(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn database() -> SqliteDatabase {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    #[tokio::test]
    async fn create_get_and_list() {
        let db = database().await;
        let first = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();
        let second = db.create_camera(&CameraFields::new("Garage", "10.0.0.3")).await.unwrap();

        assert!(second.id > first.id);
        assert_eq!(first.hls_url, None);
        assert_eq!(first.created_at, first.updated_at);

        let fetched = db.get_camera(first.id).await.unwrap();
        assert_eq!(fetched.fields.name, "Porch");
        assert_eq!(fetched.fields.rtmp_port, 1935);

        let names: Vec<String> = db.list_cameras().await.unwrap()
            .into_iter().map(|c| c.fields.name).collect();
        assert_eq!(names, vec!["Porch", "Garage"]);
    }

    #[tokio::test]
    async fn update_keeps_created_at_and_hls_url() {
        let db = database().await;
        let cam = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();
        db.set_stream_state(cam.id, true, Some("http://media/hls/1/index.m3u8")).await.unwrap();

        let mut fields = cam.fields.clone();
        fields.name = "Back porch".to_string();
        fields.protocol = StreamProtocol::Rtsp;
        let updated = db.update_camera(cam.id, &fields).await.unwrap();

        assert_eq!(updated.fields.name, "Back porch");
        assert_eq!(updated.fields.protocol, StreamProtocol::Rtsp);
        assert_eq!(updated.created_at, cam.created_at);
        assert!(updated.updated_at >= cam.updated_at);
        assert_eq!(updated.hls_url.as_deref(), Some("http://media/hls/1/index.m3u8"));
    }

    #[tokio::test]
    async fn set_active_leaves_hls_url() {
        let db = database().await;
        let cam = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();
        db.set_stream_state(cam.id, true, Some("http://media/hls/1/index.m3u8")).await.unwrap();
        db.set_active(cam.id, false).await.unwrap();

        let cam = db.get_camera(cam.id).await.unwrap();
        assert!(!cam.is_active());
        assert!(cam.hls_url.is_some());
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let db = database().await;
        assert!(db.get_camera(42).await.unwrap_err().is_not_found());
        assert!(db.delete_camera(42).await.unwrap_err().is_not_found());
        assert!(db.set_active(42, true).await.unwrap_err().is_not_found());
        assert!(db.update_camera(42, &CameraFields::new("x", "10.0.0.1")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let db = database().await;
        let cam = db.create_camera(&CameraFields::new("Porch", "10.0.0.2")).await.unwrap();
        db.delete_camera(cam.id).await.unwrap();
        assert!(db.list_cameras().await.unwrap().is_empty());
    }
}
