use crate::engine::{EngineError, EngineHandle};
use attendly_core::report::summarize;
use attendly_core::{DateRange, Gallery, GalleryError, SinkHandle};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.attendly.Attendance1
/// Object path: /org/attendly/Attendance1
pub struct AttendanceService {
    pub engine: EngineHandle,
    pub gallery: Arc<Gallery>,
    pub sink: SinkHandle,
}

#[interface(name = "org.attendly.Attendance1")]
impl AttendanceService {
    /// Enroll an identity from one or more image files. Returns the number
    /// of reference embeddings stored.
    async fn enroll(&self, identity_id: &str, name: &str, image_paths: Vec<String>) -> zbus::fdo::Result<u32> {
        tracing::info!(identity = identity_id, images = image_paths.len(), "enroll requested");
        if identity_id.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identity id must not be empty".into()));
        }
        let paths = image_paths.into_iter().map(PathBuf::from).collect();
        let count = self
            .engine
            .enroll(identity_id.to_string(), name.to_string(), paths)
            .await
            .map_err(engine_err)?;
        Ok(count as u32)
    }

    async fn remove_identity(&self, identity_id: &str) -> zbus::fdo::Result<()> {
        tracing::info!(identity = identity_id, "remove requested");
        self.engine.remove(identity_id.to_string()).await.map_err(engine_err)
    }

    /// Enrolled identities as a JSON array of `{id, name, references}`.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let list: Vec<_> = self
            .gallery
            .snapshot()
            .iter()
            .map(|i| serde_json::json!({ "id": i.id, "name": i.name, "references": i.references.len() }))
            .collect();
        Ok(serde_json::Value::Array(list).to_string())
    }

    async fn start_capture(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start capture requested");
        self.engine.start_capture().await.map_err(engine_err)
    }

    async fn stop_capture(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop capture requested");
        self.engine.stop_capture().await.map_err(engine_err)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(engine_err)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "capturing": status.capturing,
            "camera": status.camera_device,
            "enrolled": status.enrolled,
            "active_sessions": status.active_sessions,
        })
        .to_string())
    }

    /// Attendance records between two `YYYY-MM-DD` dates (inclusive), as
    /// JSON. An empty `identity_id` means every identity.
    async fn query(&self, from: &str, to: &str, identity_id: &str) -> zbus::fdo::Result<String> {
        let range = parse_range(from, to)?;
        let filter = (!identity_id.is_empty()).then(|| identity_id.to_string());
        let records = self.sink.query(range, filter).await.map_err(failed)?;
        serde_json::to_string(&records).map_err(failed)
    }

    /// Per-identity attendance percentages over a date range, as JSON.
    async fn summary(&self, from: &str, to: &str) -> zbus::fdo::Result<String> {
        let range = parse_range(from, to)?;
        let records = self.sink.query(range, None).await.map_err(failed)?;
        let identities = self.gallery.all();
        serde_json::to_string(&summarize(&records, &identities)).map_err(failed)
    }
}

fn parse_range(from: &str, to: &str) -> zbus::fdo::Result<DateRange> {
    let parse = |s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid date {s:?}: {e}")))
    };
    let (from, to) = (parse(from)?, parse(to)?);
    if from > to {
        return Err(zbus::fdo::Error::InvalidArgs(format!("range start {from} is after end {to}")));
    }
    Ok(DateRange::new(from, to))
}

fn engine_err(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Gallery(GalleryError::NotFound(id)) => {
            zbus::fdo::Error::InvalidArgs(format!("identity not found: {id}"))
        }
        EngineError::Gallery(e) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        EngineError::NoFaceDetected => zbus::fdo::Error::Failed(err.to_string()),
        other => {
            tracing::warn!(error = %other, "request failed");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

fn failed(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}
