use crate::engine::{EngineError, EngineHandle};
use chrono::NaiveDate;
use rollcall_core::{SessionError, DATE_FORMAT};
use zbus::interface;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.freedesktop.Rollcall1
/// Object path: /org/freedesktop/Rollcall1
pub struct RollcallService {
    engine: EngineHandle,
}

impl RollcallService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.freedesktop.Rollcall1")]
impl RollcallService {
    /// Start the camera loop: frames are matched and attendance marked.
    async fn start_camera(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start_camera requested");
        self.engine.start_camera().await.map_err(to_fdo)
    }

    async fn stop_camera(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop_camera requested");
        self.engine.stop_camera().await.map_err(to_fdo)
    }

    /// Capture the current face for the next registration.
    async fn capture(&self) -> zbus::fdo::Result<()> {
        tracing::info!("capture requested");
        self.engine.capture().await.map_err(to_fdo)
    }

    /// Register a student with the last captured face. Returns the student as JSON.
    async fn register_student(
        &self,
        student_id: &str,
        name: &str,
        age: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(student_id, name, "register_student requested");
        let student = self
            .engine
            .register(student_id.to_string(), name.to_string(), age.to_string())
            .await
            .map_err(to_fdo)?;
        to_json(&student)
    }

    /// Attendance report as JSON for `date` (YYYY-MM-DD), or today when empty.
    async fn report(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let rows = self.engine.report(date).await.map_err(to_fdo)?;
        to_json(&rows)
    }

    /// Enrolled students as JSON, in registration order.
    async fn list_students(&self) -> zbus::fdo::Result<String> {
        let students = self.engine.list_students().await.map_err(to_fdo)?;
        to_json(&students)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera_on": status.camera_on,
            "gallery_size": status.gallery_size,
            "pending_capture": status.pending_capture,
            "frames_processed": status.frames_processed,
            "last_marked": status.last_marked,
        })
        .to_string())
    }
}

fn parse_date(text: &str) -> zbus::fdo::Result<Option<NaiveDate>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map(Some)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad date {text:?}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Map engine outcomes to D-Bus errors the operator console can tell apart.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Session(SessionError::Validation(e)) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        EngineError::Session(SessionError::DuplicateStudent(id)) => {
            zbus::fdo::Error::FileExists(format!("student id already exists: {id}"))
        }
        other => {
            tracing::warn!(error = %other, "request failed");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}
