use crate::attendance::{AttendanceError, AttendanceManager};
use crate::engine::{EngineError, EngineHandle};
use crate::store::{Store, StoreError};
use attend_core::{DebounceState, FrameReport, GalleryCache, RecognitionError, Thresholds, Verdict, WindowScope};
use serde_json::{json, Value};
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.libattend.Attend1";
pub const OBJECT_PATH: &str = "/org/libattend/Attend1";

/// D-Bus interface for the attendance kiosk daemon.
///
/// Bus name: org.libattend.Attend1
/// Object path: /org/libattend/Attend1
pub struct AttendService {
    engine: EngineHandle,
    store: Arc<Store>,
    gallery: Arc<GalleryCache>,
    attendance: Arc<AttendanceManager>,
    thresholds: Thresholds,
    window_scope: WindowScope,
    confirm_timeout_secs: u64,
    max_enroll_images: usize,
}

pub struct ServiceSettings {
    pub thresholds: Thresholds,
    pub window_scope: WindowScope,
    pub confirm_timeout_secs: u64,
    pub max_enroll_images: usize,
}

impl AttendService {
    pub fn new(
        engine: EngineHandle,
        store: Arc<Store>,
        gallery: Arc<GalleryCache>,
        attendance: Arc<AttendanceManager>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            engine,
            store,
            gallery,
            attendance,
            thresholds: settings.thresholds,
            window_scope: settings.window_scope,
            confirm_timeout_secs: settings.confirm_timeout_secs,
            max_enroll_images: settings.max_enroll_images,
        }
    }

    async fn handle_recognize(&self, station: &str, image: Vec<u8>) -> fdo::Result<Value> {
        let station = station_id(station)?;
        match self.engine.recognize(station.to_string(), image).await {
            Ok(report) => {
                if let Some(event) = report.confirmed() {
                    self.attendance.record(station, event.clone());
                }
                Ok(self.frame_json(&report))
            }
            Err(e) => kiosk_engine_failure(station, e),
        }
    }

    fn frame_json(&self, report: &FrameReport) -> Value {
        let verdict = report.verdict();
        match &report.state {
            DebounceState::Confirmed(event) => json!({
                "status": "recognized",
                "accepted": true,
                "user": event.user,
                "similarity": event.similarity,
                "distance": event.distance,
                "recognized_at": event.recognized_at,
                "confirm_within_secs": self.confirm_timeout_secs,
                "gallery_version": report.gallery_version,
            }),
            DebounceState::Accumulating { frames } => json!({
                "status": "matching",
                "accepted": verdict.accepted,
                "user": verdict.user,
                "similarity": verdict.similarity,
                "distance": verdict.distance,
                "frames": frames,
                "gallery_version": report.gallery_version,
            }),
            DebounceState::Idle => json!({
                "status": "not_recognized",
                "accepted": false,
                "gallery_version": report.gallery_version,
            }),
        }
    }

    async fn handle_verify(&self, code: &str, image: Vec<u8>) -> fdo::Result<Value> {
        match self.engine.verify(code.to_string(), image).await {
            Ok(outcome) => {
                let verdict = Verdict::from(&outcome);
                tracing::info!(code, accepted = verdict.accepted, "verify");
                Ok(json!(verdict))
            }
            Err(e) => kiosk_engine_failure("verify", e),
        }
    }

    async fn handle_enroll(&self, code: &str, images: Vec<Vec<u8>>) -> fdo::Result<u32> {
        if images.is_empty() || images.len() > self.max_enroll_images {
            return Err(fdo::Error::InvalidArgs(format!(
                "between 1 and {} images are required, got {}",
                self.max_enroll_images,
                images.len()
            )));
        }

        let store = Arc::clone(&self.store);
        let lookup = code.to_string();
        if blocking(move || store.find_user(&lookup)).await?.map_err(store_failure)?.is_none() {
            return Err(fdo::Error::Failed(format!("unknown member code: {code}")));
        }

        let embeddings = self.engine.embed_all(images).await.map_err(|e| match e {
            EngineError::EnrollImage { index, source } => {
                tracing::info!(code, index, error = %source, "enrollment image rejected");
                fdo::Error::InvalidArgs(format!("image {}: {}", index + 1, source))
            }
            other => engine_failure(other),
        })?;

        let store = Arc::clone(&self.store);
        let owner = code.to_string();
        let added = embeddings.len();
        let total = blocking(move || store.append_embeddings(&owner, &embeddings))
            .await?
            .map_err(store_failure)?;
        tracing::info!(code, added, total, "faces enrolled");

        self.reload_best_effort().await;
        Ok(total as u32)
    }

    /// Rebuild the gallery from the store.
    async fn reload(&self) -> fdo::Result<u64> {
        let store = Arc::clone(&self.store);
        let gallery = Arc::clone(&self.gallery);
        blocking(move || gallery.rebuild(store.as_ref()))
            .await?
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Reload after an enrollment write. A failure is logged, never returned.
    async fn reload_best_effort(&self) {
        if let Err(e) = self.reload().await {
            tracing::warn!(error = %e, "gallery reload after enrollment change failed");
        }
    }

    async fn with_attendance<T, F>(&self, f: F) -> fdo::Result<T>
    where
        F: FnOnce(&AttendanceManager) -> Result<T, AttendanceError> + Send + 'static,
        T: Send + 'static,
    {
        let manager = Arc::clone(&self.attendance);
        blocking(move || f(manager.as_ref())).await?.map_err(|e| match e {
            AttendanceError::Store(e) => store_failure(e),
            other => fdo::Error::Failed(other.to_string()),
        })
    }
}

#[interface(name = "org.libattend.Attend1")]
impl AttendService {
    /// Recognize the person in one kiosk frame (encoded JPEG/PNG bytes).
    async fn recognize(&self, station: &str, image: Vec<u8>) -> fdo::Result<String> {
        Ok(self.handle_recognize(station, image).await?.to_string())
    }

    /// Check one image against a claimed member code. Does not debounce.
    async fn verify(&self, code: &str, image: Vec<u8>) -> fdo::Result<String> {
        Ok(self.handle_verify(code, image).await?.to_string())
    }

    /// Open a session for the member most recently recognized at `station`.
    async fn confirm_attendance(&self, station: &str, code: &str) -> fdo::Result<String> {
        let (station, code) = (station_id(station)?.to_string(), code.to_string());
        let check_in = self.with_attendance(move |m| m.confirm(&station, &code)).await?;
        Ok(json!(check_in).to_string())
    }

    /// The recognition waiting for confirmation at `station`, or `null`.
    async fn pending_recognition(&self, station: &str) -> fdo::Result<String> {
        Ok(json!(self.attendance.pending(station_id(station)?)).to_string())
    }

    /// Close a member's open session.
    async fn check_out(&self, code: &str) -> fdo::Result<String> {
        let code = code.to_string();
        let check_out = self.with_attendance(move |m| m.check_out(&code)).await?;
        Ok(json!(check_out).to_string())
    }

    /// Members currently checked in, newest first.
    async fn present_members(&self) -> fdo::Result<String> {
        let present = self.with_attendance(|m| m.present_members()).await?;
        Ok(json!(present).to_string())
    }

    /// A member's completed sessions, newest first.
    async fn history(&self, code: &str, limit: u32) -> fdo::Result<String> {
        let code = code.to_string();
        let sessions = self.with_attendance(move |m| m.history(&code, limit as usize)).await?;
        Ok(json!(sessions).to_string())
    }

    /// Register a member. Returns the new numeric id.
    async fn add_user(&self, code: &str, name: &str) -> fdo::Result<i64> {
        if code.trim().is_empty() || name.trim().is_empty() {
            return Err(fdo::Error::InvalidArgs("code and name must not be empty".into()));
        }
        let store = Arc::clone(&self.store);
        let (code, name) = (code.trim().to_string(), name.trim().to_string());
        let user = blocking(move || store.add_user(&code, &name))
            .await?
            .map_err(|e| match e {
                StoreError::DuplicateCode(c) => fdo::Error::Failed(format!("member code already enrolled: {c}")),
                other => store_failure(other),
            })?;
        tracing::info!(id = user.id, code = %user.code, "member added");
        Ok(user.id)
    }

    /// Every registered member.
    async fn list_users(&self) -> fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let users = blocking(move || store.list_users()).await?.map_err(store_failure)?;
        Ok(json!(users).to_string())
    }

    /// Delete a member with all embeddings and sessions.
    async fn remove_user(&self, code: &str) -> fdo::Result<bool> {
        let store = Arc::clone(&self.store);
        let target = code.to_string();
        let removed = blocking(move || store.remove_user(&target)).await?.map_err(store_failure)?;
        if removed {
            tracing::info!(code, "member removed");
            self.reload_best_effort().await;
        }
        Ok(removed)
    }

    /// Append reference faces for a member. Returns their total embedding count.
    async fn enroll_faces(&self, code: &str, images: Vec<Vec<u8>>) -> fdo::Result<u32> {
        self.handle_enroll(code, images).await
    }

    /// Rebuild the gallery now. Returns the new gallery version.
    async fn reload_gallery(&self) -> fdo::Result<u64> {
        self.reload().await
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let snapshot = self.gallery.current();
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "gallery": {
                "built": snapshot.is_built(),
                "version": snapshot.version,
                "users": snapshot.entries.len(),
                "embeddings": snapshot.embedding_count(),
                "built_at": snapshot.built_at,
            },
            "thresholds": {
                "similarity": self.thresholds.similarity,
                "distance": self.thresholds.distance,
            },
            "window_scope": self.window_scope,
            "open_windows": self.attendance.tracked_windows(),
            "pending_recognitions": self.attendance.pending_count(),
        })
        .to_string())
    }
}

/// Longest station id accepted from callers.
const MAX_STATION_ID_LEN: usize = 64;

/// Trim and check a caller-supplied station id.
fn station_id(station: &str) -> fdo::Result<&str> {
    let station = station.trim();
    if station.is_empty() || station.len() > MAX_STATION_ID_LEN {
        return Err(fdo::Error::InvalidArgs(format!(
            "station id must be 1 to {MAX_STATION_ID_LEN} bytes"
        )));
    }
    Ok(station)
}

async fn blocking<T, F>(f: F) -> fdo::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))
}

/// Neutral kiosk reply for a failed frame; the detail only goes to the log.
fn kiosk_failure(context: &str, e: &RecognitionError) -> Value {
    if e.is_miss() {
        tracing::debug!(context, error = %e, "frame not usable");
    } else {
        tracing::warn!(context, error = %e, "recognition failed");
    }
    json!({ "status": e.kiosk_status(), "accepted": false })
}

/// Map an engine error on a kiosk frame. Anything the frame itself caused
/// gets a neutral status.
fn kiosk_engine_failure(context: &str, e: EngineError) -> fdo::Result<Value> {
    match e {
        EngineError::Recognition(e) => Ok(kiosk_failure(context, &e)),
        EngineError::Decode(err) => {
            tracing::debug!(context, error = %err, "frame could not be decoded");
            Ok(json!({ "status": "try_again", "accepted": false }))
        }
        other => Err(engine_failure(other)),
    }
}

fn engine_failure(e: EngineError) -> fdo::Error {
    match e {
        EngineError::Decode(err) => fdo::Error::InvalidArgs(format!("cannot decode image: {err}")),
        other => {
            tracing::error!(error = %other, "engine request failed");
            fdo::Error::Failed("recognition engine unavailable".into())
        }
    }
}

fn store_failure(e: StoreError) -> fdo::Error {
    tracing::error!(error = %e, "store operation failed");
    fdo::Error::Failed("storage error".into())
}
