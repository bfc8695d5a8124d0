//! Attendance sessions driven by confirmed recognitions.
//!
//! A confirmed recognition is parked as *pending* for its window until the
//! member types their code at the kiosk. Only then is a session opened, with
//! the entry time taken from the recognition itself.

use crate::store::{CompletedSession, PresentMember, Store, StoreError};
use attend_core::{RecognitionEvent, StationWindows};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("no face has been recognized yet")]
    NoPendingRecognition,
    #[error("recognition expired, please look at the camera again")]
    RecognitionExpired,
    #[error("member code does not match the recognized face")]
    CodeMismatch,
    #[error("unknown member code: {0}")]
    UnknownUser(String),
    #[error("member {0} is already checked in")]
    AlreadyCheckedIn(String),
    #[error("member {0} has no open session")]
    NoOpenSession(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reply to a successful check-in.
#[derive(Debug, Clone, Serialize)]
pub struct CheckIn {
    pub session_id: i64,
    pub code: String,
    pub name: String,
    pub entry_time: DateTime<Utc>,
}

/// Reply to a successful check-out.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOut {
    pub code: String,
    pub name: String,
    pub exit_time: DateTime<Utc>,
    pub duration_minutes: i64,
}

pub struct AttendanceManager {
    store: Arc<Store>,
    windows: Arc<StationWindows>,
    pending: Mutex<HashMap<String, RecognitionEvent>>,
    confirm_timeout: Duration,
}

impl AttendanceManager {
    pub fn new(store: Arc<Store>, windows: Arc<StationWindows>, confirm_timeout_secs: u64) -> Self {
        Self {
            store,
            windows,
            pending: Mutex::new(HashMap::new()),
            confirm_timeout: Duration::seconds(confirm_timeout_secs as i64),
        }
    }

    /// Park a confirmed recognition for `station`, replacing any older one.
    /// Recognitions that can no longer be confirmed are dropped.
    pub fn record(&self, station: &str, event: RecognitionEvent) {
        let key = self.windows.key(station).to_string();
        tracing::debug!(station, window = %key, user = %event.user.code, "recognition pending confirmation");
        let now = event.recognized_at;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|_, parked| now - parked.recognized_at <= self.confirm_timeout);
        pending.insert(key, event);
    }

    /// Number of debounce windows currently holding frames.
    pub fn tracked_windows(&self) -> usize {
        self.windows.tracked()
    }

    /// Number of recognitions waiting for confirmation.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn pending(&self, station: &str) -> Option<RecognitionEvent> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(self.windows.key(station))
            .cloned()
    }

    pub fn confirm(&self, station: &str, code: &str) -> Result<CheckIn, AttendanceError> {
        self.confirm_at(station, code, Utc::now())
    }

    /// Check in the pending recognition for `station` if `code` matches it
    /// and it is recent enough.
    pub fn confirm_at(&self, station: &str, code: &str, now: DateTime<Utc>) -> Result<CheckIn, AttendanceError> {
        let key = self.windows.key(station).to_string();
        let event = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .ok_or(AttendanceError::NoPendingRecognition)?;

        if now - event.recognized_at > self.confirm_timeout {
            return Err(AttendanceError::RecognitionExpired);
        }
        if event.user.code != code {
            return Err(AttendanceError::CodeMismatch);
        }

        let user = self
            .store
            .find_user(code)?
            .ok_or_else(|| AttendanceError::UnknownUser(code.to_string()))?;

        let session_id = match self.store.open_session(&user, event.recognized_at) {
            Ok(id) => id,
            Err(StoreError::SessionAlreadyOpen(c)) => return Err(AttendanceError::AlreadyCheckedIn(c)),
            Err(e) => return Err(e.into()),
        };

        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
        self.windows.clear(station);

        tracing::info!(session_id, user = %user.code, "checked in");
        Ok(CheckIn {
            session_id,
            code: user.code,
            name: user.name,
            entry_time: event.recognized_at,
        })
    }

    pub fn check_out(&self, code: &str) -> Result<CheckOut, AttendanceError> {
        self.check_out_at(code, Utc::now())
    }

    pub fn check_out_at(&self, code: &str, now: DateTime<Utc>) -> Result<CheckOut, AttendanceError> {
        let user = self
            .store
            .find_user(code)?
            .ok_or_else(|| AttendanceError::UnknownUser(code.to_string()))?;

        let CompletedSession {
            exit_time,
            duration_minutes,
            ..
        } = self
            .store
            .close_session(user.id, now)?
            .ok_or_else(|| AttendanceError::NoOpenSession(code.to_string()))?;

        tracing::info!(user = %user.code, duration_minutes, "checked out");
        Ok(CheckOut {
            code: user.code,
            name: user.name,
            exit_time,
            duration_minutes,
        })
    }

    /// Members currently checked in, newest first.
    pub fn present_members(&self) -> Result<Vec<PresentMember>, AttendanceError> {
        Ok(self.store.open_sessions()?)
    }

    /// A member's completed sessions, newest first.
    pub fn history(&self, code: &str, limit: usize) -> Result<Vec<CompletedSession>, AttendanceError> {
        let user = self
            .store
            .find_user(code)?
            .ok_or_else(|| AttendanceError::UnknownUser(code.to_string()))?;
        Ok(self.store.completed_sessions(user.id, limit)?)
    }
}
