//! Gallery cache: a versioned, whole-snapshot view of every enrolled face.
//!
//! Readers take an `Arc` to the current snapshot and keep using it for as
//! long as they like. A rebuild reads durable storage, builds a brand new
//! snapshot off to the side, and swaps the pointer in one step, so a reader
//! sees either the old snapshot or the new one and never a mix. Rebuilds
//! are serialized; version numbers only ever go up.

use crate::types::{Embedding, UserRef};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

/// One row from durable storage: a user and one serialized embedding blob.
#[derive(Debug, Clone)]
pub struct StoredFaceRow {
    pub user_id: i64,
    pub code: String,
    pub name: String,
    pub blob: String,
}

/// Durable storage as seen by the cache.
pub trait GallerySource {
    type Error: std::fmt::Display;

    /// Every (user, embedding blob) row. A malformed blob must not fail the read.
    fn fetch_rows(&self) -> Result<Vec<StoredFaceRow>, Self::Error>;
}

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery has never been built")]
    Unavailable,
    #[error("gallery source failed: {0}")]
    Source(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum BlobError {
    #[error("unparsable embedding blob: {0}")]
    Parse(String),
    #[error("empty embedding")]
    Empty,
    #[error("embedding contains non-finite values")]
    NonFinite,
}

/// One enrolled user and all of their reference embeddings.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub user: UserRef,
    /// Unit-normalized, compared one by one, never averaged.
    pub embeddings: Vec<Embedding>,
}

#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    /// 0 until the first successful rebuild.
    pub version: u64,
    pub entries: Vec<GalleryEntry>,
    pub built_at: Option<DateTime<Utc>>,
}

impl GallerySnapshot {
    pub fn is_built(&self) -> bool {
        self.version > 0
    }

    pub fn find(&self, code: &str) -> Option<&GalleryEntry> {
        self.entries.iter().find(|e| e.user.code == code)
    }

    pub fn embedding_count(&self) -> usize {
        self.entries.iter().map(|e| e.embeddings.len()).sum()
    }
}

/// Process-wide holder of the current [`GallerySnapshot`].
pub struct GalleryCache {
    current: RwLock<Arc<GallerySnapshot>>,
    rebuild_lock: Mutex<()>,
}

impl Default for GalleryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GalleryCache {
    /// An empty, unbuilt cache (version 0).
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(GallerySnapshot::default())),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// The latest snapshot, built or not.
    pub fn current(&self) -> Arc<GallerySnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// The latest snapshot, or [`GalleryError::Unavailable`] if no rebuild
    /// has ever succeeded.
    pub fn require(&self) -> Result<Arc<GallerySnapshot>, GalleryError> {
        let snapshot = self.current();
        if snapshot.is_built() {
            Ok(snapshot)
        } else {
            Err(GalleryError::Unavailable)
        }
    }

    pub fn version(&self) -> u64 {
        self.current().version
    }

    /// Reload everything from `source` and swap the result in.
    ///
    /// On a source failure the previous snapshot stays in place and the
    /// error is returned. Returns the new version on success.
    pub fn rebuild<S: GallerySource>(&self, source: &S) -> Result<u64, GalleryError> {
        let _serialized = self.rebuild_lock.lock().unwrap_or_else(|e| e.into_inner());

        let rows = source.fetch_rows().map_err(|e| {
            tracing::warn!(error = %e, version = self.version(), "gallery rebuild failed, keeping previous snapshot");
            GalleryError::Source(e.to_string())
        })?;

        let entries = build_entries(rows);
        let version = self.version() + 1;
        let snapshot = GallerySnapshot {
            version,
            entries,
            built_at: Some(Utc::now()),
        };

        tracing::info!(
            version,
            users = snapshot.entries.len(),
            embeddings = snapshot.embedding_count(),
            "gallery rebuilt"
        );

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(snapshot);
        Ok(version)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredBlob {
    One(Vec<f32>),
    Many(Vec<Vec<f32>>),
}

/// Decode a stored blob: a JSON array of numbers, or an array of such arrays.
///
/// Each vector is reported separately so one bad vector does not discard its
/// siblings.
pub fn parse_blob(blob: &str) -> Result<Vec<Result<Embedding, BlobError>>, BlobError> {
    let parsed: StoredBlob =
        serde_json::from_str(blob).map_err(|e| BlobError::Parse(e.to_string()))?;

    let vectors = match parsed {
        StoredBlob::One(v) => vec![v],
        StoredBlob::Many(vs) => vs,
    };

    Ok(vectors.into_iter().map(validate_vector).collect())
}

fn validate_vector(values: Vec<f32>) -> Result<Embedding, BlobError> {
    if values.is_empty() {
        return Err(BlobError::Empty);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(BlobError::NonFinite);
    }
    // Re-normalize: stored vectors are not trusted to be unit length.
    Ok(Embedding::normalized(values))
}

/// Group rows by user, dropping malformed embeddings and users left with none.
///
/// User order follows first appearance in `rows`.
pub fn build_entries(rows: Vec<StoredFaceRow>) -> Vec<GalleryEntry> {
    let mut entries: Vec<GalleryEntry> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();

    for row in rows {
        let decoded = match parse_blob(&row.blob) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(user = %row.code, error = %e, "skipping malformed embedding blob");
                continue;
            }
        };

        let slot = *index.entry(row.user_id).or_insert_with(|| {
            entries.push(GalleryEntry {
                user: UserRef {
                    id: row.user_id,
                    code: row.code.clone(),
                    name: row.name.clone(),
                },
                embeddings: Vec::new(),
            });
            entries.len() - 1
        });

        for item in decoded {
            match item {
                Ok(embedding) => entries[slot].embeddings.push(embedding),
                Err(e) => tracing::warn!(user = %row.code, error = %e, "skipping malformed embedding"),
            }
        }
    }

    entries.retain(|e| !e.embeddings.is_empty());
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Rows(Vec<StoredFaceRow>);

    impl GallerySource for Rows {
        type Error = String;

        fn fetch_rows(&self) -> Result<Vec<StoredFaceRow>, String> {
            Ok(self.0.clone())
        }
    }

    struct Unreachable;

    impl GallerySource for Unreachable {
        type Error = String;

        fn fetch_rows(&self) -> Result<Vec<StoredFaceRow>, String> {
            Err("database is locked".into())
        }
    }

    fn row(id: i64, code: &str, blob: &str) -> StoredFaceRow {
        StoredFaceRow {
            user_id: id,
            code: code.into(),
            name: format!("User {code}"),
            blob: blob.into(),
        }
    }

    #[test]
    fn test_parse_single_and_nested() {
        let one = parse_blob("[3.0, 4.0]").unwrap();
        assert_eq!(one.len(), 1);
        let many = parse_blob("[[1.0, 0.0], [0.0, 2.0]]").unwrap();
        assert_eq!(many.len(), 2);
        let second = many[1].as_ref().unwrap();
        assert!((second.values[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_blob("not json"), Err(BlobError::Parse(_))));
        assert!(matches!(parse_blob("{\"a\": 1}"), Err(BlobError::Parse(_))));
    }

    #[test]
    fn test_parse_flags_empty_vector() {
        let items = parse_blob("[[], [1.0]]").unwrap();
        assert_eq!(items[0], Err(BlobError::Empty));
        assert!(items[1].is_ok());
    }

    #[test]
    fn test_build_entries_renormalizes_and_groups() {
        let entries = build_entries(vec![
            row(1, "M001", "[3.0, 4.0]"),
            row(2, "M002", "[0.0, 5.0]"),
            row(1, "M001", "[[10.0, 0.0]]"),
        ]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].user.code, "M001");
        assert_eq!(entries[0].embeddings.len(), 2);
        for e in &entries[0].embeddings {
            assert!((e.norm() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_build_entries_skips_malformed_without_aborting() {
        let entries = build_entries(vec![
            row(1, "M001", "{broken"),
            row(2, "M002", "[]"),
            row(3, "M003", "[0.6, 0.8]"),
        ]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user.code, "M003");
    }

    #[test]
    fn test_unbuilt_cache_unavailable() {
        let cache = GalleryCache::new();
        assert_eq!(cache.version(), 0);
        assert!(matches!(cache.require(), Err(GalleryError::Unavailable)));
    }

    #[test]
    fn test_rebuild_of_empty_store_is_available() {
        let cache = GalleryCache::new();
        assert_eq!(cache.rebuild(&Rows(vec![])).unwrap(), 1);
        let snap = cache.require().unwrap();
        assert!(snap.entries.is_empty());
        assert!(snap.built_at.is_some());
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_snapshot() {
        let cache = GalleryCache::new();
        cache.rebuild(&Rows(vec![row(1, "M001", "[1.0, 0.0]")])).unwrap();

        let err = cache.rebuild(&Unreachable).unwrap_err();
        assert!(matches!(err, GalleryError::Source(_)));

        let snap = cache.require().unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.entries.len(), 1);
    }

    #[test]
    fn test_old_snapshot_survives_swap() {
        let cache = GalleryCache::new();
        cache.rebuild(&Rows(vec![row(1, "M001", "[1.0, 0.0]")])).unwrap();
        let held = cache.current();

        cache.rebuild(&Rows(vec![])).unwrap();
        assert_eq!(held.version, 1);
        assert_eq!(held.entries.len(), 1);
        assert_eq!(cache.current().version, 2);
    }

    #[test]
    fn test_versions_monotonic_under_concurrent_rebuilds() {
        let cache = Arc::new(GalleryCache::new());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut last = 0u64;
                    while !done.load(Ordering::Relaxed) {
                        let snap = cache.current();
                        assert!(snap.version >= last, "version went backwards: {last} -> {}", snap.version);
                        // A snapshot is whole: every built version here has both users.
                        if snap.is_built() {
                            assert_eq!(snap.entries.len(), 2);
                        }
                        last = snap.version;
                    }
                })
            })
            .collect();

        let source = Rows(vec![row(1, "M001", "[1.0, 0.0]"), row(2, "M002", "[0.0, 1.0]")]);
        let writers: Vec<_> = (0..3)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let source = Rows(source.0.clone());
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        cache.rebuild(&source).unwrap();
                    }
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }

        assert_eq!(cache.version(), 150);
    }
}
