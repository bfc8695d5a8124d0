//! Dual-threshold gallery matching.
//!
//! For every enrolled user the probe is scored against each stored
//! embedding individually; the user's best similarity and best distance are
//! taken independently. A user is accepted only if both clear their
//! thresholds.

use crate::gallery::{GalleryEntry, GallerySnapshot};
use crate::types::{Embedding, UserRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.75;
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.85;

/// Acceptance thresholds. Both must hold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Minimum cosine similarity (inclusive).
    pub similarity: f32,
    /// Maximum Euclidean distance (inclusive).
    pub distance: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            similarity: DEFAULT_SIMILARITY_THRESHOLD,
            distance: DEFAULT_DISTANCE_THRESHOLD,
        }
    }
}

impl Thresholds {
    pub fn accepts(&self, similarity: f32, distance: f32) -> bool {
        similarity >= self.similarity && distance <= self.distance
    }
}

/// A user's best scores against one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub user: UserRef,
    pub similarity: f32,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(MatchCandidate),
    /// Nobody passed both thresholds. `closest` is the highest-similarity
    /// user, kept for diagnostics only.
    NoAcceptableMatch { closest: Option<MatchCandidate> },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched(_))
    }

    pub fn matched(&self) -> Option<&MatchCandidate> {
        match self {
            MatchOutcome::Matched(c) => Some(c),
            MatchOutcome::NoAcceptableMatch { .. } => None,
        }
    }
}

/// Strategy for comparing a probe embedding against the gallery.
pub trait Matcher {
    /// 1:N identification against every enrolled user.
    fn identify(&self, probe: &Embedding, gallery: &GallerySnapshot) -> MatchOutcome;

    /// 1:1 verification against the user enrolled under `code` only.
    fn verify(&self, probe: &Embedding, gallery: &GallerySnapshot, code: &str) -> MatchOutcome;
}

/// Cosine similarity AND Euclidean distance matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct DualThresholdMatcher {
    pub thresholds: Thresholds,
}

impl DualThresholdMatcher {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    fn decide(&self, scored: Vec<MatchCandidate>) -> MatchOutcome {
        let closest = scored
            .iter()
            .max_by(|a, b| a.similarity.total_cmp(&b.similarity))
            .cloned();

        let best = scored
            .into_iter()
            .filter(|c| self.thresholds.accepts(c.similarity, c.distance))
            .max_by(rank);

        match best {
            Some(candidate) => MatchOutcome::Matched(candidate),
            None => MatchOutcome::NoAcceptableMatch { closest },
        }
    }
}

impl Matcher for DualThresholdMatcher {
    fn identify(&self, probe: &Embedding, gallery: &GallerySnapshot) -> MatchOutcome {
        let scored = gallery
            .entries
            .iter()
            .filter_map(|entry| score_entry(probe, entry))
            .collect();
        self.decide(scored)
    }

    fn verify(&self, probe: &Embedding, gallery: &GallerySnapshot, code: &str) -> MatchOutcome {
        let scored = gallery
            .find(code)
            .and_then(|entry| score_entry(probe, entry))
            .into_iter()
            .collect();
        self.decide(scored)
    }
}

/// Higher similarity wins; equal similarity falls back to lower distance.
fn rank(a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    a.similarity
        .total_cmp(&b.similarity)
        .then_with(|| b.distance.total_cmp(&a.distance))
}

/// Best similarity and best distance of one user, taken independently over
/// all of their embeddings. `None` for a user with no embeddings.
pub fn score_entry(probe: &Embedding, entry: &GalleryEntry) -> Option<MatchCandidate> {
    if entry.embeddings.is_empty() {
        return None;
    }

    let mut best_sim = f32::NEG_INFINITY;
    let mut best_dist = f32::INFINITY;
    for reference in &entry.embeddings {
        best_sim = best_sim.max(probe.similarity(reference));
        best_dist = best_dist.min(probe.euclidean_distance(reference));
    }

    Some(MatchCandidate {
        user: entry.user.clone(),
        similarity: best_sim,
        distance: best_dist,
    })
}
