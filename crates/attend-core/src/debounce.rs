//! Recognition debounce: temporal consensus over recent frames.
//!
//! A bounded window holds the last few per-frame matches. A user is
//! confirmed once they fill most of the window *and* hold the most recent
//! frames; recency beats frequency, so someone who matched earlier but was
//! replaced at the camera is not confirmed. Any frame without an acceptable
//! match clears the window. There is no time-based expiry.

use crate::matcher::MatchCandidate;
use crate::types::UserRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub const DEFAULT_WINDOW_CAPACITY: usize = 5;
pub const DEFAULT_CONSENSUS_COUNT: usize = 4;
pub const DEFAULT_RECENCY_COUNT: usize = 3;

/// Window key used by every station under [`WindowScope::Shared`].
pub const SHARED_WINDOW: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Frames kept in the window.
    pub capacity: usize,
    /// Minimum occurrences of one user anywhere in the window.
    pub consensus: usize,
    /// Number of most recent frames that must all be that user.
    pub recency: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_WINDOW_CAPACITY,
            consensus: DEFAULT_CONSENSUS_COUNT,
            recency: DEFAULT_RECENCY_COUNT,
        }
    }
}

/// What one frame contributed.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Match(MatchCandidate),
    /// No face, several faces, or nobody passed the thresholds.
    Miss,
}

/// Emitted once per confirmed recognition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub user: UserRef,
    /// Best similarity seen for this user in the confirming window.
    pub similarity: f32,
    /// Best (lowest) distance seen for this user in the confirming window.
    pub distance: f32,
    pub recognized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebounceState {
    Idle,
    Accumulating { frames: usize },
    Confirmed(RecognitionEvent),
}

/// Sliding window of recent per-frame matches.
#[derive(Debug, Clone)]
pub struct RecognitionWindow {
    config: DebounceConfig,
    frames: VecDeque<MatchCandidate>,
}

impl RecognitionWindow {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            frames: VecDeque::with_capacity(config.capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Feed one frame's result and evaluate consensus.
    pub fn observe(&mut self, observation: Observation) -> DebounceState {
        let candidate = match observation {
            Observation::Match(c) => c,
            Observation::Miss => {
                self.frames.clear();
                return DebounceState::Idle;
            }
        };

        self.frames.push_back(candidate);
        while self.frames.len() > self.config.capacity {
            self.frames.pop_front();
        }

        match self.consensus() {
            Some(event) => {
                self.frames.clear();
                DebounceState::Confirmed(event)
            }
            None => DebounceState::Accumulating {
                frames: self.frames.len(),
            },
        }
    }

    fn consensus(&self) -> Option<RecognitionEvent> {
        let recency = self.config.recency.max(1);
        if self.frames.len() < recency {
            return None;
        }

        // The only possible leader is whoever holds the most recent frames.
        let leader = self.frames.back()?.user.code.as_str();
        let holds_recent = self
            .frames
            .iter()
            .rev()
            .take(recency)
            .all(|f| f.user.code == leader);
        if !holds_recent {
            return None;
        }

        let count = self.frames.iter().filter(|f| f.user.code == leader).count();
        if count < self.config.consensus {
            return None;
        }

        let mine: Vec<&MatchCandidate> = self.frames.iter().filter(|f| f.user.code == leader).collect();
        let latest = mine.last()?;

        Some(RecognitionEvent {
            user: latest.user.clone(),
            similarity: mine.iter().map(|f| f.similarity).fold(f32::NEG_INFINITY, f32::max),
            distance: mine.iter().map(|f| f.distance).fold(f32::INFINITY, f32::min),
            recognized_at: Utc::now(),
        })
    }
}

/// Which stations share a debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowScope {
    /// One process-wide window: frames from every station interleave.
    #[default]
    Shared,
    /// One window per station id.
    PerStation,
}

impl FromStr for WindowScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "station" | "per_station" | "per-station" => Ok(Self::PerStation),
            other => Err(format!("unknown window scope: {other}")),
        }
    }
}

/// Debounce windows keyed by station, honoring the configured scope.
pub struct StationWindows {
    scope: WindowScope,
    config: DebounceConfig,
    windows: Mutex<HashMap<String, Arc<Mutex<RecognitionWindow>>>>,
}

impl StationWindows {
    pub fn new(scope: WindowScope, config: DebounceConfig) -> Self {
        Self {
            scope,
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// The window key a station maps to.
    pub fn key<'a>(&self, station: &'a str) -> &'a str {
        match self.scope {
            WindowScope::Shared => SHARED_WINDOW,
            WindowScope::PerStation => station,
        }
    }

    fn window(&self, station: &str) -> Arc<Mutex<RecognitionWindow>> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let config = self.config;
        Arc::clone(
            windows
                .entry(self.key(station).to_string())
                .or_insert_with(|| Arc::new(Mutex::new(RecognitionWindow::new(config)))),
        )
    }

    fn existing(&self, station: &str) -> Option<Arc<Mutex<RecognitionWindow>>> {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.get(self.key(station)).map(Arc::clone)
    }

    /// Drop the window for `station` if it is empty and nobody else holds it.
    ///
    /// Clones are only handed out under the map lock, so a strong count of
    /// one means no observer is between lookup and lock.
    fn forget_if_idle(&self, station: &str) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let key = self.key(station);
        let idle = windows.get(key).is_some_and(|w| {
            Arc::strong_count(w) == 1 && w.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
        });
        if idle {
            windows.remove(key);
        }
    }

    /// Push, evaluate and (on confirm) clear under one lock.
    pub fn observe(&self, station: &str, observation: Observation) -> DebounceState {
        let window = self.window(station);
        let state = window.lock().unwrap_or_else(|e| e.into_inner()).observe(observation);
        drop(window);
        if !matches!(state, DebounceState::Accumulating { .. }) {
            self.forget_if_idle(station);
        }
        state
    }

    pub fn clear(&self, station: &str) {
        if let Some(window) = self.existing(station) {
            window.lock().unwrap_or_else(|e| e.into_inner()).clear();
            drop(window);
            self.forget_if_idle(station);
        }
    }

    pub fn len(&self, station: &str) -> usize {
        self.existing(station)
            .map_or(0, |w| w.lock().unwrap_or_else(|e| e.into_inner()).len())
    }

    /// Number of windows currently held.
    pub fn tracked(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(code: &str, similarity: f32, distance: f32) -> Observation {
        Observation::Match(MatchCandidate {
            user: UserRef {
                id: code.bytes().map(i64::from).sum(),
                code: code.into(),
                name: format!("User {code}"),
            },
            similarity,
            distance,
        })
    }

    fn a() -> Observation {
        hit("A", 0.9, 0.4)
    }

    fn b() -> Observation {
        hit("B", 0.9, 0.4)
    }

    fn feed(window: &mut RecognitionWindow, frames: Vec<Observation>) -> Vec<DebounceState> {
        frames.into_iter().map(|f| window.observe(f)).collect()
    }

    fn confirmations(states: &[DebounceState]) -> Vec<&RecognitionEvent> {
        states
            .iter()
            .filter_map(|s| match s {
                DebounceState::Confirmed(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_four_in_a_row_confirms_once() {
        let mut w = RecognitionWindow::new(DebounceConfig::default());
        let states = feed(&mut w, vec![a(), a(), a(), a()]);

        let confirmed = confirmations(&states);
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].user.code, "A");
        assert!(matches!(states[3], DebounceState::Confirmed(_)));
        assert!(w.is_empty());
    }

    #[test]
    fn test_switch_on_last_frame_confirms_nobody() {
        let mut w = RecognitionWindow::new(DebounceConfig::default());
        let states = feed(&mut w, vec![a(), a(), a(), b()]);

        assert!(confirmations(&states).is_empty());
        assert_eq!(states[3], DebounceState::Accumulating { frames: 4 });
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn test_miss_clears_window() {
        let mut w = RecognitionWindow::new(DebounceConfig::default());
        feed(&mut w, vec![a(), a(), a()]);
        assert_eq!(w.observe(Observation::Miss), DebounceState::Idle);
        assert!(w.is_empty());

        assert_eq!(w.observe(a()), DebounceState::Accumulating { frames: 1 });
    }

    #[test]
    fn test_miss_after_confirmation_then_fresh_count() {
        let mut w = RecognitionWindow::new(DebounceConfig::default());
        let states = feed(&mut w, vec![a(), a(), a(), a(), Observation::Miss]);
        assert_eq!(confirmations(&states).len(), 1);
        assert_eq!(states[4], DebounceState::Idle);

        assert_eq!(w.observe(a()), DebounceState::Accumulating { frames: 1 });
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn test_recency_beats_frequency() {
        let mut w = RecognitionWindow::new(DebounceConfig::default());
        // Window ends as [A, A, B, A, A]: four A's but the last three are not all A.
        let states = feed(&mut w, vec![a(), a(), a(), b(), a(), a()]);
        assert!(confirmations(&states).is_empty());
        assert_eq!(w.len(), 5);

        // One more A: [A, B, A, A, A].
        let state = w.observe(a());
        assert!(matches!(state, DebounceState::Confirmed(ref e) if e.user.code == "A"));
    }

    #[test]
    fn test_recent_holder_wins_when_two_codes_reach_consensus() {
        let config = DebounceConfig { capacity: 5, consensus: 2, recency: 2 };
        for _ in 0..50 {
            // Ends as [A, B, A, B, B]: A and B both have two or more frames.
            let mut w = RecognitionWindow::new(config);
            let states = feed(&mut w, vec![a(), b(), a(), b(), b()]);
            assert!(confirmations(&states[..4]).is_empty());
            assert!(matches!(states[4], DebounceState::Confirmed(ref e) if e.user.code == "B"));
        }
    }

    #[test]
    fn test_low_consensus_confirms_each_run() {
        let mut w = RecognitionWindow::new(DebounceConfig { capacity: 5, consensus: 2, recency: 2 });
        let states = feed(&mut w, vec![a(), a(), b(), b()]);
        let confirmed: Vec<_> = confirmations(&states).iter().map(|e| e.user.code.clone()).collect();
        assert_eq!(confirmed, ["A", "B"]);
        assert!(matches!(states[3], DebounceState::Confirmed(ref e) if e.user.code == "B"));
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut w = RecognitionWindow::new(DebounceConfig::default());
        for i in 0..20 {
            let obs = if i % 2 == 0 { a() } else { b() };
            w.observe(obs);
            assert!(w.len() <= DEFAULT_WINDOW_CAPACITY);
        }
    }

    #[test]
    fn test_event_carries_best_scores() {
        let mut w = RecognitionWindow::new(DebounceConfig::default());
        let states = feed(
            &mut w,
            vec![hit("A", 0.80, 0.60), hit("A", 0.95, 0.50), hit("A", 0.85, 0.30), hit("A", 0.78, 0.70)],
        );
        let event = confirmations(&states)[0].clone();
        assert!((event.similarity - 0.95).abs() < 1e-6);
        assert!((event.distance - 0.30).abs() < 1e-6);
    }

    #[test]
    fn test_window_scope_parse() {
        assert_eq!("shared".parse::<WindowScope>().unwrap(), WindowScope::Shared);
        assert_eq!("Station".parse::<WindowScope>().unwrap(), WindowScope::PerStation);
        assert!("galaxy".parse::<WindowScope>().is_err());
    }

    #[test]
    fn test_shared_scope_interleaves_stations() {
        let windows = StationWindows::new(WindowScope::Shared, DebounceConfig::default());
        windows.observe("gate-1", a());
        windows.observe("gate-2", a());
        windows.observe("gate-1", a());
        let state = windows.observe("gate-2", a());
        assert!(matches!(state, DebounceState::Confirmed(_)));
    }

    #[test]
    fn test_per_station_scope_shards() {
        let windows = StationWindows::new(WindowScope::PerStation, DebounceConfig::default());
        windows.observe("gate-1", a());
        windows.observe("gate-1", a());
        windows.observe("gate-2", b());
        windows.observe("gate-1", a());
        assert_eq!(windows.len("gate-1"), 3);
        assert_eq!(windows.len("gate-2"), 1);

        windows.observe("gate-2", Observation::Miss);
        assert_eq!(windows.len("gate-1"), 3);
        assert!(matches!(windows.observe("gate-1", a()), DebounceState::Confirmed(_)));
    }

    #[test]
    fn test_idle_station_windows_are_dropped() {
        let windows = StationWindows::new(WindowScope::PerStation, DebounceConfig::default());
        for i in 0..50 {
            let station = format!("drive-by-{i}");
            windows.observe(&station, a());
            windows.observe(&station, Observation::Miss);
        }
        assert_eq!(windows.tracked(), 0);

        windows.observe("gate-1", a());
        windows.observe("gate-2", a());
        assert_eq!(windows.tracked(), 2);
        windows.clear("gate-2");
        assert_eq!(windows.tracked(), 1);
        assert_eq!(windows.len("gate-1"), 1);

        // Reading a station that never sent a frame creates nothing.
        assert_eq!(windows.len("gate-9"), 0);
        assert_eq!(windows.tracked(), 1);
    }

    #[test]
    fn test_concurrent_observers_lose_no_frames() {
        let windows = Arc::new(StationWindows::new(
            WindowScope::Shared,
            DebounceConfig { capacity: 1000, consensus: 1000, recency: 1000 },
        ));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let windows = Arc::clone(&windows);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        windows.observe(&format!("gate-{i}"), hit("A", 0.9, 0.4));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(windows.len("any"), 800);
    }
}
