/// Status snapshots and frame timing.
///
/// The scene graph builds a [`StatusSnapshot`] after every tick and
/// publishes it through [`SharedStatus`]. Readers on other threads take the
/// lock with a short timeout and fall back to the last snapshot they saw,
/// so a slow tick never blocks a client.
use log::warn;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::behavior::BehaviorState;
use super::transcript::TranscriptEntry;
use crate::schema::attributes::{Emotion, EmotionScores, SpeakingStyle};
use crate::schema::event::GlitchSettings;

/// Frames kept for the rolling averages.
pub const FRAME_BUFFER: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameSummary {
    pub average_frame_time: f64,
    pub max_frame_time: f64,
    pub min_frame_time: f64,
    pub total_frames: u64,
}

/// Rolling frame-time buffer.
#[derive(Debug, Clone, Default)]
pub struct FrameMetrics {
    frame_start: Option<Instant>,
    buffer: VecDeque<Duration>,
    total_frames: u64,
}

impl FrameMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, now: Instant) {
        if self.frame_start.is_some() {
            warn!("Frame already in progress");
            return;
        }
        self.frame_start = Some(now);
    }

    pub fn end(&mut self, now: Instant) {
        let Some(start) = self.frame_start.take() else {
            warn!("Frame not started");
            return;
        };
        self.buffer.push_back(now.saturating_duration_since(start));
        if self.buffer.len() > FRAME_BUFFER {
            self.buffer.pop_front();
        }
        self.total_frames += 1;
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn summary(&self) -> Option<FrameSummary> {
        let max = self.buffer.iter().max()?;
        let min = self.buffer.iter().min()?;
        let total: Duration = self.buffer.iter().sum();
        Some(FrameSummary {
            average_frame_time: total.as_secs_f64() / self.buffer.len() as f64,
            max_frame_time: max.as_secs_f64(),
            min_frame_time: min.as_secs_f64(),
            total_frames: self.total_frames,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacterStatus {
    pub name: String,
    pub persona: String,
    pub behavior: String,
    pub state: BehaviorState,
    pub queue_length: usize,
    pub speaking: bool,
    pub awaiting_completion: bool,
    pub emotion: Emotion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardStatus {
    pub target: String,
    pub guard: String,
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionStatus {
    pub scores: EmotionScores,
    pub style: SpeakingStyle,
    pub dominant: Emotion,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub script: String,
    pub scene: String,
    pub scene_meta: BTreeMap<String, String>,
    pub epoch: u64,
    pub elapsed: f64,
    pub characters: Vec<CharacterStatus>,
    pub manual_transitions: Vec<String>,
    pub automatic: Vec<GuardStatus>,
    pub listening: bool,
    pub glitch: GlitchSettings,
    pub user_emotion: String,
    pub emotions: Option<EmotionStatus>,
    pub transcript: Vec<TranscriptEntry>,
    pub finished: bool,
    pub frames: u64,
    pub metrics: Option<FrameSummary>,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Publishing side of the latest snapshot.
#[derive(Debug, Clone, Default)]
pub struct SharedStatus {
    latest: Arc<Mutex<StatusSnapshot>>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        *self.latest.lock() = snapshot;
    }

    pub fn reader(&self, timeout: Duration) -> StatusReader {
        StatusReader {
            latest: Arc::clone(&self.latest),
            cached: StatusSnapshot::default(),
            timeout,
        }
    }
}

/// Reads snapshots without ever waiting longer than its timeout.
#[derive(Debug)]
pub struct StatusReader {
    latest: Arc<Mutex<StatusSnapshot>>,
    cached: StatusSnapshot,
    timeout: Duration,
}

impl StatusReader {
    pub fn read(&mut self) -> &StatusSnapshot {
        match self.latest.try_lock_for(self.timeout) {
            Some(latest) => self.cached = latest.clone(),
            None => warn!("Status lock busy, serving cached snapshot"),
        }
        &self.cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_summary() {
        let mut metrics = FrameMetrics::new();
        assert!(metrics.summary().is_none());
        let t0 = Instant::now();
        metrics.start(t0);
        metrics.end(t0 + Duration::from_millis(10));
        metrics.start(t0 + Duration::from_millis(20));
        metrics.end(t0 + Duration::from_millis(50));
        let summary = metrics.summary().unwrap();
        assert_eq!(summary.total_frames, 2);
        assert!((summary.average_frame_time - 0.02).abs() < 1e-9);
        assert!((summary.max_frame_time - 0.03).abs() < 1e-9);
        assert!((summary.min_frame_time - 0.01).abs() < 1e-9);
    }

    #[test]
    fn metrics_buffer_is_bounded() {
        let mut metrics = FrameMetrics::new();
        let t0 = Instant::now();
        for i in 0..(FRAME_BUFFER as u64 + 5) {
            let start = t0 + Duration::from_millis(i * 2);
            metrics.start(start);
            metrics.end(start + Duration::from_millis(1));
        }
        assert_eq!(metrics.total_frames(), FRAME_BUFFER as u64 + 5);
        assert_eq!(metrics.buffer.len(), FRAME_BUFFER);
    }

    #[test]
    fn end_without_start_is_ignored() {
        let mut metrics = FrameMetrics::new();
        metrics.end(Instant::now());
        assert_eq!(metrics.total_frames(), 0);
    }

    #[test]
    fn reader_falls_back_to_cache() {
        let shared = SharedStatus::new();
        let mut reader = shared.reader(Duration::from_millis(1));
        shared.publish(StatusSnapshot {
            scene: "s_intro".into(),
            ..Default::default()
        });
        assert_eq!(reader.read().scene, "s_intro");

        let _held = shared.latest.lock();
        assert_eq!(reader.read().scene, "s_intro");
    }

    #[test]
    fn snapshot_serializes() {
        let snapshot = StatusSnapshot {
            scene: "s_intro".into(),
            listening: true,
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["scene"], "s_intro");
        assert_eq!(json["listening"], true);
        assert_eq!(json["glitch"]["active"], false);
    }
}
