//! Boundary detection over playback ticks.
//!
//! Last-fired values live in an explicit table keyed by (session, video, kind). An entry
//! only moves forward, so a backward seek never re-fires a boundary. A forward seek jumps
//! straight to the newest boundary; anything in between is skipped for good.

use std::collections::HashMap;

use serde::Serialize;

use crate::settings::ScheduleSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BoundaryKind {
    Capture,
    Rating,
}

impl BoundaryKind {
    pub const ALL: [BoundaryKind; 2] = [BoundaryKind::Capture, BoundaryKind::Rating];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryEvent {
    pub kind: BoundaryKind,
    pub session_id: String,
    pub video_id: String,
    pub boundary_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MarkKey {
    session_id: String,
    video_id: String,
    kind: BoundaryKind,
}

pub struct BoundaryScheduler {
    capture_interval_secs: u64,
    rating_interval_secs: u64,
    last_fired: HashMap<MarkKey, u64>,
}

impl BoundaryScheduler {
    pub fn new(schedule: ScheduleSettings) -> Self {
        Self {
            capture_interval_secs: schedule.capture_interval_secs.max(1),
            rating_interval_secs: schedule.rating_interval_secs.max(1),
            last_fired: HashMap::new(),
        }
    }

    pub fn interval(&self, kind: BoundaryKind) -> u64 {
        match kind {
            BoundaryKind::Capture => self.capture_interval_secs,
            BoundaryKind::Rating => self.rating_interval_secs,
        }
    }

    /// On a tick: returns the boundaries that fire now, in kind order. Ignored when paused.
    ///
    /// The high-water mark is updated before returning, so callers may dispatch async
    /// work for the events without risking a second fire on the next tick.
    pub fn observe(
        &mut self,
        session_id: &str,
        video_id: &str,
        position_secs: u64,
        paused: bool,
    ) -> Vec<BoundaryEvent> {
        if paused {
            return Vec::new();
        }

        let mut events = Vec::new();
        for kind in BoundaryKind::ALL {
            let interval = self.interval(kind);
            let boundary_sec = (position_secs / interval) * interval;
            if boundary_sec == 0 {
                continue;
            }

            let key = MarkKey {
                session_id: session_id.to_string(),
                video_id: video_id.to_string(),
                kind,
            };
            let last = self.last_fired.get(&key).copied();
            if last.is_some_and(|last| boundary_sec <= last) {
                continue;
            }

            self.last_fired.insert(key, boundary_sec);
            events.push(BoundaryEvent {
                kind,
                session_id: session_id.to_string(),
                video_id: video_id.to_string(),
                boundary_sec,
            });
        }
        events
    }

    /// Forget every mark for a video, so replaying it starts from scratch.
    pub fn reset_video(&mut self, session_id: &str, video_id: &str) {
        self.last_fired
            .retain(|key, _| !(key.session_id == session_id && key.video_id == video_id));
    }

    /// Forget everything recorded for a session.
    pub fn reset_session(&mut self, session_id: &str) {
        self.last_fired.retain(|key, _| key.session_id != session_id);
    }

    pub fn last_fired(&self, session_id: &str, video_id: &str, kind: BoundaryKind) -> Option<u64> {
        self.last_fired
            .get(&MarkKey {
                session_id: session_id.to_string(),
                video_id: video_id.to_string(),
                kind,
            })
            .copied()
    }
}
