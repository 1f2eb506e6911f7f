use serde::Serialize;
use tokio::time::Instant;

use crate::models::VideoRef;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Paused,
    Ended,
}

impl Default for PlaybackStatus {
    fn default() -> Self {
        PlaybackStatus::Idle
    }
}

/// One clock report, emitted once per second while a video is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackTick {
    pub video: VideoRef,
    pub position_secs: u64,
    pub paused: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    pub video: Option<VideoRef>,
    pub duration_secs: Option<u64>,
    pub position_ms: u64,
    /// Position accumulated before the current playing window; combines with
    /// `running_anchor` to compute the true position.
    #[serde(skip)]
    position_ms_baseline: u64,
    #[serde(skip)]
    running_anchor: Option<Instant>,
}

impl PlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to `video`, paused at zero.
    pub fn load(&mut self, video: VideoRef, duration_secs: Option<u64>) {
        *self = Self {
            status: PlaybackStatus::Paused,
            video: Some(video),
            duration_secs,
            ..Self::default()
        };
    }

    pub fn play(&mut self, now: Instant) {
        if self.status != PlaybackStatus::Paused {
            return;
        }
        self.status = PlaybackStatus::Playing;
        self.position_ms_baseline = self.position_ms;
        self.running_anchor = Some(now);
    }

    pub fn pause(&mut self, now: Instant) {
        if self.status != PlaybackStatus::Playing {
            return;
        }
        self.sync_position(now);
        self.status = PlaybackStatus::Paused;
        self.running_anchor = None;
        self.position_ms_baseline = self.position_ms;
    }

    /// Jump to `position_secs`, clamped to the duration. Keeps the play/pause state.
    pub fn seek(&mut self, position_secs: u64, now: Instant) {
        if self.video.is_none() {
            return;
        }
        let position_ms = self.clamp_ms(position_secs.saturating_mul(1_000));
        self.position_ms = position_ms;
        self.position_ms_baseline = position_ms;
        if self.status == PlaybackStatus::Playing {
            self.running_anchor = Some(now);
        }
    }

    pub fn current_position_ms(&self, now: Instant) -> u64 {
        if let (PlaybackStatus::Playing, Some(anchor)) = (self.status, self.running_anchor) {
            let elapsed = now.saturating_duration_since(anchor).as_millis() as u64;
            self.clamp_ms(self.position_ms_baseline.saturating_add(elapsed))
        } else {
            self.position_ms
        }
    }

    pub fn sync_position(&mut self, now: Instant) {
        self.position_ms = self.current_position_ms(now);
    }

    pub fn reached_end(&self, now: Instant) -> bool {
        match self.duration_secs {
            Some(duration) => self.current_position_ms(now) >= duration.saturating_mul(1_000),
            None => false,
        }
    }

    pub fn finish(&mut self, now: Instant) {
        self.sync_position(now);
        self.status = PlaybackStatus::Ended;
        self.running_anchor = None;
        self.position_ms_baseline = self.position_ms;
    }

    pub fn tick(&self, now: Instant) -> Option<PlaybackTick> {
        let video = self.video.clone()?;
        Some(PlaybackTick {
            video,
            position_secs: self.current_position_ms(now) / 1_000,
            paused: self.status != PlaybackStatus::Playing,
        })
    }

    fn clamp_ms(&self, position_ms: u64) -> u64 {
        match self.duration_secs {
            Some(duration) => position_ms.min(duration.saturating_mul(1_000)),
            None => position_ms,
        }
    }
}
