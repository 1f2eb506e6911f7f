use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::reading::{FusedReading, PassiveReading, Rating, VisualReading};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Running,
    Completed,
    Cancelled,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "Running",
            SessionStatus::Completed => "Completed",
            SessionStatus::Cancelled => "Cancelled",
            SessionStatus::Interrupted => "Interrupted",
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Running
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VideoRef {
    pub id: String,
    pub title: String,
}

/// Persisted per-participant session record.
///
/// Field names match the stored JSON layout. All collections are append-only while the
/// session is alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionLog {
    pub id: String,
    pub participant_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub videos: Vec<VideoRef>,
    #[serde(default)]
    pub ratings: Vec<Rating>,
    #[serde(default)]
    pub visual_predictions: Vec<VisualReading>,
    #[serde(default)]
    pub passive_predictions: Vec<PassiveReading>,
    #[serde(default)]
    pub fused_predictions: Vec<FusedReading>,
}

impl SessionLog {
    pub fn new(id: String, participant_id: String, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            participant_id,
            start_time,
            status: SessionStatus::Running,
            videos: Vec::new(),
            ratings: Vec::new(),
            visual_predictions: Vec::new(),
            passive_predictions: Vec::new(),
            fused_predictions: Vec::new(),
        }
    }

    pub fn video_title(&self, video_id: &str) -> Option<&str> {
        self.videos
            .iter()
            .find(|video| video.id == video_id)
            .map(|video| video.title.as_str())
    }

    pub fn apply(&mut self, append: SessionAppend) {
        match append {
            SessionAppend::Visual(reading) => self.visual_predictions.push(reading),
            SessionAppend::Passive(reading) => self.passive_predictions.push(reading),
            SessionAppend::Fused(reading) => self.fused_predictions.push(reading),
            SessionAppend::Rating(rating) => self.ratings.push(rating),
            SessionAppend::Video(video) => {
                if !self.videos.iter().any(|seen| seen.id == video.id) {
                    self.videos.push(video);
                }
            }
        }
    }
}

/// A single append against exactly one collection of a [`SessionLog`].
#[derive(Debug, Clone)]
pub enum SessionAppend {
    Visual(VisualReading),
    Passive(PassiveReading),
    Fused(FusedReading),
    Rating(Rating),
    Video(VideoRef),
}

impl SessionAppend {
    pub fn collection(&self) -> &'static str {
        match self {
            SessionAppend::Visual(_) => "visualPredictions",
            SessionAppend::Passive(_) => "passivePredictions",
            SessionAppend::Fused(_) => "fusedPredictions",
            SessionAppend::Rating(_) => "ratings",
            SessionAppend::Video(_) => "videos",
        }
    }
}
