//! Reading data models.
//!
//! Every reading is keyed by the boundary that scheduled it (`video_id`, `time_sec`),
//! never by the moment its response arrived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timeline position a reading belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryKey {
    pub video_id: String,
    pub time_sec: u64,
}

impl BoundaryKey {
    pub fn new(video_id: impl Into<String>, time_sec: u64) -> Self {
        Self {
            video_id: video_id.into(),
            time_sec,
        }
    }
}

/// Face-derived estimate for one capture boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisualReading {
    pub id: String,
    pub at: DateTime<Utc>,
    pub video_id: String,
    pub time_sec: u64,
    pub valence: Option<f64>,
    pub arousal: Option<f64>,
    pub confidence: Option<f64>,
    pub emotion: Option<String>,
    pub faces_detected: u32,
}

/// Biosignal-derived estimate for one capture boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassiveReading {
    pub id: String,
    pub at: DateTime<Utc>,
    pub video_id: String,
    pub time_sec: u64,
    pub valence: Option<f64>,
    pub arousal: Option<f64>,
    pub valence_class: Option<String>,
    pub arousal_class: Option<String>,
    pub simulated: bool,
    pub window_secs: Option<f64>,
}

/// Output of the fusion predictor for one boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FusedReading {
    pub id: String,
    pub at: DateTime<Utc>,
    pub video_id: String,
    pub time_sec: u64,
    pub valence: f64,
    pub arousal: f64,
    pub discrete_emotion: String,
    pub fusion_confidence: f64,
    pub strategy: String,
    /// Which modality inputs were present when the fusion request was built.
    pub visual_included: bool,
    pub passive_included: bool,
}

/// Self-reported rating, scored 1 to 5 on each axis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub id: String,
    pub video_id: String,
    pub time_sec: u64,
    pub valence: u8,
    pub arousal: u8,
    pub free_emotion: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

pub const RATING_MIN: u8 = 1;
pub const RATING_MAX: u8 = 5;

/// Shared accessors used by selection and export.
pub trait Timed {
    fn video_id(&self) -> &str;
    fn time_sec(&self) -> u64;
    fn timestamp(&self) -> DateTime<Utc>;

    fn key(&self) -> BoundaryKey {
        BoundaryKey::new(self.video_id(), self.time_sec())
    }
}

macro_rules! impl_timed {
    ($ty:ty, $at:ident) => {
        impl Timed for $ty {
            fn video_id(&self) -> &str {
                &self.video_id
            }

            fn time_sec(&self) -> u64 {
                self.time_sec
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.$at
            }
        }
    };
}

impl_timed!(VisualReading, at);
impl_timed!(PassiveReading, at);
impl_timed!(FusedReading, at);
impl_timed!(Rating, recorded_at);
