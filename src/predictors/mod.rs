//! Request/response types and traits for the three external predictors.
//!
//! The inference services are opaque; this crate only shapes requests and validates
//! what comes back. HTTP implementations live in [`http`], camera access in [`frame`].

pub mod frame;
pub mod http;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use frame::{encode_jpeg, FrameSource, StaticFrameSource};
pub use http::{HttpFusionPredictor, HttpPassivePredictor, HttpVisualPredictor};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisualRequest {
    /// Base64-encoded JPEG frame.
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectedFace {
    pub emotion: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub valence: Option<f64>,
    #[serde(default)]
    pub arousal: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisualResponse {
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
    #[serde(default)]
    pub primary_index: Option<usize>,
}

impl VisualResponse {
    /// The designated primary face, or the most confident one when the designation is
    /// missing or out of range. Fails when no face was detected.
    pub fn primary_face(&self) -> Result<&DetectedFace> {
        if let Some(face) = self.primary_index.and_then(|idx| self.faces.get(idx)) {
            return Ok(face);
        }

        let best = self.faces.iter().max_by(|a, b| {
            let a = a.confidence.unwrap_or(0.0);
            let b = b.confidence.unwrap_or(0.0);
            a.total_cmp(&b)
        });

        match best {
            Some(face) => Ok(face),
            None => bail!("visual response contained no faces"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassiveResponse {
    pub valence: Option<f64>,
    pub arousal: Option<f64>,
    #[serde(default)]
    pub valence_class: Option<String>,
    #[serde(default)]
    pub arousal_class: Option<String>,
    #[serde(default)]
    pub simulated: bool,
    #[serde(default)]
    pub window_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VisualInput {
    pub valence: f64,
    pub arousal: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PassiveInput {
    pub valence: f64,
    pub arousal: f64,
}

/// Absent modalities are omitted from the JSON body entirely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FusionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual: Option<VisualInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passive: Option<PassiveInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FusionResponse {
    pub valence: f64,
    pub arousal: f64,
    pub discrete_emotion: String,
    pub fusion_confidence: f64,
    pub strategy: String,
}

#[async_trait]
pub trait VisualPredictor: Send + Sync {
    async fn predict(&self, request: &VisualRequest) -> Result<VisualResponse>;
}

#[async_trait]
pub trait PassivePredictor: Send + Sync {
    async fn poll(&self) -> Result<PassiveResponse>;
}

#[async_trait]
pub trait FusionPredictor: Send + Sync {
    async fn fuse(&self, request: &FusionRequest) -> Result<FusionResponse>;
}
