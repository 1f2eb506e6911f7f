//! Aggregate statistics over a finished session, written next to the CSV export.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::models::{SessionLog, SessionStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionCounts {
    pub visual: usize,
    pub passive: usize,
    pub fused: usize,
    pub ratings: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualSummary {
    pub emotions: BTreeMap<String, usize>,
    pub average_confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassiveSummary {
    pub valence_classes: BTreeMap<String, usize>,
    pub arousal_classes: BTreeMap<String, usize>,
    pub simulated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedSummary {
    pub emotions: BTreeMap<String, usize>,
    pub strategies: BTreeMap<String, usize>,
    pub average_confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub participant_id: String,
    pub status: SessionStatus,
    pub videos_seen: usize,
    pub counts: PredictionCounts,
    pub visual: VisualSummary,
    pub passive: PassiveSummary,
    pub fused: FusedSummary,
    pub ratings_per_video: BTreeMap<String, usize>,
}

fn tally<'a>(labels: impl Iterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for label in labels {
        *counts.entry(label.to_string()).or_insert(0) += 1;
    }
    counts
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

pub fn summarize(session: &SessionLog) -> SessionSummary {
    let visual = &session.visual_predictions;
    let passive = &session.passive_predictions;
    let fused = &session.fused_predictions;

    SessionSummary {
        session_id: session.id.clone(),
        participant_id: session.participant_id.clone(),
        status: session.status,
        videos_seen: session.videos.len(),
        counts: PredictionCounts {
            visual: visual.len(),
            passive: passive.len(),
            fused: fused.len(),
            ratings: session.ratings.len(),
        },
        visual: VisualSummary {
            emotions: tally(visual.iter().filter_map(|r| r.emotion.as_deref())),
            average_confidence: average(visual.iter().filter_map(|r| r.confidence)),
        },
        passive: PassiveSummary {
            valence_classes: tally(passive.iter().filter_map(|r| r.valence_class.as_deref())),
            arousal_classes: tally(passive.iter().filter_map(|r| r.arousal_class.as_deref())),
            simulated: passive.iter().filter(|r| r.simulated).count(),
        },
        fused: FusedSummary {
            emotions: tally(fused.iter().map(|r| r.discrete_emotion.as_str())),
            strategies: tally(fused.iter().map(|r| r.strategy.as_str())),
            average_confidence: average(fused.iter().map(|r| r.fusion_confidence)),
        },
        ratings_per_video: tally(session.ratings.iter().map(|r| r.video_id.as_str())),
    }
}

/// Writes `session-{id}.summary.json` into `dir`.
pub fn write_summary(summary: &SessionSummary, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create export dir {}", dir.display()))?;
    let path = dir.join(format!("session-{}.summary.json", summary.session_id));
    let serialized = serde_json::to_string_pretty(summary)?;
    fs::write(&path, serialized)
        .with_context(|| format!("failed to write summary {}", path.display()))?;
    Ok(path)
}
