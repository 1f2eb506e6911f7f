//! Flat CSV export of a session record.
//!
//! Rows are the full outer join of every collection on (video, time). Ordering comes
//! from `BTreeMap`, so the same record always renders to the same bytes.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::{
    BoundaryKey, FusedReading, PassiveReading, Rating, SessionLog, Timed, VisualReading,
};

pub const NULL_MARKER: &str = "null";

pub const HEADER: [&str; 13] = [
    "participant",
    "active_valence",
    "active_arousal",
    "passive_valence",
    "passive_arousal",
    "fused_valence",
    "fused_arousal",
    "user_rating_valence",
    "user_rating_arousal",
    "user_free_emotion",
    "video_title",
    "video_time_sec",
    "system_datetime",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub participant: String,
    pub active_valence: Option<f64>,
    pub active_arousal: Option<f64>,
    pub passive_valence: Option<f64>,
    pub passive_arousal: Option<f64>,
    pub fused_valence: Option<f64>,
    pub fused_arousal: Option<f64>,
    pub user_rating_valence: Option<u8>,
    pub user_rating_arousal: Option<u8>,
    pub user_free_emotion: Option<String>,
    pub video_title: String,
    pub video_time_sec: u64,
    pub system_datetime: DateTime<Utc>,
}

impl ExportRow {
    fn cells(&self) -> [String; 13] {
        [
            self.participant.clone(),
            cell(self.active_valence),
            cell(self.active_arousal),
            cell(self.passive_valence),
            cell(self.passive_arousal),
            cell(self.fused_valence),
            cell(self.fused_arousal),
            cell(self.user_rating_valence),
            cell(self.user_rating_arousal),
            cell(self.user_free_emotion.as_deref()),
            self.video_title.clone(),
            self.video_time_sec.to_string(),
            self.system_datetime
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ]
    }
}

fn cell<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| NULL_MARKER.to_string(), |v| v.to_string())
}

/// Later appends overwrite earlier ones at the same key.
fn latest_by_key<T: Timed>(items: &[T]) -> BTreeMap<BoundaryKey, &T> {
    items.iter().map(|item| (item.key(), item)).collect()
}

pub fn build_rows(session: &SessionLog) -> Vec<ExportRow> {
    let visual: BTreeMap<BoundaryKey, &VisualReading> = latest_by_key(&session.visual_predictions);
    let passive: BTreeMap<BoundaryKey, &PassiveReading> =
        latest_by_key(&session.passive_predictions);
    let fused: BTreeMap<BoundaryKey, &FusedReading> = latest_by_key(&session.fused_predictions);
    let ratings: BTreeMap<BoundaryKey, &Rating> = latest_by_key(&session.ratings);

    let keys: BTreeSet<&BoundaryKey> = visual
        .keys()
        .chain(passive.keys())
        .chain(fused.keys())
        .chain(ratings.keys())
        .collect();

    keys.into_iter()
        .map(|key| {
            let v = visual.get(key).copied();
            let p = passive.get(key).copied();
            let f = fused.get(key).copied();
            let r = ratings.get(key).copied();

            let system_datetime = f
                .map(Timed::timestamp)
                .or_else(|| v.map(Timed::timestamp))
                .or_else(|| p.map(Timed::timestamp))
                .or_else(|| r.map(Timed::timestamp))
                .unwrap_or(session.start_time);

            ExportRow {
                participant: session.participant_id.clone(),
                active_valence: v.and_then(|v| v.valence),
                active_arousal: v.and_then(|v| v.arousal),
                passive_valence: p.and_then(|p| p.valence),
                passive_arousal: p.and_then(|p| p.arousal),
                fused_valence: f.map(|f| f.valence),
                fused_arousal: f.map(|f| f.arousal),
                user_rating_valence: r.map(|r| r.valence),
                user_rating_arousal: r.map(|r| r.arousal),
                user_free_emotion: r.and_then(|r| r.free_emotion.clone()),
                video_title: session
                    .video_title(&key.video_id)
                    .unwrap_or(&key.video_id)
                    .to_string(),
                video_time_sec: key.time_sec,
                system_datetime,
            }
        })
        .collect()
}

/// Quote only what would break the row structure.
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn render_csv(session: &SessionLog) -> String {
    let mut out = HEADER.join(",");
    out.push('\n');
    for row in build_rows(session) {
        let line: Vec<String> = row.cells().iter().map(|field| escape(field)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

pub fn export_file_name(session: &SessionLog) -> String {
    format!("session-{}.csv", session.id)
}

/// Writes the CSV into `dir`, creating it if needed. Returns the file path.
pub fn write_csv(session: &SessionLog, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create export dir {}", dir.display()))?;
    let path = dir.join(export_file_name(session));
    fs::write(&path, render_csv(session))
        .with_context(|| format!("failed to write export {}", path.display()))?;
    Ok(path)
}
