use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const SETTINGS_PATH_ENV: &str = "AFFECT_SYNC_SETTINGS";
pub const DEFAULT_SETTINGS_PATH: &str = "affect-sync.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PredictorSettings {
    pub visual_url: String,
    pub passive_url: String,
    pub fusion_url: String,
    pub timeout_ms: u64,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            visual_url: "http://127.0.0.1:8001/predict".into(),
            passive_url: "http://127.0.0.1:8002/predict".into(),
            fusion_url: "http://127.0.0.1:8003/fuse".into(),
            timeout_ms: 5_000,
        }
    }
}

impl PredictorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleSettings {
    pub capture_interval_secs: u64,
    pub rating_interval_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            capture_interval_secs: 12,
            rating_interval_secs: 60,
        }
    }
}

/// Bounded wait applied by the fusion joiner to every capture boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FusionWaitSettings {
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    /// Readings up to this many seconds past the boundary still count as near.
    pub grace_secs: u64,
}

impl Default for FusionWaitSettings {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            poll_interval_ms: 150,
            grace_secs: 2,
        }
    }
}

/// Upper bound on any fusion wait, however the attempts and interval are configured.
const FUSION_WAIT_CAP: Duration = Duration::from_secs(60 * 60);

impl FusionWaitSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).min(FUSION_WAIT_CAP)
    }

    pub fn max_wait(&self) -> Duration {
        self.poll_interval()
            .checked_mul(self.max_attempts)
            .map_or(FUSION_WAIT_CAP, |wait| wait.min(FUSION_WAIT_CAP))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub db_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("affect-sync.sqlite3"),
        }
    }
}

/// What to do with a predictor response that lands after its video was switched away.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LateResultPolicy {
    Discard,
    /// Append under the originating video and boundary, never under the new one.
    KeepOriginVideo,
}

impl Default for LateResultPolicy {
    fn default() -> Self {
        LateResultPolicy::Discard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub duration_secs: u64,
}

impl Default for PlaylistEntry {
    fn default() -> Self {
        Self {
            id: "video-1".into(),
            title: "Video 1".into(),
            duration_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub participant_id: String,
    pub predictors: PredictorSettings,
    pub schedule: ScheduleSettings,
    pub fusion_wait: FusionWaitSettings,
    pub storage: StorageSettings,
    pub late_results: LateResultPolicy,
    pub export_dir: PathBuf,
    pub playlist: Vec<PlaylistEntry>,
    pub frame_path: Option<PathBuf>,
    pub debug: bool,
}

impl Settings {
    fn with_defaults(mut self) -> Self {
        if self.participant_id.is_empty() {
            self.participant_id = "anonymous".into();
        }
        if self.export_dir.as_os_str().is_empty() {
            self.export_dir = PathBuf::from("exports");
        }
        if self.playlist.is_empty() {
            self.playlist.push(PlaylistEntry::default());
        }
        self
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("AFFECT_SYNC_VISUAL_URL") {
            self.predictors.visual_url = url;
        }
        if let Ok(url) = std::env::var("AFFECT_SYNC_PASSIVE_URL") {
            self.predictors.passive_url = url;
        }
        if let Ok(url) = std::env::var("AFFECT_SYNC_FUSION_URL") {
            self.predictors.fusion_url = url;
        }
        if let Ok(path) = std::env::var("AFFECT_SYNC_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var("AFFECT_SYNC_DEBUG") {
            self.debug = value == "1" || value.eq_ignore_ascii_case("true");
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: Settings,
}

impl SettingsStore {
    /// Path from `AFFECT_SYNC_SETTINGS`, else `affect-sync.json` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var(SETTINGS_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH))
    }

    pub fn new(path: PathBuf) -> Result<Self> {
        let mut data = Self::read_file(&path)?;
        data.apply_env_overrides();

        Ok(Self { path, data })
    }

    fn read_file(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Ok(Settings::default().with_defaults());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let parsed: Settings = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(parsed.with_defaults())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the file-level defaults when no settings file exists yet.
    ///
    /// Environment overrides stay out of the written file; they only apply to the running
    /// snapshot.
    pub fn write_defaults_if_missing(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        let defaults = Self::read_file(&self.path)?;
        self.persist(&defaults)?;
        Ok(true)
    }

    pub fn snapshot(&self) -> Settings {
        self.data.clone()
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = SettingsStore::read_file(&dir.path().join("absent.json")).unwrap();

        assert_eq!(settings.schedule.capture_interval_secs, 12);
        assert_eq!(settings.schedule.rating_interval_secs, 60);
        assert_eq!(settings.fusion_wait.max_wait(), Duration::from_millis(3_000));
        assert_eq!(settings.late_results, LateResultPolicy::Discard);
        assert_eq!(settings.participant_id, "anonymous");
        assert_eq!(settings.playlist.len(), 1);
    }

    #[test]
    fn partial_file_fills_remaining_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "participant_id": "P-07",
                "fusion_wait": { "max_attempts": 10 },
                "late_results": "keep_origin_video",
                "playlist": [{ "id": "clip-a", "title": "Clip A", "duration_secs": 90 }]
            }"#,
        )
        .unwrap();

        let settings = SettingsStore::read_file(&path).unwrap();
        assert_eq!(settings.participant_id, "P-07");
        assert_eq!(settings.fusion_wait.max_attempts, 10);
        assert_eq!(settings.fusion_wait.poll_interval_ms, 150);
        assert_eq!(settings.late_results, LateResultPolicy::KeepOriginVideo);
        assert_eq!(settings.playlist[0].id, "clip-a");
        assert_eq!(settings.predictors.timeout_ms, 5_000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(SettingsStore::read_file(&path).is_err());
    }

    #[test]
    fn huge_wait_settings_saturate() {
        let wait = FusionWaitSettings {
            max_attempts: u32::MAX,
            poll_interval_ms: u64::MAX,
            grace_secs: 2,
        };
        assert_eq!(wait.poll_interval(), FUSION_WAIT_CAP);
        assert_eq!(wait.max_wait(), FUSION_WAIT_CAP);

        let wait = FusionWaitSettings {
            max_attempts: u32::MAX,
            ..FusionWaitSettings::default()
        };
        assert_eq!(wait.max_wait(), FUSION_WAIT_CAP);
    }

    #[test]
    fn first_run_file_leaves_out_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let mut running = Settings::default().with_defaults();
        running.predictors.fusion_url = "http://override.test/fuse".into();
        running.storage.db_path = PathBuf::from("/tmp/override.sqlite3");
        let store = SettingsStore {
            path: path.clone(),
            data: running,
        };

        assert!(store.write_defaults_if_missing().unwrap());
        assert!(!store.write_defaults_if_missing().unwrap());

        let written = SettingsStore::read_file(&path).unwrap();
        let defaults = Settings::default().with_defaults();
        assert_eq!(written.predictors.fusion_url, defaults.predictors.fusion_url);
        assert_eq!(written.storage.db_path, defaults.storage.db_path);
        assert_eq!(
            store.snapshot().predictors.fusion_url,
            "http://override.test/fuse"
        );
    }
}
