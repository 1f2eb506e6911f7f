pub mod db;
pub mod export;
pub mod models;
pub mod playback;
pub mod predictors;
pub mod settings;
pub mod store;
pub mod summary;
pub mod sync;
pub mod utils;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use db::Database;
use models::SessionStatus;
use playback::{run_playlist, PlaybackController};
use predictors::{
    FrameSource, HttpFusionPredictor, HttpPassivePredictor, HttpVisualPredictor,
    StaticFrameSource,
};
use settings::{Settings, SettingsStore};
use store::SessionStore;
use sync::{
    run_session_loop, FusionJoiner, PassiveProducer, Pipeline, RatingPrompt, SessionRunner,
    VisualProducer,
};

const TICK_BUFFER: usize = 64;

/// Runs one participant session over the configured playlist, then exports it.
pub async fn run() -> Result<()> {
    let settings_store = SettingsStore::new(SettingsStore::default_path())?;
    let settings = settings_store.snapshot();
    utils::logging::init(settings.debug);

    info!("affect-sync starting up...");
    if settings_store.write_defaults_if_missing()? {
        info!(
            "Wrote default settings to {}",
            settings_store.path().display()
        );
    }

    let store = open_store(&settings.storage.db_path);
    if let Some(session_id) = store.recover_interrupted().await {
        info!("Previous session {session_id} was interrupted");
    }

    let session = store.create_session(&settings.participant_id).await;
    let pipeline = build_pipeline(&settings, &store)?;

    let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();
    let mut runner = SessionRunner::new(
        store.clone(),
        &session,
        pipeline,
        settings.schedule,
        prompt_tx,
    );
    let prompt_listener = tokio::spawn(announce_prompts(prompt_rx));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; stopping session");
                cancel.cancel();
            }
        });
    }

    let (tick_tx, mut tick_rx) = mpsc::channel(TICK_BUFFER);
    let player = {
        let cancel = cancel.clone();
        let playlist = settings.playlist.clone();
        tokio::spawn(async move {
            let controller = PlaybackController::new(tick_tx);
            run_playlist(&controller, &playlist, &cancel).await
        })
    };

    let handled = run_session_loop(&mut runner, &mut tick_rx, &cancel).await;
    let finished = player.await.context("playback task failed to join")??;
    info!(
        "Playback done: {finished}/{} videos, {handled} ticks",
        settings.playlist.len()
    );

    let status = if cancel.is_cancelled() {
        SessionStatus::Cancelled
    } else {
        SessionStatus::Completed
    };
    runner.finish(status).await?;
    drop(runner);
    if let Err(err) = prompt_listener.await {
        warn!("rating prompt listener failed to join: {err}");
    }

    let record = store.require(&session.id).await?;
    let csv_path = export::write_csv(&record, &settings.export_dir)?;
    let summary = summary::summarize(&record);
    let summary_path = summary::write_summary(&summary, &settings.export_dir)?;
    info!(
        "Exported session {} to {} and {}",
        record.id,
        csv_path.display(),
        summary_path.display()
    );

    if store.is_degraded() {
        warn!("Session store ran in memory only; the record was not persisted");
    }
    Ok(())
}

/// SQLite-backed store, or an in-memory one if the database cannot be opened.
fn open_store(db_path: &Path) -> SessionStore {
    match Database::new(db_path.to_path_buf()) {
        Ok(database) => {
            info!("Using session database {}", database.path().display());
            SessionStore::new(Arc::new(database))
        }
        Err(err) => {
            warn!("Session database unavailable ({err:#}); keeping sessions in memory");
            SessionStore::in_memory()
        }
    }
}

fn build_pipeline(settings: &Settings, store: &SessionStore) -> Result<Pipeline> {
    let timeout = settings.predictors.timeout();
    let policy = settings.late_results;

    let frames: Arc<dyn FrameSource> = match &settings.frame_path {
        Some(path) => Arc::new(StaticFrameSource::from_file(path)?),
        None => Arc::new(StaticFrameSource::blank(640, 480)),
    };

    Ok(Pipeline {
        visual: VisualProducer::new(
            Arc::new(HttpVisualPredictor::new(
                settings.predictors.visual_url.clone(),
                timeout,
            )?),
            frames,
            store.clone(),
            timeout,
            policy,
        ),
        passive: PassiveProducer::new(
            Arc::new(HttpPassivePredictor::new(
                settings.predictors.passive_url.clone(),
                timeout,
            )?),
            store.clone(),
            timeout,
            policy,
        ),
        joiner: FusionJoiner::new(
            Arc::new(HttpFusionPredictor::new(
                settings.predictors.fusion_url.clone(),
                timeout,
            )?),
            store.clone(),
            settings.fusion_wait,
            timeout,
            policy,
        ),
    })
}

/// Rating collection happens outside this process; prompts are announced in the log.
async fn announce_prompts(mut prompts: mpsc::UnboundedReceiver<RatingPrompt>) {
    while let Some(prompt) = prompts.recv().await {
        info!(
            "Rating requested for {} ({}) at {}s",
            prompt.video_title, prompt.video_id, prompt.boundary_sec
        );
    }
}
