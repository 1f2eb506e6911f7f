//! Per-session orchestration: ticks in, boundary work and rating prompts out.

use anyhow::{ensure, Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    models::{Rating, SessionAppend, SessionLog, SessionStatus, VideoRef, RATING_MAX, RATING_MIN},
    playback::PlaybackTick,
    settings::ScheduleSettings,
    store::SessionStore,
};

use super::{
    BoundaryEvent, BoundaryKind, BoundaryScheduler, CaptureContext, FusionJoiner, JoinOutcome,
    PassiveProducer, VisualProducer,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Asks the participant for a self-report at a rating boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingPrompt {
    pub session_id: String,
    pub video_id: String,
    pub video_title: String,
    pub boundary_sec: u64,
}

/// The three boundary workers a runner dispatches to.
pub struct Pipeline {
    pub visual: VisualProducer,
    pub passive: PassiveProducer,
    pub joiner: FusionJoiner,
}

struct ActiveVideo {
    video: VideoRef,
    token: CancellationToken,
}

pub struct SessionRunner {
    session_id: String,
    participant_id: String,
    store: SessionStore,
    scheduler: BoundaryScheduler,
    pipeline: Pipeline,
    root: CancellationToken,
    active: Option<ActiveVideo>,
    prompts: mpsc::UnboundedSender<RatingPrompt>,
    producers_pending: Vec<JoinHandle<()>>,
    joins_pending: Vec<JoinHandle<JoinOutcome>>,
}

impl SessionRunner {
    pub fn new(
        store: SessionStore,
        session: &SessionLog,
        pipeline: Pipeline,
        schedule: ScheduleSettings,
        prompts: mpsc::UnboundedSender<RatingPrompt>,
    ) -> Self {
        Self {
            session_id: session.id.clone(),
            participant_id: session.participant_id.clone(),
            store,
            scheduler: BoundaryScheduler::new(schedule),
            pipeline,
            root: CancellationToken::new(),
            active: None,
            prompts,
            producers_pending: Vec::new(),
            joins_pending: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn active_video(&self) -> Option<&VideoRef> {
        self.active.as_ref().map(|active| &active.video)
    }

    /// Feeds one clock report through the scheduler and dispatches what fires.
    pub async fn handle_tick(&mut self, tick: &PlaybackTick) -> Vec<BoundaryEvent> {
        if self.root.is_cancelled() {
            return Vec::new();
        }
        self.producers_pending.retain(|handle| !handle.is_finished());
        self.joins_pending.retain(|handle| !handle.is_finished());

        let video_token = self.ensure_video(&tick.video).await;

        let events = self.scheduler.observe(
            &self.session_id,
            &tick.video.id,
            tick.position_secs,
            tick.paused,
        );

        for event in &events {
            match event.kind {
                BoundaryKind::Capture => self.dispatch_capture(event, &video_token),
                BoundaryKind::Rating => self.prompt_rating(event, &tick.video),
            }
        }
        events
    }

    pub async fn submit_rating(
        &self,
        prompt: &RatingPrompt,
        valence: u8,
        arousal: u8,
        free_emotion: Option<String>,
    ) -> Result<Rating> {
        submit_rating(&self.store, prompt, valence, arousal, free_emotion).await
    }

    /// Waits for outstanding boundary work, then records the final status.
    pub async fn finish(&mut self, status: SessionStatus) -> Result<Vec<JoinOutcome>> {
        if status == SessionStatus::Cancelled {
            self.root.cancel();
        }
        let outcomes = self.drain().await;
        ensure!(
            self.store.set_status(&self.session_id, status).await,
            "session {} no longer exists",
            self.session_id
        );
        log_info!(
            "Session {} finished as {}",
            self.session_id,
            status.as_str()
        );
        Ok(outcomes)
    }

    /// Cancels outstanding work and destroys the session record.
    pub async fn reset(&mut self) -> bool {
        self.root.cancel();
        self.active = None;
        self.scheduler.reset_session(&self.session_id);
        self.store.reset(&self.session_id).await
    }

    async fn drain(&mut self) -> Vec<JoinOutcome> {
        for handle in self.producers_pending.drain(..) {
            if let Err(err) = handle.await {
                log_warn!("producer task failed to join: {err}");
            }
        }

        let mut outcomes = Vec::new();
        for handle in self.joins_pending.drain(..) {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => log_warn!("fusion task failed to join: {err}"),
            }
        }
        outcomes
    }

    /// Makes `video` the active one, cancelling the previous video's work on a change.
    async fn ensure_video(&mut self, video: &VideoRef) -> CancellationToken {
        if let Some(active) = &self.active {
            if active.video.id == video.id {
                return active.token.clone();
            }
            log_info!(
                "Video switched from {} to {}; cancelling pending work",
                active.video.id,
                video.id
            );
            active.token.cancel();
        }

        self.scheduler.reset_video(&self.session_id, &video.id);
        let token = self.root.child_token();
        self.active = Some(ActiveVideo {
            video: video.clone(),
            token: token.clone(),
        });
        self.store
            .append(&self.session_id, SessionAppend::Video(video.clone()))
            .await;
        token
    }

    fn dispatch_capture(&mut self, event: &BoundaryEvent, video_token: &CancellationToken) {
        let ctx = CaptureContext {
            session_id: self.session_id.clone(),
            participant_id: self.participant_id.clone(),
            video_id: event.video_id.clone(),
            boundary_sec: event.boundary_sec,
            video_token: video_token.clone(),
        };
        log_debug!(
            "capture boundary {}s on {}",
            event.boundary_sec,
            event.video_id
        );

        self.producers_pending
            .extend(self.pipeline.visual.trigger(ctx.clone()));
        self.producers_pending
            .extend(self.pipeline.passive.trigger(ctx.clone()));
        self.joins_pending.push(self.pipeline.joiner.trigger(ctx));
    }

    fn prompt_rating(&self, event: &BoundaryEvent, video: &VideoRef) {
        let prompt = RatingPrompt {
            session_id: self.session_id.clone(),
            video_id: event.video_id.clone(),
            video_title: video.title.clone(),
            boundary_sec: event.boundary_sec,
        };
        if self.prompts.send(prompt).is_err() {
            log_debug!("no rating listener; prompt at {}s dropped", event.boundary_sec);
        }
    }
}

/// Validates and appends a self-report for `prompt`.
pub async fn submit_rating(
    store: &SessionStore,
    prompt: &RatingPrompt,
    valence: u8,
    arousal: u8,
    free_emotion: Option<String>,
) -> Result<Rating> {
    let scale = RATING_MIN..=RATING_MAX;
    ensure!(
        scale.contains(&valence) && scale.contains(&arousal),
        "rating must be within {RATING_MIN}..={RATING_MAX}, got valence={valence} arousal={arousal}"
    );

    let rating = Rating {
        id: Uuid::new_v4().to_string(),
        video_id: prompt.video_id.clone(),
        time_sec: prompt.boundary_sec,
        valence,
        arousal,
        free_emotion: free_emotion
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty()),
        recorded_at: Utc::now(),
    };

    store
        .require(&prompt.session_id)
        .await
        .context("cannot record rating")?;
    ensure!(
        store
            .append(&prompt.session_id, SessionAppend::Rating(rating.clone()))
            .await,
        "session {} was reset before the rating was stored",
        prompt.session_id
    );
    Ok(rating)
}

/// Consumes ticks until the channel closes or `cancel` fires. Returns ticks handled.
pub async fn run_session_loop(
    runner: &mut SessionRunner,
    ticks: &mut mpsc::Receiver<PlaybackTick>,
    cancel: &CancellationToken,
) -> usize {
    let mut handled = 0;
    loop {
        tokio::select! {
            tick = ticks.recv() => {
                let Some(tick) = tick else {
                    log_debug!("tick source closed");
                    break;
                };
                runner.handle_tick(&tick).await;
                handled += 1;
            }
            _ = cancel.cancelled() => {
                log_info!("session loop shutting down");
                break;
            }
        }
    }
    handled
}
