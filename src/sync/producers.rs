use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    models::{PassiveReading, SessionAppend, VisualReading},
    predictors::{encode_jpeg, FrameSource, PassivePredictor, VisualPredictor, VisualRequest},
    settings::LateResultPolicy,
    store::SessionStore,
};

use super::{signed_unit, CaptureContext, SingleFlight};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Issues one visual prediction per capture boundary.
#[derive(Clone)]
pub struct VisualProducer {
    predictor: Arc<dyn VisualPredictor>,
    frames: Arc<dyn FrameSource>,
    store: SessionStore,
    flight: SingleFlight,
    timeout: Duration,
    late_policy: LateResultPolicy,
}

impl VisualProducer {
    pub fn new(
        predictor: Arc<dyn VisualPredictor>,
        frames: Arc<dyn FrameSource>,
        store: SessionStore,
        timeout: Duration,
        late_policy: LateResultPolicy,
    ) -> Self {
        Self {
            predictor,
            frames,
            store,
            flight: SingleFlight::default(),
            timeout,
            late_policy,
        }
    }

    /// Spawns the capture unless a previous one is still pending, in which case this
    /// boundary is skipped.
    pub fn trigger(&self, ctx: CaptureContext) -> Option<JoinHandle<()>> {
        let Some(guard) = self.flight.try_begin() else {
            log_info!(
                "visual request still in flight; skipping boundary {}s of {}",
                ctx.boundary_sec,
                ctx.video_id
            );
            return None;
        };

        let producer = self.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            producer.capture(&ctx).await;
        }))
    }

    /// Runs one request and appends the reading. Failures are logged and swallowed.
    pub async fn capture(&self, ctx: &CaptureContext) -> Option<VisualReading> {
        let reading = match tokio::time::timeout(self.timeout, self.request(ctx)).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(err)) => {
                log_warn!(
                    "visual reading dropped for {} @ {}s: {err:#}",
                    ctx.video_id,
                    ctx.boundary_sec
                );
                return None;
            }
            Err(_) => {
                log_warn!(
                    "visual request timeout (> {}ms) for {} @ {}s",
                    self.timeout.as_millis(),
                    ctx.video_id,
                    ctx.boundary_sec
                );
                return None;
            }
        };

        if !ctx.accepts_result(self.late_policy) {
            log_info!(
                "discarding late visual reading for {} @ {}s",
                ctx.video_id,
                ctx.boundary_sec
            );
            return None;
        }

        if !self
            .store
            .append(&ctx.session_id, SessionAppend::Visual(reading.clone()))
            .await
        {
            return None;
        }
        log_debug!(
            "visual reading stored for {} @ {}s ({:?})",
            ctx.video_id,
            ctx.boundary_sec,
            reading.emotion
        );
        Some(reading)
    }

    async fn request(&self, ctx: &CaptureContext) -> Result<VisualReading> {
        let frame = self.frames.capture().await.context("frame capture failed")?;
        let image = tokio::task::spawn_blocking(move || encode_jpeg(&frame))
            .await
            .context("frame encoder join failed")??;

        let request = VisualRequest {
            image,
            participant_id: Some(ctx.participant_id.clone()),
            video_id: Some(ctx.video_id.clone()),
            time_sec: Some(ctx.boundary_sec),
        };
        let response = self.predictor.predict(&request).await?;
        let face = response.primary_face()?;

        Ok(VisualReading {
            id: Uuid::new_v4().to_string(),
            at: Utc::now(),
            video_id: ctx.video_id.clone(),
            time_sec: ctx.boundary_sec,
            valence: signed_unit(face.valence),
            arousal: signed_unit(face.arousal),
            confidence: face.confidence.filter(|c| c.is_finite()),
            emotion: Some(face.emotion.clone()),
            faces_detected: u32::try_from(response.faces.len()).unwrap_or(u32::MAX),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.flight.is_busy()
    }
}

/// Polls the biosignal predictor once per capture boundary.
#[derive(Clone)]
pub struct PassiveProducer {
    predictor: Arc<dyn PassivePredictor>,
    store: SessionStore,
    flight: SingleFlight,
    timeout: Duration,
    late_policy: LateResultPolicy,
}

impl PassiveProducer {
    pub fn new(
        predictor: Arc<dyn PassivePredictor>,
        store: SessionStore,
        timeout: Duration,
        late_policy: LateResultPolicy,
    ) -> Self {
        Self {
            predictor,
            store,
            flight: SingleFlight::default(),
            timeout,
            late_policy,
        }
    }

    pub fn trigger(&self, ctx: CaptureContext) -> Option<JoinHandle<()>> {
        let Some(guard) = self.flight.try_begin() else {
            log_info!(
                "passive request still in flight; skipping boundary {}s of {}",
                ctx.boundary_sec,
                ctx.video_id
            );
            return None;
        };

        let producer = self.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            producer.capture(&ctx).await;
        }))
    }

    pub async fn capture(&self, ctx: &CaptureContext) -> Option<PassiveReading> {
        let response = match tokio::time::timeout(self.timeout, self.predictor.poll()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                log_warn!(
                    "passive reading dropped for {} @ {}s: {err:#}",
                    ctx.video_id,
                    ctx.boundary_sec
                );
                return None;
            }
            Err(_) => {
                log_warn!(
                    "passive request timeout (> {}ms) for {} @ {}s",
                    self.timeout.as_millis(),
                    ctx.video_id,
                    ctx.boundary_sec
                );
                return None;
            }
        };

        let reading = match passive_reading(ctx, response) {
            Ok(reading) => reading,
            Err(err) => {
                log_warn!("passive reading dropped: {err:#}");
                return None;
            }
        };

        if !ctx.accepts_result(self.late_policy) {
            log_info!(
                "discarding late passive reading for {} @ {}s",
                ctx.video_id,
                ctx.boundary_sec
            );
            return None;
        }

        if !self
            .store
            .append(&ctx.session_id, SessionAppend::Passive(reading.clone()))
            .await
        {
            return None;
        }
        Some(reading)
    }

    pub fn is_busy(&self) -> bool {
        self.flight.is_busy()
    }
}

fn passive_reading(
    ctx: &CaptureContext,
    response: crate::predictors::PassiveResponse,
) -> Result<PassiveReading> {
    let valence = signed_unit(response.valence);
    let arousal = signed_unit(response.arousal);
    if valence.is_none() && arousal.is_none() {
        return Err(anyhow!("passive response carried neither valence nor arousal"));
    }

    Ok(PassiveReading {
        id: Uuid::new_v4().to_string(),
        at: Utc::now(),
        video_id: ctx.video_id.clone(),
        time_sec: ctx.boundary_sec,
        valence,
        arousal,
        valence_class: response.valence_class,
        arousal_class: response.arousal_class,
        simulated: response.simulated,
        window_secs: response.window_secs,
    })
}
