//! Bounded join of visual and passive readings around a capture boundary.
//!
//! Readings arrive in any order relative to boundary events, so the joiner polls the
//! session record instead of waiting on a particular producer. Visual readings are the
//! preferred time reference: an exact visual match ends the wait immediately, anything
//! else needs half the maximum wait to have passed.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use tokio::{task::JoinHandle, time::Instant};
use uuid::Uuid;

use crate::{
    models::{BoundaryKey, FusedReading, PassiveReading, SessionAppend, Timed, VisualReading},
    predictors::{FusionPredictor, FusionRequest, PassiveInput, VisualInput},
    settings::{FusionWaitSettings, LateResultPolicy},
    store::SessionStore,
};

use super::CaptureContext;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// `time_sec == boundary`
    Exact,
    /// Largest `time_sec` below the boundary.
    Before,
    /// Smallest `time_sec` within the grace window after the boundary.
    Grace,
}

/// Picks the reading for `boundary` out of `readings` for one video.
///
/// Ties on `time_sec` go to the most recently appended entry.
pub fn select_reading<'a, T: Timed>(
    readings: &'a [T],
    video_id: &str,
    boundary: u64,
    grace_secs: u64,
) -> Option<(&'a T, MatchKind)> {
    let for_video = || readings.iter().filter(move |r| r.video_id() == video_id);

    if let Some(exact) = for_video().rev().find(|r| r.time_sec() == boundary) {
        return Some((exact, MatchKind::Exact));
    }

    let mut before: Option<&T> = None;
    for reading in for_video().filter(|r| r.time_sec() < boundary) {
        if before.map_or(true, |best| reading.time_sec() >= best.time_sec()) {
            before = Some(reading);
        }
    }
    if let Some(reading) = before {
        return Some((reading, MatchKind::Before));
    }

    let limit = boundary.saturating_add(grace_secs);
    let mut after: Option<&T> = None;
    for reading in for_video().filter(|r| r.time_sec() > boundary && r.time_sec() <= limit) {
        if after.map_or(true, |best| reading.time_sec() <= best.time_sec()) {
            after = Some(reading);
        }
    }
    after.map(|reading| (reading, MatchKind::Grace))
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    pub visual: Option<(VisualReading, MatchKind)>,
    pub passive: Option<(PassiveReading, MatchKind)>,
}

impl ResolvedInputs {
    pub fn any(&self) -> bool {
        self.visual.is_some() || self.passive.is_some()
    }

    pub fn exact_visual(&self) -> bool {
        matches!(self.visual, Some((_, MatchKind::Exact)))
    }

    /// Resolved modalities are always sent; absent numeric fields inside them become 0.
    /// Unresolved modalities are left out, never zero-filled.
    pub fn to_request(&self) -> FusionRequest {
        FusionRequest {
            visual: self.visual.as_ref().map(|(reading, _)| VisualInput {
                valence: reading.valence.unwrap_or(0.0),
                arousal: reading.arousal.unwrap_or(0.0),
                confidence: reading.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            }),
            passive: self.passive.as_ref().map(|(reading, _)| PassiveInput {
                valence: reading.valence.unwrap_or(0.0),
                arousal: reading.arousal.unwrap_or(0.0),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Fused(FusedReading),
    /// Another join for the same (video, boundary) is still running.
    AlreadyInFlight,
    /// Session missing or reset before the join started.
    NoSession,
    /// Neither modality showed up within the wait window.
    Abandoned,
    /// Video switch or session reset during the wait.
    Cancelled,
    FusionFailed,
    /// Fusion answered after the video was switched away.
    Discarded,
}

struct KeyClaim {
    keys: Arc<Mutex<HashSet<BoundaryKey>>>,
    key: BoundaryKey,
}

impl Drop for KeyClaim {
    fn drop(&mut self) {
        let mut keys = match self.keys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        keys.remove(&self.key);
    }
}

#[derive(Clone)]
pub struct FusionJoiner {
    predictor: Arc<dyn FusionPredictor>,
    store: SessionStore,
    wait: FusionWaitSettings,
    timeout: Duration,
    late_policy: LateResultPolicy,
    in_flight: Arc<Mutex<HashSet<BoundaryKey>>>,
}

impl FusionJoiner {
    pub fn new(
        predictor: Arc<dyn FusionPredictor>,
        store: SessionStore,
        wait: FusionWaitSettings,
        timeout: Duration,
        late_policy: LateResultPolicy,
    ) -> Self {
        Self {
            predictor,
            store,
            wait,
            timeout,
            late_policy,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn trigger(&self, ctx: CaptureContext) -> JoinHandle<JoinOutcome> {
        let joiner = self.clone();
        tokio::spawn(async move { joiner.join(&ctx).await })
    }

    pub async fn join(&self, ctx: &CaptureContext) -> JoinOutcome {
        let key = BoundaryKey::new(ctx.video_id.clone(), ctx.boundary_sec);
        let Some(_claim) = self.claim(key) else {
            log_debug!(
                "fusion already in flight for {} @ {}s",
                ctx.video_id,
                ctx.boundary_sec
            );
            return JoinOutcome::AlreadyInFlight;
        };

        if self.store.get(&ctx.session_id).await.is_none() {
            return JoinOutcome::NoSession;
        }

        let inputs = match self.await_inputs(ctx).await {
            Some(Some(inputs)) => inputs,
            Some(None) => {
                log_info!(
                    "no readings for {} @ {}s within {}ms; boundary abandoned",
                    ctx.video_id,
                    ctx.boundary_sec,
                    self.wait.max_wait().as_millis()
                );
                return JoinOutcome::Abandoned;
            }
            None => {
                log_debug!(
                    "fusion wait cancelled for {} @ {}s",
                    ctx.video_id,
                    ctx.boundary_sec
                );
                return JoinOutcome::Cancelled;
            }
        };

        let request = inputs.to_request();
        let response =
            match tokio::time::timeout(self.timeout, self.predictor.fuse(&request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    log_warn!(
                        "fusion dropped for {} @ {}s: {err:#}",
                        ctx.video_id,
                        ctx.boundary_sec
                    );
                    return JoinOutcome::FusionFailed;
                }
                Err(_) => {
                    log_warn!(
                        "fusion timeout (> {}ms) for {} @ {}s",
                        self.timeout.as_millis(),
                        ctx.video_id,
                        ctx.boundary_sec
                    );
                    return JoinOutcome::FusionFailed;
                }
            };

        if !ctx.accepts_result(self.late_policy) {
            log_info!(
                "discarding late fused reading for {} @ {}s",
                ctx.video_id,
                ctx.boundary_sec
            );
            return JoinOutcome::Discarded;
        }

        let fused = FusedReading {
            id: Uuid::new_v4().to_string(),
            at: Utc::now(),
            video_id: ctx.video_id.clone(),
            time_sec: ctx.boundary_sec,
            valence: response.valence,
            arousal: response.arousal,
            discrete_emotion: response.discrete_emotion,
            fusion_confidence: response.fusion_confidence,
            strategy: response.strategy,
            visual_included: request.visual.is_some(),
            passive_included: request.passive.is_some(),
        };

        if !self
            .store
            .append(&ctx.session_id, SessionAppend::Fused(fused.clone()))
            .await
        {
            return JoinOutcome::NoSession;
        }

        log_info!(
            "fused {} @ {}s: {} (visual={}, passive={})",
            ctx.video_id,
            ctx.boundary_sec,
            fused.discrete_emotion,
            fused.visual_included,
            fused.passive_included
        );
        JoinOutcome::Fused(fused)
    }

    /// Polls until the early-stop rule is met or the deadline passes.
    ///
    /// `None` means cancelled; `Some(None)` means nothing resolved in time.
    async fn await_inputs(&self, ctx: &CaptureContext) -> Option<Option<ResolvedInputs>> {
        let started = Instant::now();
        let max_wait = self.wait.max_wait();
        let half_wait = max_wait / 2;
        let deadline = started + max_wait;

        for _ in 0..self.wait.max_attempts {
            if ctx.video_token.is_cancelled() {
                return None;
            }

            let inputs = self.resolve(ctx).await;
            if inputs.exact_visual() || (inputs.any() && started.elapsed() >= half_wait) {
                return Some(Some(inputs));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let next = (now + self.wait.poll_interval()).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = ctx.video_token.cancelled() => return None,
            }
        }

        if ctx.video_token.is_cancelled() {
            return None;
        }
        let inputs = self.resolve(ctx).await;
        Some(inputs.any().then_some(inputs))
    }

    async fn resolve(&self, ctx: &CaptureContext) -> ResolvedInputs {
        let Some(session) = self.store.get(&ctx.session_id).await else {
            return ResolvedInputs::default();
        };
        let grace = self.wait.grace_secs;

        ResolvedInputs {
            visual: select_reading(
                &session.visual_predictions,
                &ctx.video_id,
                ctx.boundary_sec,
                grace,
            )
            .map(|(reading, kind)| (reading.clone(), kind)),
            passive: select_reading(
                &session.passive_predictions,
                &ctx.video_id,
                ctx.boundary_sec,
                grace,
            )
            .map(|(reading, kind)| (reading.clone(), kind)),
        }
    }

    fn claim(&self, key: BoundaryKey) -> Option<KeyClaim> {
        let mut keys = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(KeyClaim {
            keys: Arc::clone(&self.in_flight),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::predictors::FusionResponse;

    struct FakeFusion {
        calls: AtomicUsize,
        requests: Mutex<Vec<FusionRequest>>,
        fail: bool,
        delay: Duration,
    }

    impl FakeFusion {
        fn new(fail: bool) -> Arc<Self> {
            Self::slow(fail, Duration::ZERO)
        }

        fn slow(fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                fail,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FusionPredictor for FakeFusion {
        async fn fuse(&self, request: &FusionRequest) -> Result<FusionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(anyhow!("500 Internal Server Error"));
            }
            let (valence, arousal) = match (&request.visual, &request.passive) {
                (Some(v), _) => (v.valence, v.arousal),
                (None, Some(p)) => (p.valence, p.arousal),
                (None, None) => (0.0, 0.0),
            };
            Ok(FusionResponse {
                valence,
                arousal,
                discrete_emotion: "happy".into(),
                fusion_confidence: 0.7,
                strategy: "weighted_average".into(),
            })
        }
    }

    fn visual(video_id: &str, time_sec: u64, valence: Option<f64>) -> VisualReading {
        VisualReading {
            id: Uuid::new_v4().to_string(),
            at: Utc::now(),
            video_id: video_id.into(),
            time_sec,
            valence,
            arousal: Some(0.3),
            confidence: Some(0.9),
            emotion: Some("happy".into()),
            faces_detected: 1,
        }
    }

    fn passive(video_id: &str, time_sec: u64) -> PassiveReading {
        PassiveReading {
            id: Uuid::new_v4().to_string(),
            at: Utc::now(),
            video_id: video_id.into(),
            time_sec,
            valence: Some(-0.5),
            arousal: Some(0.1),
            valence_class: None,
            arousal_class: None,
            simulated: false,
            window_secs: None,
        }
    }

    async fn setup(fail: bool) -> (SessionStore, String, Arc<FakeFusion>, FusionJoiner) {
        let store = SessionStore::in_memory();
        let session = store.create_session("p1").await;
        let fusion = FakeFusion::new(fail);
        let joiner = FusionJoiner::new(
            fusion.clone(),
            store.clone(),
            FusionWaitSettings::default(),
            Duration::from_secs(5),
            LateResultPolicy::Discard,
        );
        (store, session.id, fusion, joiner)
    }

    /// Exact visual reading at the boundary, fusion answering only after the video is
    /// switched away.
    async fn fuse_across_video_switch(
        policy: LateResultPolicy,
    ) -> (SessionStore, String, JoinOutcome) {
        let store = SessionStore::in_memory();
        let session = store.create_session("p1").await;
        store
            .append(&session.id, SessionAppend::Visual(visual("v1", 24, Some(0.6))))
            .await;

        let fusion = FakeFusion::slow(false, Duration::from_secs(1));
        let joiner = FusionJoiner::new(
            fusion.clone(),
            store.clone(),
            FusionWaitSettings::default(),
            Duration::from_secs(5),
            policy,
        );

        let join_ctx = ctx(&session.id, 24);
        let token = join_ctx.video_token.clone();
        let handle = joiner.trigger(join_ctx);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fusion.calls(), 1);
        token.cancel();

        let outcome = handle.await.unwrap();
        (store, session.id, outcome)
    }

    fn ctx(session_id: &str, boundary_sec: u64) -> CaptureContext {
        CaptureContext {
            session_id: session_id.into(),
            participant_id: "p1".into(),
            video_id: "v1".into(),
            boundary_sec,
            video_token: CancellationToken::new(),
        }
    }

    #[test]
    fn selection_prefers_exact_then_before_then_grace() {
        let readings = vec![
            visual("v1", 12, Some(0.1)),
            visual("v1", 23, Some(0.2)),
            visual("v1", 25, Some(0.3)),
            visual("v2", 24, Some(0.9)),
        ];

        let (picked, kind) = select_reading(&readings, "v1", 24, 2).unwrap();
        assert_eq!((picked.time_sec, kind), (23, MatchKind::Before));

        let (picked, kind) = select_reading(&readings, "v2", 24, 2).unwrap();
        assert_eq!((picked.time_sec, kind), (24, MatchKind::Exact));

        let (picked, kind) = select_reading(&readings, "v1", 10, 2).unwrap();
        assert_eq!((picked.time_sec, kind), (12, MatchKind::Grace));

        assert!(select_reading(&readings, "v1", 9, 2).is_none());
        assert!(select_reading(&readings, "v3", 24, 2).is_none());
    }

    #[test]
    fn duplicate_exact_matches_take_latest_append() {
        let readings = vec![visual("v1", 24, Some(0.1)), visual("v1", 24, Some(0.8))];
        let (picked, kind) = select_reading(&readings, "v1", 24, 2).unwrap();
        assert_eq!(kind, MatchKind::Exact);
        assert_eq!(picked.valence, Some(0.8));
    }

    #[test]
    fn request_zero_fills_fields_but_not_modalities() {
        let mut reading = visual("v1", 24, None);
        reading.confidence = Some(1.7);
        let inputs = ResolvedInputs {
            visual: Some((reading, MatchKind::Exact)),
            passive: None,
        };

        let request = inputs.to_request();
        let block = request.visual.unwrap();
        assert_eq!(block.valence, 0.0);
        assert_eq!(block.arousal, 0.3);
        assert_eq!(block.confidence, 1.0);
        assert!(request.passive.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn visual_only_boundary_fuses_without_passive() {
        let (store, session_id, fusion, joiner) = setup(false).await;
        store
            .append(&session_id, SessionAppend::Visual(visual("v1", 24, Some(0.6))))
            .await;

        let started = Instant::now();
        let outcome = joiner.join(&ctx(&session_id, 24)).await;
        assert!(started.elapsed() < Duration::from_millis(150));

        let JoinOutcome::Fused(fused) = outcome else {
            panic!("expected fused reading, got {outcome:?}");
        };
        assert_eq!(fused.time_sec, 24);
        assert_eq!(fused.valence, 0.6);
        assert!(fused.visual_included);
        assert!(!fused.passive_included);

        let request = fusion.requests.lock().unwrap()[0].clone();
        assert!(request.visual.is_some());
        assert!(request.passive.is_none());

        let log = store.get(&session_id).await.unwrap();
        assert_eq!(log.fused_predictions, vec![fused]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_abandons_boundary_without_retry() {
        let (store, session_id, fusion, joiner) = setup(false).await;

        let started = Instant::now();
        let outcome = joiner.join(&ctx(&session_id, 36)).await;
        assert_eq!(outcome, JoinOutcome::Abandoned);
        assert!(started.elapsed() >= Duration::from_millis(3_000));

        // A reading that turns up afterwards does not revive the boundary.
        store
            .append(&session_id, SessionAppend::Visual(visual("v1", 36, Some(0.2))))
            .await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(fusion.calls(), 0);
        assert!(store
            .get(&session_id)
            .await
            .unwrap()
            .fused_predictions
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn near_match_waits_for_half_window() {
        let (store, session_id, fusion, joiner) = setup(false).await;
        store
            .append(&session_id, SessionAppend::Passive(passive("v1", 24)))
            .await;

        let started = Instant::now();
        let outcome = joiner.join(&ctx(&session_id, 24)).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_500));
        assert!(elapsed < Duration::from_millis(3_000));

        let JoinOutcome::Fused(fused) = outcome else {
            panic!("expected fused reading, got {outcome:?}");
        };
        assert!(!fused.visual_included);
        assert!(fused.passive_included);
        assert_eq!(fusion.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_exact_visual_ends_wait_early() {
        let (store, session_id, fusion, joiner) = setup(false).await;
        store
            .append(&session_id, SessionAppend::Passive(passive("v1", 24)))
            .await;

        let late_store = store.clone();
        let late_session = session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            late_store
                .append(&late_session, SessionAppend::Visual(visual("v1", 24, Some(0.4))))
                .await;
        });

        let started = Instant::now();
        let outcome = joiner.join(&ctx(&session_id, 24)).await;
        assert!(started.elapsed() < Duration::from_millis(1_500));

        let JoinOutcome::Fused(fused) = outcome else {
            panic!("expected fused reading, got {outcome:?}");
        };
        assert!(fused.visual_included);
        assert!(fused.passive_included);

        let request = fusion.requests.lock().unwrap()[0].clone();
        assert_eq!(request.visual.unwrap().valence, 0.4);
        assert_eq!(request.passive.unwrap().valence, -0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn second_join_for_same_key_is_refused() {
        let (_store, session_id, fusion, joiner) = setup(false).await;

        let first = joiner.trigger(ctx(&session_id, 48));
        tokio::task::yield_now().await;
        assert_eq!(
            joiner.join(&ctx(&session_id, 48)).await,
            JoinOutcome::AlreadyInFlight
        );

        assert_eq!(first.await.unwrap(), JoinOutcome::Abandoned);
        assert_eq!(fusion.calls(), 0);

        // Key released once the first join finished.
        assert_eq!(
            joiner.join(&ctx(&session_id, 48)).await,
            JoinOutcome::Abandoned
        );
    }

    #[tokio::test(start_paused = true)]
    async fn video_switch_cancels_wait() {
        let (_store, session_id, fusion, joiner) = setup(false).await;
        let join_ctx = ctx(&session_id, 12);
        let token = join_ctx.video_token.clone();

        let handle = joiner.trigger(join_ctx);
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();

        assert_eq!(handle.await.unwrap(), JoinOutcome::Cancelled);
        assert_eq!(fusion.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fusion_failure_is_dropped() {
        let (store, session_id, fusion, joiner) = setup(true).await;
        store
            .append(&session_id, SessionAppend::Visual(visual("v1", 12, Some(0.1))))
            .await;

        assert_eq!(
            joiner.join(&ctx(&session_id, 12)).await,
            JoinOutcome::FusionFailed
        );
        assert_eq!(fusion.calls(), 1);
        assert!(store
            .get(&session_id)
            .await
            .unwrap()
            .fused_predictions
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_session_is_a_noop() {
        let (_store, _session_id, fusion, joiner) = setup(false).await;
        assert_eq!(joiner.join(&ctx("ghost", 12)).await, JoinOutcome::NoSession);
        assert_eq!(fusion.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_fusion_is_discarded_after_video_switch() {
        let (store, session_id, outcome) =
            fuse_across_video_switch(LateResultPolicy::Discard).await;

        assert_eq!(outcome, JoinOutcome::Discarded);
        assert!(store
            .get(&session_id)
            .await
            .unwrap()
            .fused_predictions
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_fusion_kept_under_origin_video() {
        let (store, session_id, outcome) =
            fuse_across_video_switch(LateResultPolicy::KeepOriginVideo).await;

        let JoinOutcome::Fused(fused) = outcome else {
            panic!("expected fused reading, got {outcome:?}");
        };
        assert_eq!(fused.video_id, "v1");
        assert_eq!(fused.time_sec, 24);

        let log = store.get(&session_id).await.unwrap();
        assert_eq!(log.fused_predictions, vec![fused]);
    }
}
