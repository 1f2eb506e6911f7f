//! Boundary-driven capture, fusion and the per-session runner that ties them together.

pub mod joiner;
pub mod producers;
pub mod runner;
pub mod scheduler;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio_util::sync::CancellationToken;

use crate::settings::LateResultPolicy;

pub use joiner::{FusionJoiner, JoinOutcome};
pub use producers::{PassiveProducer, VisualProducer};
pub use runner::{run_session_loop, submit_rating, Pipeline, RatingPrompt, SessionRunner};
pub use scheduler::{BoundaryEvent, BoundaryKind, BoundaryScheduler};

/// Everything a producer or the joiner needs to know about the boundary it serves.
#[derive(Debug, Clone)]
pub struct CaptureContext {
    pub session_id: String,
    pub participant_id: String,
    pub video_id: String,
    pub boundary_sec: u64,
    /// Cancelled when the video is switched away or the session is reset.
    pub video_token: CancellationToken,
}

impl CaptureContext {
    /// Whether a result that just arrived for this boundary may still be appended.
    pub fn accepts_result(&self, policy: LateResultPolicy) -> bool {
        !self.video_token.is_cancelled() || policy == LateResultPolicy::KeepOriginVideo
    }
}

/// At most one outstanding operation per owner.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn try_begin(&self) -> Option<FlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Clears the flight flag when dropped, including on early return.
#[derive(Debug)]
pub struct FlightGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Reject non-finite values and clamp the rest to [-1, 1].
pub(crate) fn signed_unit(value: Option<f64>) -> Option<f64> {
    value
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_flight_admits_one_holder() {
        let flight = SingleFlight::default();
        let guard = flight.try_begin().unwrap();
        assert!(flight.is_busy());
        assert!(flight.try_begin().is_none());

        drop(guard);
        assert!(!flight.is_busy());
        assert!(flight.try_begin().is_some());
    }

    #[test]
    fn late_results_follow_policy() {
        let ctx = CaptureContext {
            session_id: "s1".into(),
            participant_id: "p1".into(),
            video_id: "v1".into(),
            boundary_sec: 12,
            video_token: CancellationToken::new(),
        };
        assert!(ctx.accepts_result(LateResultPolicy::Discard));

        ctx.video_token.cancel();
        assert!(!ctx.accepts_result(LateResultPolicy::Discard));
        assert!(ctx.accepts_result(LateResultPolicy::KeepOriginVideo));
    }

    #[test]
    fn signed_unit_clamps_and_filters() {
        assert_eq!(signed_unit(Some(1.7)), Some(1.0));
        assert_eq!(signed_unit(Some(-0.25)), Some(-0.25));
        assert_eq!(signed_unit(Some(f64::NAN)), None);
        assert_eq!(signed_unit(None), None);
    }
}
