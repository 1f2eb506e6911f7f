use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use log::info;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{models::VideoRef, settings::PlaylistEntry};

use super::{PlaybackState, PlaybackStatus, PlaybackTick};

/// Simulated video player. Emits one [`PlaybackTick`] per tick interval while a video
/// is loaded, paused or not, and stops ticking once the video reaches its duration.
#[derive(Clone)]
pub struct PlaybackController {
    state: Arc<Mutex<PlaybackState>>,
    ticks: mpsc::Sender<PlaybackTick>,
    status: Arc<watch::Sender<PlaybackStatus>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
}

impl PlaybackController {
    pub fn new(ticks: mpsc::Sender<PlaybackTick>) -> Self {
        let (status, _) = watch::channel(PlaybackStatus::Idle);
        Self {
            state: Arc::new(Mutex::new(PlaybackState::new())),
            ticks,
            status: Arc::new(status),
            ticker: Arc::new(Mutex::new(None)),
            tick_interval: Duration::from_secs(1),
        }
    }

    pub async fn snapshot(&self) -> PlaybackState {
        let mut guard = self.state.lock().await;
        guard.sync_position(Instant::now());
        guard.clone()
    }

    /// Switch videos. The new video starts paused at zero.
    pub async fn load(&self, video: VideoRef, duration_secs: Option<u64>) {
        info!("loading video {} ({})", video.id, video.title);
        {
            let mut state = self.state.lock().await;
            state.load(video, duration_secs);
        }
        self.status.send_replace(PlaybackStatus::Paused);
        self.spawn_ticker().await;
    }

    pub async fn play(&self) -> Result<()> {
        self.transition(|state, now| state.play(now)).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.transition(|state, now| state.pause(now)).await
    }

    pub async fn seek(&self, position_secs: u64) -> Result<()> {
        self.transition(|state, now| state.seek(position_secs, now))
            .await
    }

    /// Waits for the loaded video to reach its end. Returns false if cancelled first.
    pub async fn wait_until_ended(&self, cancel: &CancellationToken) -> bool {
        let mut status = self.status.subscribe();
        tokio::select! {
            result = status.wait_for(|status| *status == PlaybackStatus::Ended) => result.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
        *self.state.lock().await = PlaybackState::new();
        self.status.send_replace(PlaybackStatus::Idle);
    }

    async fn transition<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut PlaybackState, Instant),
    {
        let status = {
            let mut state = self.state.lock().await;
            if state.video.is_none() {
                return Err(anyhow!("no video loaded"));
            }
            apply(&mut state, Instant::now());
            state.status
        };
        self.status.send_replace(status);
        Ok(())
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let ticks = self.ticks.clone();
        let status = self.status.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;

                let (tick, ended) = {
                    let mut guard = state.lock().await;
                    if matches!(guard.status, PlaybackStatus::Idle | PlaybackStatus::Ended) {
                        break;
                    }
                    let now = Instant::now();
                    let ended = guard.reached_end(now);
                    if ended {
                        guard.finish(now);
                    }
                    match guard.tick(now) {
                        Some(tick) => (tick, ended),
                        None => break,
                    }
                };

                // Final position is reported as playing so its boundary still fires.
                let tick = if ended {
                    PlaybackTick {
                        paused: false,
                        ..tick
                    }
                } else {
                    tick
                };

                if ticks.send(tick).await.is_err() {
                    break;
                }
                if ended {
                    status.send_replace(PlaybackStatus::Ended);
                    break;
                }
            }
        });

        *ticker_guard = Some(handle);
    }
}

/// Plays every entry to its end, in order. Returns how many videos finished.
pub async fn run_playlist(
    controller: &PlaybackController,
    playlist: &[PlaylistEntry],
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut finished = 0;
    for entry in playlist {
        if cancel.is_cancelled() {
            break;
        }
        let video = VideoRef {
            id: entry.id.clone(),
            title: entry.title.clone(),
        };
        controller.load(video, Some(entry.duration_secs)).await;
        controller.play().await?;
        if !controller.wait_until_ended(cancel).await {
            break;
        }
        finished += 1;
    }
    controller.stop().await;
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, duration_secs: u64) -> PlaylistEntry {
        PlaylistEntry {
            id: id.into(),
            title: format!("Clip {id}"),
            duration_secs,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<PlaybackTick>) -> Vec<(String, u64, bool)> {
        let mut seen = Vec::new();
        while let Some(tick) = rx.recv().await {
            seen.push((tick.video.id, tick.position_secs, tick.paused));
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn playlist_ticks_every_second_until_each_video_ends() {
        let (tx, rx) = mpsc::channel(64);
        let collector = tokio::spawn(collect(rx));

        let controller = PlaybackController::new(tx);
        let cancel = CancellationToken::new();
        let finished = run_playlist(&controller, &[entry("v1", 3), entry("v2", 2)], &cancel)
            .await
            .unwrap();
        assert_eq!(finished, 2);
        drop(controller);

        let seen = collector.await.unwrap();
        let playing: Vec<(String, u64)> = seen
            .into_iter()
            .filter(|(_, _, paused)| !paused)
            .map(|(id, position, _)| (id, position))
            .collect();
        assert_eq!(playing.first(), Some(&("v1".to_string(), 0)));
        assert!(playing.contains(&("v1".to_string(), 3)));
        assert_eq!(playing.last(), Some(&("v2".to_string(), 2)));

        let v1_positions: Vec<u64> = playing
            .iter()
            .filter(|(id, _)| id == "v1")
            .map(|(_, position)| *position)
            .collect();
        assert!(v1_positions.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_clock_reports_paused_ticks() {
        let (tx, mut rx) = mpsc::channel(64);
        let controller = PlaybackController::new(tx);
        controller
            .load(
                VideoRef {
                    id: "v1".into(),
                    title: "Clip v1".into(),
                },
                Some(120),
            )
            .await;

        let first = rx.recv().await.unwrap();
        assert!(first.paused);
        assert_eq!(first.position_secs, 0);

        controller.play().await.unwrap();
        time::sleep(Duration::from_millis(5_500)).await;
        controller.pause().await.unwrap();
        while let Ok(tick) = rx.try_recv() {
            assert_eq!(tick.video.id, "v1");
        }

        let paused = rx.recv().await.unwrap();
        assert!(paused.paused);
        assert_eq!(paused.position_secs, 5);
        assert_eq!(controller.snapshot().await.status, PlaybackStatus::Paused);

        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn controls_need_a_loaded_video() {
        let (tx, _rx) = mpsc::channel(4);
        let controller = PlaybackController::new(tx);
        assert!(controller.play().await.is_err());
        assert!(controller.seek(12).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_playlist_early() {
        let (tx, rx) = mpsc::channel(64);
        let collector = tokio::spawn(collect(rx));
        let controller = PlaybackController::new(tx);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(4)).await;
            canceller.cancel();
        });

        let finished = run_playlist(&controller, &[entry("v1", 600)], &cancel)
            .await
            .unwrap();
        assert_eq!(finished, 0);
        drop(controller);

        let seen = collector.await.unwrap();
        assert!(seen.iter().all(|(_, position, _)| *position <= 4));
    }
}
