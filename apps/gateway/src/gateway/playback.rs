//! Shared play-position tracker for a theater room.
//!
//! The clock is either stopped or running. While running, a ticker task
//! advances the position once per tick. The ticker is a child of the room's
//! lifetime token, so destroying the room stops it even if nobody paused.

use std::sync::Arc;
use std::time::Duration;

use marquee_protocol::pb::{PlayerState, TheaterVideoPlayer};
use parking_lot::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct ClockState {
    position: f64,
    /// Present exactly while the clock is running.
    ticker: Option<CancellationToken>,
}

impl ClockState {
    fn is_running(&self) -> bool {
        self.ticker.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

/// Point-in-time view of a [`PlaybackClock`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    pub position: f64,
    pub running: bool,
}

impl ClockSnapshot {
    pub fn to_player(self) -> TheaterVideoPlayer {
        let state = if self.running {
            PlayerState::Playing
        } else {
            PlayerState::Paused
        };
        TheaterVideoPlayer::new(self.position, state)
    }
}

pub struct PlaybackClock {
    state: Arc<Mutex<ClockState>>,
    lifetime: CancellationToken,
    tick: Duration,
}

impl PlaybackClock {
    pub fn new(lifetime: CancellationToken, tick: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                position: 0.0,
                ticker: None,
            })),
            lifetime,
            tick,
        }
    }

    /// Start advancing. Returns `false` if the clock was already running or
    /// its room is gone.
    pub fn play(&self) -> bool {
        let mut state = self.state.lock();
        if state.ticker.is_some() || self.lifetime.is_cancelled() {
            return false;
        }

        let token = self.lifetime.child_token();
        state.ticker = Some(token.clone());
        tokio::spawn(run_ticker(Arc::clone(&self.state), token, self.tick));
        true
    }

    /// Stop advancing. Once this returns the position no longer changes.
    pub fn pause(&self) -> bool {
        let mut state = self.state.lock();
        match state.ticker.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Pause and rewind to zero.
    pub fn end(&self) {
        let mut state = self.state.lock();
        if let Some(token) = state.ticker.take() {
            token.cancel();
        }
        state.position = 0.0;
    }

    /// Overwrite the position without touching the run state. Non-finite or
    /// negative values clamp to zero.
    pub fn set_position(&self, seconds: f64) {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        self.state.lock().position = seconds;
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        let state = self.state.lock();
        ClockSnapshot {
            position: state.position,
            running: state.is_running(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running()
    }
}

async fn run_ticker(state: Arc<Mutex<ClockState>>, token: CancellationToken, period: Duration) {
    let step = period.as_secs_f64();
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let mut state = state.lock();
                // Pause cancels under this lock; re-check so a tick that
                // raced it is discarded.
                if token.is_cancelled() {
                    break;
                }
                state.position += step;
            }
        }
    }
}
