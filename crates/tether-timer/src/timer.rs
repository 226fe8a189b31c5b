use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{Result, TimerError};

/// Scan cadence of the background task while the timer exists.
const SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Events emitted by the timer, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    Started,
    /// Emitted on every scan while running, before the interval is reached.
    Tick { elapsed: Duration },
    /// The configured interval elapsed. Repeating timers rezero and keep
    /// running; one-shot timers transition to stopped.
    Completed,
    Paused,
    Stopped,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Stopped,
    Running,
    Paused,
}

struct TimerState {
    phase: TimerPhase,
    interval: Duration,
    repeat: bool,
    /// Wall-clock of the current run, shifted on resume so accumulated
    /// elapsed is preserved.
    started_at: Option<Instant>,
    paused_elapsed: Duration,
    disposed: bool,
}

impl TimerState {
    fn elapsed(&self, now: Instant) -> Duration {
        match self.phase {
            TimerPhase::Running => self
                .started_at
                .map(|t| now.duration_since(t))
                .unwrap_or_default(),
            TimerPhase::Paused => self.paused_elapsed,
            TimerPhase::Stopped => Duration::ZERO,
        }
    }
}

/// Pause/resume/reset-capable periodic timer.
///
/// Cloneable handle; all clones share one state machine and one event
/// channel. Construct with [`KeepAliveTimer::spawn`] inside a Tokio runtime.
#[derive(Clone)]
pub struct KeepAliveTimer {
    inner: Arc<Mutex<TimerState>>,
    events: mpsc::UnboundedSender<TimerEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl KeepAliveTimer {
    /// Create the timer and its scan task. The timer starts in the stopped
    /// phase; call [`start`](Self::start) to begin the countdown.
    pub fn spawn(
        interval: Duration,
        repeat: bool,
    ) -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Mutex::new(TimerState {
            phase: TimerPhase::Stopped,
            interval,
            repeat,
            started_at: None,
            paused_elapsed: Duration::ZERO,
            disposed: false,
        }));

        tokio::spawn(scan_loop(inner.clone(), events_tx.clone(), shutdown_rx));

        (
            Self {
                inner,
                events: events_tx,
                shutdown: Arc::new(shutdown_tx),
            },
            events_rx,
        )
    }

    /// Reconfigure the interval and repeat flag. Takes effect on the next
    /// scan; an in-progress countdown keeps its accumulated elapsed.
    pub fn set_interval(&self, interval: Duration, repeat: bool) -> Result<()> {
        if interval.is_zero() {
            return Err(TimerError::InvalidInterval(
                "interval must be non-zero".to_string(),
            ));
        }
        let mut state = self.lock_live()?;
        state.interval = interval;
        state.repeat = repeat;
        Ok(())
    }

    /// Start from stopped (zero elapsed) or resume from paused (elapsed
    /// preserved by shifting the start wall-clock). No-op while running.
    pub fn start(&self) -> Result<()> {
        let event = {
            let mut state = self.lock_live()?;
            let now = Instant::now();
            match state.phase {
                TimerPhase::Stopped => {
                    state.started_at = Some(now);
                    state.paused_elapsed = Duration::ZERO;
                    state.phase = TimerPhase::Running;
                    Some(TimerEvent::Started)
                }
                TimerPhase::Paused => {
                    state.started_at = Some(now - state.paused_elapsed);
                    state.phase = TimerPhase::Running;
                    Some(TimerEvent::Started)
                }
                TimerPhase::Running => None,
            }
        };
        self.emit(event);
        Ok(())
    }

    /// Suspend the countdown, keeping accumulated elapsed.
    pub fn pause(&self) -> Result<()> {
        let event = {
            let mut state = self.lock_live()?;
            if state.phase != TimerPhase::Running {
                None
            } else {
                let now = Instant::now();
                state.paused_elapsed = state.elapsed(now);
                state.started_at = None;
                state.phase = TimerPhase::Paused;
                Some(TimerEvent::Paused)
            }
        };
        self.emit(event);
        Ok(())
    }

    /// Re-`start` while paused.
    pub fn resume(&self) -> Result<()> {
        self.start()
    }

    /// Zero the elapsed time. Running timers keep running from now; paused
    /// timers transition to stopped; stopped timers are unaffected.
    pub fn reset(&self) -> Result<()> {
        let event = {
            let mut state = self.lock_live()?;
            match state.phase {
                TimerPhase::Running => {
                    state.started_at = Some(Instant::now());
                    None
                }
                TimerPhase::Paused => {
                    state.phase = TimerPhase::Stopped;
                    state.started_at = None;
                    state.paused_elapsed = Duration::ZERO;
                    Some(TimerEvent::Stopped)
                }
                TimerPhase::Stopped => None,
            }
        };
        self.emit(event);
        Ok(())
    }

    /// Idempotent stop. Unlike every other operation, this is also safe on a
    /// disposed timer.
    pub fn stop(&self) {
        let event = {
            let mut state = self.inner.lock().unwrap();
            if state.phase == TimerPhase::Stopped {
                None
            } else {
                state.phase = TimerPhase::Stopped;
                state.started_at = None;
                state.paused_elapsed = Duration::ZERO;
                Some(TimerEvent::Stopped)
            }
        };
        self.emit(event);
    }

    /// Time left until the interval completes. Full interval while stopped.
    pub fn remaining(&self) -> Result<Duration> {
        let state = self.lock_live()?;
        Ok(state.interval.saturating_sub(state.elapsed(Instant::now())))
    }

    pub fn phase(&self) -> Result<TimerPhase> {
        Ok(self.lock_live()?.phase)
    }

    /// Stop the timer and terminate the scan task. After this, every call
    /// except `stop` returns [`TimerError::Disposed`].
    pub fn dispose(&self) {
        {
            let mut state = self.inner.lock().unwrap();
            state.disposed = true;
            state.phase = TimerPhase::Stopped;
            state.started_at = None;
            state.paused_elapsed = Duration::ZERO;
        }
        let _ = self.shutdown.send(true);
        debug!("keep-alive timer disposed");
    }

    fn lock_live(&self) -> Result<std::sync::MutexGuard<'_, TimerState>> {
        let state = self.inner.lock().unwrap();
        if state.disposed {
            return Err(TimerError::Disposed);
        }
        Ok(state)
    }

    fn emit(&self, event: Option<TimerEvent>) {
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }
}

/// Background scan at fixed cadence. Mutations happen under the lock; event
/// sends happen after it is released.
async fn scan_loop(
    inner: Arc<Mutex<TimerState>>,
    events: mpsc::UnboundedSender<TimerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(SCAN_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut to_emit: Option<TimerEvent> = None;
                {
                    let mut state = inner.lock().unwrap();
                    if state.disposed {
                        break;
                    }
                    if state.phase == TimerPhase::Running {
                        let now = Instant::now();
                        let elapsed = state.elapsed(now);
                        if elapsed >= state.interval {
                            if state.repeat {
                                state.started_at = Some(now);
                            } else {
                                state.phase = TimerPhase::Stopped;
                                state.started_at = None;
                                state.paused_elapsed = Duration::ZERO;
                            }
                            to_emit = Some(TimerEvent::Completed);
                        } else {
                            to_emit = Some(TimerEvent::Tick { elapsed });
                        }
                    }
                }
                if let Some(event) = to_emit {
                    if events.send(event).is_err() {
                        break; // receiver dropped
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
