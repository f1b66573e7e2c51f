use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::log_debug;

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Bumped on every `start`; ticks from an older arming are never delivered.
    pub generation: u64,
    pub seq: u64,
    /// Active time since start, excluding pauses.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    Stop,
}

#[derive(Debug, Default)]
struct ClockState {
    generation: u64,
    running: bool,
    paused: bool,
    /// Time accumulated from earlier running windows; combines with `anchor`
    /// to compute the true active duration.
    baseline: Duration,
    anchor: Option<Instant>,
    seq: u64,
}

impl ClockState {
    fn elapsed_at(&self, now: Instant) -> Duration {
        match self.anchor {
            Some(anchor) => self.baseline + now.saturating_duration_since(anchor),
            None => self.baseline,
        }
    }
}

struct Ticker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Single tick source for a running workout. Elapsed time is measured against
/// the monotonic clock, not counted from ticks.
#[derive(Clone)]
pub struct WorkoutClock {
    state: Arc<Mutex<ClockState>>,
    ticker: Arc<Mutex<Option<Ticker>>>,
    tick_interval: Duration,
}

impl WorkoutClock {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState::default())),
            ticker: Arc::new(Mutex::new(None)),
            tick_interval,
        }
    }

    /// Arms the clock from zero and returns the new generation. Any previous
    /// ticker is cancelled first.
    pub async fn start<F, Fut>(&self, mut on_tick: F) -> u64
    where
        F: FnMut(Tick) -> Fut + Send + 'static,
        Fut: Future<Output = TickFlow> + Send + 'static,
    {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(previous) = ticker_guard.take() {
            previous.cancel.cancel();
        }

        let started = Instant::now();
        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.running = true;
            state.paused = false;
            state.baseline = Duration::ZERO;
            state.anchor = Some(started);
            state.seq = 0;
            state.generation
        };

        let state = self.state.clone();
        let period = self.tick_interval;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(started + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let tick = {
                    let mut guard = state.lock().await;
                    if guard.generation != generation || !guard.running {
                        break;
                    }
                    // Keep firing while paused so resume needs no re-arming.
                    if guard.paused {
                        continue;
                    }
                    guard.seq += 1;
                    Tick {
                        generation,
                        seq: guard.seq,
                        elapsed: guard.elapsed_at(Instant::now()),
                    }
                };

                if on_tick(tick).await == TickFlow::Stop {
                    break;
                }
            }

            log_debug!("Clock ticker {generation} finished");
        });

        *ticker_guard = Some(Ticker { handle, cancel });
        generation
    }

    pub async fn pause(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.running || state.paused {
            return false;
        }
        state.baseline = state.elapsed_at(Instant::now());
        state.anchor = None;
        state.paused = true;
        true
    }

    pub async fn resume(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.running || !state.paused {
            return false;
        }
        state.anchor = Some(Instant::now());
        state.paused = false;
        true
    }

    /// Stops ticking and returns the final active time. Safe to call from
    /// inside the tick callback.
    pub async fn stop(&self) -> Duration {
        let elapsed = {
            let mut state = self.state.lock().await;
            let elapsed = state.elapsed_at(Instant::now());
            state.baseline = elapsed;
            state.anchor = None;
            state.running = false;
            state.paused = false;
            elapsed
        };

        if let Some(ticker) = self.ticker.lock().await.take() {
            ticker.cancel.cancel();
        }

        elapsed
    }

    pub async fn elapsed(&self) -> Duration {
        self.state.lock().await.elapsed_at(Instant::now())
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn has_live_ticker(&self) -> bool {
        self.ticker
            .lock()
            .await
            .as_ref()
            .is_some_and(|ticker| !ticker.handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn collecting(clock_label: &'static str) -> (
        impl FnMut(Tick) -> std::future::Ready<TickFlow> + Send + 'static,
        mpsc::UnboundedReceiver<(&'static str, Tick)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = move |tick: Tick| {
            let _ = tx.send((clock_label, tick));
            std::future::ready(TickFlow::Continue)
        };
        (callback, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<(&'static str, Tick)>) -> Vec<Tick> {
        let mut ticks = Vec::new();
        while let Ok((_, tick)) = rx.try_recv() {
            ticks.push(tick);
        }
        ticks
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_once_per_interval_with_wall_clock_elapsed() {
        let clock = WorkoutClock::new(Duration::from_secs(1));
        let (callback, mut rx) = collecting("a");
        clock.start(callback).await;

        time::sleep(Duration::from_millis(3_500)).await;

        let elapsed: Vec<u64> = drain(&mut rx).iter().map(|t| t.elapsed.as_secs()).collect();
        assert_eq!(elapsed, vec![1, 2, 3]);
        assert!(clock.has_live_ticker().await);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_suppresses_ticks_and_freezes_elapsed() {
        let clock = WorkoutClock::new(Duration::from_secs(1));
        let (callback, mut rx) = collecting("a");
        clock.start(callback).await;

        time::sleep(Duration::from_millis(2_500)).await;
        assert!(clock.pause().await);
        assert!(!clock.pause().await);
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(clock.elapsed().await, Duration::from_millis(2_500));
        assert!(clock.resume().await);
        time::sleep(Duration::from_millis(1_700)).await;

        let ticks = drain(&mut rx);
        let elapsed: Vec<Duration> = ticks.iter().map(|t| t.elapsed).collect();
        assert_eq!(
            elapsed,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(4),
            ]
        );
        assert_eq!(ticks.last().map(|t| t.seq), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_leaves_a_single_tick_source() {
        let clock = WorkoutClock::new(Duration::from_secs(1));
        let (first, mut first_rx) = collecting("first");
        let (second, mut second_rx) = collecting("second");

        let first_generation = clock.start(first).await;
        time::sleep(Duration::from_millis(1_500)).await;
        let second_generation = clock.start(second).await;
        time::sleep(Duration::from_millis(3_200)).await;

        assert_ne!(first_generation, second_generation);
        assert_eq!(drain(&mut first_rx).len(), 1);
        let ticks = drain(&mut second_rx);
        assert_eq!(ticks.len(), 3);
        assert!(ticks.iter().all(|t| t.generation == second_generation));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_ticking() {
        let clock = WorkoutClock::new(Duration::from_secs(1));
        let (callback, mut rx) = collecting("a");
        clock.start(callback).await;

        time::sleep(Duration::from_millis(2_200)).await;
        assert_eq!(clock.stop().await, Duration::from_millis(2_200));
        time::sleep(Duration::from_secs(3)).await;

        assert_eq!(drain(&mut rx).len(), 2);
        assert!(!clock.is_running().await);
        assert!(!clock.has_live_ticker().await);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_can_stop_the_loop() {
        let clock = WorkoutClock::new(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        clock
            .start(move |tick: Tick| {
                let _ = tx.send(tick.seq);
                std::future::ready(if tick.seq >= 2 {
                    TickFlow::Stop
                } else {
                    TickFlow::Continue
                })
            })
            .await;

        time::sleep(Duration::from_secs(5)).await;

        let mut seqs = Vec::new();
        while let Ok(seq) = rx.try_recv() {
            seqs.push(seq);
        }
        assert_eq!(seqs, vec![1, 2]);
    }
}
