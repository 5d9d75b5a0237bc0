//! Periodic Timer: drift-resistant tick source.
//!
//! The next deadline is always the previous deadline plus the interval. When
//! the clock has already passed one or more deadlines the timer emits a single
//! tick for the crossing and jumps ahead, so consumers never see a catch-up
//! burst. Ticks fan out to subscribers over a broadcast channel.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use cadence_core::{CadenceError, Result, SharedClock, TimeSpan, Timestamp, TimerConfig};
use futures::Stream;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One emitted tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tick {
    /// Emission count, starting at 0. Skipped intervals do not consume an index.
    pub index: u64,
    pub timestamp: Timestamp,
    /// Time since the previous emitted tick (or since start).
    pub elapsed: TimeSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerOptions {
    pub interval: TimeSpan,
    /// Dispose after this many ticks.
    pub count: Option<u64>,
    /// Busy-wait instead of sleeping once the deadline is this close.
    pub spin_wait: TimeSpan,
}

impl TimerOptions {
    /// Options for an unbounded timer with the given interval.
    pub fn new(interval: TimeSpan) -> Self {
        Self {
            interval,
            count: None,
            spin_wait: TimeSpan::ZERO,
        }
    }

    /// Stop after `count` ticks.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Busy-wait this close to each due time instead of sleeping.
    pub fn with_spin_wait(mut self, spin_wait: TimeSpan) -> Self {
        self.spin_wait = spin_wait;
        self
    }

    /// Checks the interval bounds, the spin wait and the tick count.
    pub fn validate(&self) -> Result<()> {
        if self.interval < TimeSpan::TICK {
            return Err(CadenceError::invalid("interval", "must be at least one tick"));
        }
        if self.interval.whole_millis() > i64::from(i32::MAX) {
            return Err(CadenceError::invalid(
                "interval",
                format!("must not exceed {} ms", i32::MAX),
            ));
        }
        if self.spin_wait.is_negative() {
            return Err(CadenceError::invalid("spin_wait", "must not be negative"));
        }
        if self.count == Some(0) {
            return Err(CadenceError::invalid("count", "must be >= 1"));
        }
        Ok(())
    }
}

/// Cloneable handle to a periodic timer.
#[derive(Clone)]
pub struct PeriodicTimer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    clock: SharedClock,
    options: TimerOptions,
    sender: Mutex<Option<broadcast::Sender<Tick>>>,
    state: Mutex<RunState>,
    emitted: AtomicU64,
}

#[derive(Default)]
struct RunState {
    running: Option<CancellationToken>,
    generation: u64,
    disposed: bool,
}

impl PeriodicTimer {
    /// Unbounded timer ticking every `interval`.
    pub fn new(clock: SharedClock, interval: TimeSpan) -> Result<Self> {
        Self::with_options(clock, TimerOptions::new(interval))
    }

    /// Timer built from explicit options.
    pub fn with_options(clock: SharedClock, options: TimerOptions) -> Result<Self> {
        Self::build(clock, options, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Timer built from the `[timer]` config section.
    pub fn from_config(clock: SharedClock, config: &TimerConfig) -> Result<Self> {
        let options = TimerOptions {
            interval: config.interval(),
            count: config.count,
            spin_wait: config.spin_wait(),
        };
        Self::build(clock, options, config.channel_capacity)
    }

    fn build(clock: SharedClock, options: TimerOptions, capacity: usize) -> Result<Self> {
        options.validate()?;
        if capacity == 0 {
            return Err(CadenceError::invalid("channel_capacity", "must be >= 1"));
        }
        let (sender, _) = broadcast::channel(capacity);
        Ok(Self {
            inner: Arc::new(TimerInner {
                clock,
                options,
                sender: Mutex::new(Some(sender)),
                state: Mutex::new(RunState::default()),
                emitted: AtomicU64::new(0),
            }),
        })
    }

    pub fn options(&self) -> &TimerOptions {
        &self.inner.options
    }

    /// Stream of ticks emitted from now on. Ends when the timer is disposed.
    pub fn subscribe(&self) -> TickStream {
        match self.inner.sender_guard().as_ref() {
            Some(sender) => TickStream::from_receiver(sender.subscribe()),
            None => TickStream::terminated(),
        }
    }

    /// Run on the calling thread until stopped or disposed. Returns `false`
    /// straight away if already running or disposed. Inside a current-thread
    /// runtime the timer gets a dedicated thread.
    pub fn start(&self) -> bool {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                let Some((stop, generation)) = self.inner.begin_running() else {
                    return false;
                };
                let run = run_timer(Arc::clone(&self.inner), stop, generation, TimeSpan::ZERO);
                tokio::task::block_in_place(|| handle.block_on(run))
            }
            Ok(_) => std::thread::scope(|scope| {
                scope.spawn(|| self.run_blocking()).join().unwrap_or_else(|_| {
                    tracing::error!("Timer thread panicked");
                    false
                })
            }),
            Err(_) => self.run_blocking(),
        }
    }

    fn run_blocking(&self) -> bool {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!("Failed to build timer runtime: {e}");
                return false;
            }
        };
        let Some((stop, generation)) = self.inner.begin_running() else {
            return false;
        };
        runtime.block_on(run_timer(Arc::clone(&self.inner), stop, generation, TimeSpan::ZERO))
    }

    /// Spawn the timer on the current runtime after `initial_delay`.
    pub fn start_async(&self, initial_delay: TimeSpan) -> JoinHandle<bool> {
        self.start_on(&tokio::runtime::Handle::current(), initial_delay)
    }

    /// Spawn the timer on `handle`. The handle resolves to `false` if the
    /// timer was already running or disposed.
    pub fn start_on(&self, handle: &tokio::runtime::Handle, initial_delay: TimeSpan) -> JoinHandle<bool> {
        match self.inner.begin_running() {
            Some((stop, generation)) => handle.spawn(run_timer(
                Arc::clone(&self.inner),
                stop,
                generation,
                initial_delay,
            )),
            None => handle.spawn(async { false }),
        }
    }

    /// Halt emission without disposing. Returns whether a running timer was stopped.
    pub fn stop(&self) -> bool {
        let mut state = self.inner.state_guard();
        match state.running.take() {
            Some(stop) => {
                stop.cancel();
                tracing::debug!("⏸️ Timer stopped");
                true
            }
            None => false,
        }
    }

    /// Stop for good and end every subscriber stream.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Whether a timer loop is currently emitting ticks.
    pub fn is_running(&self) -> bool {
        self.inner.state_guard().running.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state_guard().disposed
    }

    /// Ticks emitted so far, across stop and restart.
    pub fn ticks_emitted(&self) -> u64 {
        self.inner.emitted.load(Ordering::SeqCst)
    }
}

impl TimerInner {
    fn state_guard(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender_guard(&self) -> MutexGuard<'_, Option<broadcast::Sender<Tick>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_running(&self) -> Option<(CancellationToken, u64)> {
        let mut state = self.state_guard();
        if state.disposed || state.running.is_some() {
            return None;
        }
        let stop = CancellationToken::new();
        state.generation += 1;
        state.running = Some(stop.clone());
        Some((stop, state.generation))
    }

    fn finish_run(&self, generation: u64) {
        let mut state = self.state_guard();
        if state.generation == generation {
            state.running = None;
        }
    }

    fn dispose(&self) {
        {
            let mut state = self.state_guard();
            if state.disposed {
                return;
            }
            state.disposed = true;
            if let Some(stop) = state.running.take() {
                stop.cancel();
            }
        }
        self.sender_guard().take();
        tracing::info!("🛑 Timer disposed after {} tick(s)", self.emitted.load(Ordering::SeqCst));
    }

    fn emit(&self, timestamp: Timestamp, elapsed: TimeSpan) -> u64 {
        let index = self.emitted.fetch_add(1, Ordering::SeqCst);
        let tick = Tick {
            index,
            timestamp,
            elapsed,
        };
        if let Some(sender) = self.sender_guard().as_ref() {
            // No subscribers is not an error.
            let _ = sender.send(tick);
        }
        tracing::trace!("Tick #{index} at {timestamp} (+{elapsed})");
        index + 1
    }
}

async fn run_timer(
    inner: Arc<TimerInner>,
    stop: CancellationToken,
    generation: u64,
    initial_delay: TimeSpan,
) -> bool {
    if initial_delay > TimeSpan::ZERO {
        tokio::select! {
            _ = stop.cancelled() => {
                inner.finish_run(generation);
                return true;
            }
            _ = inner.clock.sleep(initial_delay) => {}
        }
    }

    let TimerOptions {
        interval,
        count,
        spin_wait,
    } = inner.options;
    let mut last = inner.clock.now();
    let mut expected = last + interval;
    tracing::debug!("▶️ Timer running every {interval}");

    while !stop.is_cancelled() {
        let now = inner.clock.now();
        let remaining = expected - now;

        if remaining > TimeSpan::ZERO {
            if remaining <= spin_wait {
                std::hint::spin_loop();
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = inner.clock.sleep(remaining - spin_wait) => {}
                }
            }
            continue;
        }

        // Skip every boundary already passed; emit once for the crossing.
        let missed = (now - expected).ticks() / interval.ticks();
        expected += interval * missed.saturating_add(1);
        let emitted = inner.emit(now, now - last);
        last = now;

        if count.is_some_and(|count| emitted >= count) {
            inner.dispose();
            break;
        }
    }

    inner.finish_run(generation);
    true
}

/// Subscriber side of a [`PeriodicTimer`]. Lagging subscribers skip ticks.
pub struct TickStream {
    inner: BoxStream<'static, Tick>,
}

impl TickStream {
    fn from_receiver(receiver: broadcast::Receiver<Tick>) -> Self {
        let ticks = BroadcastStream::new(receiver).filter_map(|item| async move {
            match item {
                Ok(tick) => Some(tick),
                Err(e) => {
                    tracing::debug!("Tick subscriber lagging: {e}");
                    None
                }
            }
        });
        Self {
            inner: ticks.boxed(),
        }
    }

    fn terminated() -> Self {
        Self {
            inner: stream::empty().boxed(),
        }
    }
}

impl Stream for TickStream {
    type Item = Tick;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Tick>> {
        self.inner.as_mut().poll_next(cx)
    }
}
