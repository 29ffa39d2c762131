// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Quiet-window debouncing for a single logical stream.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::StopMode;

pub(crate) type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Configuration for [`Debouncer`].
///
/// If neither edge is enabled the constructor forces `trailing`, so a plain
/// `DebounceConfig::new(wait)` debounces on the trailing edge.
pub struct DebounceConfig<T> {
    pub(crate) wait: Duration,
    pub(crate) leading: bool,
    pub(crate) trailing: bool,
    pub(crate) max_wait: Option<Duration>,
    pub(crate) stop_mode: StopMode,
    pub(crate) on_stop: Option<Callback<T>>,
}

impl<T> DebounceConfig<T> {
    /// A burst ends once no trigger has arrived for `wait`.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            leading: false,
            trailing: false,
            max_wait: None,
            stop_mode: StopMode::Noop,
            on_stop: None,
        }
    }

    /// Emit the first trigger of a burst immediately.
    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    /// Emit the last trigger of a burst once the quiet window elapses.
    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    /// Upper bound on emission latency: armed on the first trigger of a burst
    /// and not reset by the triggers that follow it.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// What `stop()` does with a pending value. Defaults to [`StopMode::Noop`].
    pub fn with_stop_mode(mut self, stop_mode: StopMode) -> Self {
        self.stop_mode = stop_mode;
        self
    }

    /// Callback handed the most recently seen value when the stop mode asks
    /// for it — the pre-flush value mid-burst, or the already-emitted one
    /// when the last burst closed naturally. Skipped only by an instance
    /// that never saw a value.
    pub fn with_on_stop(mut self, on_stop: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(on_stop));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.wait == Duration::ZERO {
            return Err(ConfigError::NonPositiveWait);
        }
        if self.max_wait == Some(Duration::ZERO) {
            return Err(ConfigError::NonPositiveMaxWait);
        }
        Ok(())
    }

    pub(crate) fn normalize(&mut self) {
        if !self.leading && !self.trailing {
            self.trailing = true;
        }
    }
}

/// Collapses bursts of triggers into at most one leading and/or one trailing
/// emission per quiet window.
///
/// Callbacks run outside the state lock and are serialized per instance. A
/// callback may re-enter `trigger` on the same instance; it must not call
/// `flush` or `stop` from a different thread's callback context.
pub struct Debouncer<T> {
    inner: Arc<DebounceInner<T>>,
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DebounceInner<T> {
    config: DebounceConfig<T>,
    callback: Callback<T>,
    cancel: CancellationToken,
    state: Mutex<DebounceState<T>>,
    // Serializes callback invocations without holding the state lock.
    // Reentrant so a callback may trigger the same instance.
    emit_serial: ReentrantMutex<()>,
}

struct DebounceState<T> {
    // Most recent value seen. Retained after emissions clear `pending` so
    // stop can still report it; None only before the first trigger.
    last: Option<T>,
    pending: bool,
    stopped: bool,
    // Arming bumps the generation and spawns a sleeper stamped with it;
    // disarming bumps it again so stale sleepers no-op.
    wait_gen: u64,
    max_gen: u64,
}

#[derive(Clone, Copy)]
enum TimerKind {
    Wait,
    Max,
}

impl<T: Clone + Send + 'static> Debouncer<T> {
    /// Must be called from within a Tokio runtime; trigger timers are spawned
    /// lazily and exit when `cancel` fires.
    pub fn new(
        cancel: CancellationToken,
        mut config: DebounceConfig<T>,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        config.normalize();
        Ok(Self::from_validated(cancel, config, Arc::new(callback)))
    }

    pub(crate) fn from_validated(
        cancel: CancellationToken,
        config: DebounceConfig<T>,
        callback: Callback<T>,
    ) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                config,
                callback,
                cancel,
                state: Mutex::new(DebounceState {
                    last: None,
                    pending: false,
                    stopped: false,
                    wait_gen: 0,
                    max_gen: 0,
                }),
                emit_serial: ReentrantMutex::new(()),
            }),
        }
    }

    /// Records `value` as the pending emission and (re)arms the quiet window.
    /// On the first trigger of a burst this also fires the leading edge (if
    /// configured) and arms the max-wait bound (if configured). No-op once
    /// stopped.
    pub fn trigger(&self, value: T) {
        let inner = &self.inner;
        let leading = {
            let mut st = inner.state.lock();
            if st.stopped {
                return;
            }
            let first = !st.pending;
            st.pending = true;
            let leading = if inner.config.leading && first {
                Some(value.clone())
            } else {
                None
            };
            st.last = Some(value);
            DebounceInner::arm(inner, &mut st, TimerKind::Wait, inner.config.wait);
            if first {
                if let Some(max_wait) = inner.config.max_wait {
                    DebounceInner::arm(inner, &mut st, TimerKind::Max, max_wait);
                }
            }
            leading
        };
        if let Some(value) = leading {
            let _serial = inner.emit_serial.lock();
            (inner.callback)(value);
        }
    }

    /// Forces the trailing emission now if one is pending. No-op when stopped,
    /// idle, or configured leading-only.
    pub fn flush(&self) {
        let inner = &self.inner;
        let emitted = {
            let mut st = inner.state.lock();
            if st.stopped || !st.pending {
                return;
            }
            st.pending = false;
            st.wait_gen += 1;
            st.max_gen += 1;
            if inner.config.trailing {
                st.last.clone()
            } else {
                None
            }
        };
        if let Some(value) = emitted {
            let _serial = inner.emit_serial.lock();
            (inner.callback)(value);
        }
    }

    /// Stops the debouncer and runs the configured [`StopMode`]: the flush
    /// (when configured and a trailing value is pending) and `on_stop` both
    /// receive the pre-flush, most recently seen value. Idempotent; later
    /// `trigger`/`flush` calls are no-ops.
    pub fn stop(&self) {
        let inner = &self.inner;
        let (flush_value, stop_value) = {
            let mut st = inner.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            let pending = st.pending;
            st.pending = false;
            st.wait_gen += 1;
            st.max_gen += 1;
            let last = st.last.take();

            let should_flush = matches!(
                inner.config.stop_mode,
                StopMode::Flush | StopMode::FlushAndCallback
            ) && pending
                && inner.config.trailing;
            let should_callback = matches!(
                inner.config.stop_mode,
                StopMode::CallbackOnly | StopMode::FlushAndCallback
            ) && inner.config.on_stop.is_some();

            match (should_flush, should_callback) {
                (true, true) => (last.clone(), last),
                (true, false) => (last, None),
                (false, true) => (None, last),
                (false, false) => (None, None),
            }
        };

        let _serial = inner.emit_serial.lock();
        if let Some(value) = flush_value {
            (inner.callback)(value);
        }
        if let Some(value) = stop_value {
            if let Some(on_stop) = &inner.config.on_stop {
                on_stop(value);
            }
        }
    }
}

impl<T: Clone + Send + 'static> DebounceInner<T> {
    fn arm(inner: &Arc<Self>, st: &mut DebounceState<T>, kind: TimerKind, after: Duration) {
        let generation = match kind {
            TimerKind::Wait => {
                st.wait_gen += 1;
                st.wait_gen
            }
            TimerKind::Max => {
                st.max_gen += 1;
                st.max_gen
            }
        };
        let weak = Arc::downgrade(inner);
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(after) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(kind, generation);
                    }
                }
            }
        });
    }

    fn expire(&self, kind: TimerKind, generation: u64) {
        let emitted = {
            let mut st = self.state.lock();
            let live = match kind {
                TimerKind::Wait => st.wait_gen == generation,
                TimerKind::Max => st.max_gen == generation,
            };
            if !live || st.stopped {
                return;
            }
            st.wait_gen += 1;
            st.max_gen += 1;
            let was_pending = st.pending;
            st.pending = false;
            if self.config.trailing && was_pending {
                st.last.clone()
            } else {
                None
            }
        };
        if let Some(value) = emitted {
            let _serial = self.emit_serial.lock();
            (self.callback)(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::{pause, sleep};

    fn capture() -> (
        Arc<Mutex<Vec<&'static str>>>,
        impl Fn(&'static str) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v| sink.lock().push(v))
    }

    #[tokio::test]
    async fn rejects_zero_wait() {
        let err = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::ZERO),
            |_: &'static str| {},
        )
        .err()
        .unwrap();
        assert_eq!(err, ConfigError::NonPositiveWait);
    }

    #[tokio::test]
    async fn trailing_emits_last_value_after_quiet_window() {
        pause();
        let (seen, sink) = capture();
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(30)).trailing(true),
            sink,
        )
        .unwrap();

        deb.trigger("A");
        deb.trigger("B");
        sleep(Duration::from_millis(45)).await;
        assert_eq!(*seen.lock(), ["B"]);

        // Nothing further during a subsequent idle period.
        sleep(Duration::from_millis(60)).await;
        assert_eq!(*seen.lock(), ["B"]);
        deb.stop();
    }

    #[tokio::test]
    async fn defaults_to_trailing_when_both_edges_disabled() {
        pause();
        let (seen, sink) = capture();
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(10))
                .leading(false)
                .trailing(false),
            sink,
        )
        .unwrap();
        deb.trigger("only");
        sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), ["only"]);
    }

    #[tokio::test]
    async fn leading_fires_immediately_and_stop_flushes_with_callback() {
        pause();
        let (seen, sink) = capture();
        let stops = Arc::new(Mutex::new(Vec::new()));
        let stop_sink = Arc::clone(&stops);
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(50))
                .leading(true)
                .trailing(true)
                .with_stop_mode(StopMode::FlushAndCallback)
                .with_on_stop(move |v| stop_sink.lock().push(v)),
            sink,
        )
        .unwrap();

        deb.trigger("X");
        assert_eq!(*seen.lock(), ["X"]);

        deb.trigger("Y");
        deb.trigger("Z");
        deb.stop();
        assert_eq!(*seen.lock(), ["X", "Z"]);
        assert_eq!(*stops.lock(), ["Z"]);
    }

    #[tokio::test]
    async fn stop_callback_only_skips_the_flush() {
        pause();
        let (seen, sink) = capture();
        let stops = Arc::new(Mutex::new(Vec::new()));
        let stop_sink = Arc::clone(&stops);
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(50))
                .trailing(true)
                .with_stop_mode(StopMode::CallbackOnly)
                .with_on_stop(move |v| stop_sink.lock().push(v)),
            sink,
        )
        .unwrap();

        deb.trigger("P");
        deb.trigger("Q");
        deb.stop();
        assert!(seen.lock().is_empty());
        assert_eq!(*stops.lock(), ["Q"]);
    }

    #[tokio::test]
    async fn stop_after_quiet_window_reports_last_seen_value_without_reflushing() {
        pause();
        let (seen, sink) = capture();
        let stops = Arc::new(Mutex::new(Vec::new()));
        let stop_sink = Arc::clone(&stops);
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(10))
                .with_stop_mode(StopMode::FlushAndCallback)
                .with_on_stop(move |v: &'static str| stop_sink.lock().push(v)),
            sink,
        )
        .unwrap();

        deb.trigger("A");
        sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), ["A"]);

        // The burst already emitted, so stop has nothing to flush, but
        // on_stop still reports the last value the instance saw.
        deb.stop();
        assert_eq!(*seen.lock(), ["A"]);
        assert_eq!(*stops.lock(), ["A"]);
    }

    #[tokio::test]
    async fn stop_before_any_trigger_has_no_value_for_on_stop() {
        pause();
        let (seen, sink) = capture();
        let stops = Arc::new(Mutex::new(Vec::new()));
        let stop_sink = Arc::clone(&stops);
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(10))
                .with_stop_mode(StopMode::FlushAndCallback)
                .with_on_stop(move |v: &'static str| stop_sink.lock().push(v)),
            sink,
        )
        .unwrap();

        deb.stop();
        assert!(seen.lock().is_empty());
        assert!(stops.lock().is_empty());
    }

    #[tokio::test]
    async fn flush_forces_trailing_emission_and_clears_pending() {
        pause();
        let (seen, sink) = capture();
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(30)),
            sink,
        )
        .unwrap();

        deb.trigger("A");
        deb.flush();
        assert_eq!(*seen.lock(), ["A"]);

        // Pending is clear: the window elapsing emits nothing more.
        sleep(Duration::from_millis(45)).await;
        assert_eq!(*seen.lock(), ["A"]);

        // Flush with nothing pending is a no-op.
        deb.flush();
        assert_eq!(*seen.lock(), ["A"]);
    }

    #[tokio::test]
    async fn max_wait_bounds_latency_under_steady_triggers() {
        pause();
        let (seen, sink) = capture();
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(50))
                .trailing(true)
                .with_max_wait(Duration::from_millis(100)),
            sink,
        )
        .unwrap();

        // Triggers every 30ms keep resetting the 50ms quiet window; the
        // max-wait bound armed at t=0 forces an emission at t=100.
        let values = ["v0", "v1", "v2", "v3", "v4", "v5"];
        for v in values {
            deb.trigger(v);
            sleep(Duration::from_millis(30)).await;
        }
        // t=180 now: max-wait emitted v3 (the latest value at t=100); v4
        // opened a fresh burst whose quiet window ends at t=200.
        assert_eq!(*seen.lock(), ["v3"]);

        sleep(Duration::from_millis(80)).await;
        assert_eq!(*seen.lock(), ["v3", "v5"]);
        deb.stop();
    }

    #[tokio::test]
    async fn trigger_after_stop_is_ignored() {
        pause();
        let (seen, sink) = capture();
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(10)),
            sink,
        )
        .unwrap();
        deb.stop();
        deb.trigger("late");
        deb.flush();
        sleep(Duration::from_millis(30)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_silent() {
        pause();
        let (seen, sink) = capture();
        let stops = Arc::new(Mutex::new(Vec::new()));
        let stop_sink = Arc::clone(&stops);
        let cancel = CancellationToken::new();
        let deb = Debouncer::new(
            cancel.clone(),
            DebounceConfig::new(Duration::from_millis(30))
                .with_stop_mode(StopMode::FlushAndCallback)
                .with_on_stop(move |v: &'static str| stop_sink.lock().push(v)),
            sink,
        )
        .unwrap();

        deb.trigger("A");
        cancel.cancel();
        sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().is_empty());
        assert!(stops.lock().is_empty());
    }

    #[tokio::test]
    async fn reentrant_trigger_from_callback_does_not_deadlock() {
        pause();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Debouncer<u32>>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let reenter = Arc::clone(&slot);
        let deb = Debouncer::new(
            CancellationToken::new(),
            DebounceConfig::new(Duration::from_millis(10)),
            move |v: u32| {
                sink.lock().push(v);
                if v == 1 {
                    if let Some(deb) = reenter.lock().as_ref() {
                        deb.trigger(2);
                    }
                }
            },
        )
        .unwrap();
        *slot.lock() = Some(deb.clone());

        deb.trigger(1);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), [1, 2]);
    }
}
