// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Sliding-window accumulation for a single logical stream.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::debounce::Callback;
use crate::error::ConfigError;
use crate::StopMode;

pub(crate) type Fold<T> = Arc<dyn Fn(T, T) -> T + Send + Sync>;

/// Configuration for [`Coalescer`].
pub struct CoalesceConfig<T> {
    pub(crate) window: Duration,
    pub(crate) stop_mode: StopMode,
    pub(crate) on_stop: Option<Callback<T>>,
}

impl<T> CoalesceConfig<T> {
    /// The accumulator is emitted once no `add` has arrived for `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            stop_mode: StopMode::Noop,
            on_stop: None,
        }
    }

    pub fn with_stop_mode(mut self, stop_mode: StopMode) -> Self {
        self.stop_mode = stop_mode;
        self
    }

    /// Callback handed the most recent accumulator when the stop mode asks
    /// for it — the pre-flush value while a window is open, or the
    /// already-emitted one when the last window closed naturally. Skipped
    /// only by an instance that never saw a value.
    pub fn with_on_stop(mut self, on_stop: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(on_stop));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.window == Duration::ZERO {
            return Err(ConfigError::NonPositiveWindow);
        }
        Ok(())
    }
}

/// Folds values arriving inside a sliding window into one accumulator,
/// emitted at window close.
///
/// The window **resets on every `add`**: a stream of additions arriving
/// faster than the window defers emission indefinitely, until `flush` or
/// `stop`. That is the intended contract; a fixed-window variant is a
/// different tool.
///
/// `fold` must be pure and must not touch this instance (it runs under the
/// state lock). `emit` and `on_stop` run outside the lock and are serialized
/// per instance.
pub struct Coalescer<T> {
    inner: Arc<CoalesceInner<T>>,
}

impl<T> Clone for Coalescer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CoalesceInner<T> {
    config: CoalesceConfig<T>,
    fold: Fold<T>,
    emit: Callback<T>,
    cancel: CancellationToken,
    state: Mutex<CoalesceState<T>>,
    emit_serial: ReentrantMutex<()>,
}

struct CoalesceState<T> {
    // Most recent accumulator. Retained after emissions clear `has_acc` so
    // stop can still report it; None only before the first add.
    acc: Option<T>,
    // An open window exists iff true; the next add seeds a fresh
    // accumulator when false.
    has_acc: bool,
    stopped: bool,
    timer_gen: u64,
}

impl<T: Clone + Send + 'static> Coalescer<T> {
    /// Must be called from within a Tokio runtime; the window timer is
    /// spawned lazily and exits when `cancel` fires.
    pub fn new(
        cancel: CancellationToken,
        config: CoalesceConfig<T>,
        fold: impl Fn(T, T) -> T + Send + Sync + 'static,
        emit: impl Fn(T) + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(
            cancel,
            config,
            Arc::new(fold),
            Arc::new(emit),
        ))
    }

    pub(crate) fn from_validated(
        cancel: CancellationToken,
        config: CoalesceConfig<T>,
        fold: Fold<T>,
        emit: Callback<T>,
    ) -> Self {
        Self {
            inner: Arc::new(CoalesceInner {
                config,
                fold,
                emit,
                cancel,
                state: Mutex::new(CoalesceState {
                    acc: None,
                    has_acc: false,
                    stopped: false,
                    timer_gen: 0,
                }),
                emit_serial: ReentrantMutex::new(()),
            }),
        }
    }

    /// Folds `value` into the accumulator (or seeds it) and resets the
    /// window. No-op once stopped.
    pub fn add(&self, value: T) {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.stopped {
            return;
        }
        let next = match (st.has_acc, st.acc.take()) {
            (true, Some(acc)) => (inner.fold)(acc, value),
            _ => value,
        };
        st.acc = Some(next);
        st.has_acc = true;
        CoalesceInner::arm(inner, &mut st);
    }

    /// Emits the accumulator now, if a window is open. No-op when stopped or
    /// empty.
    pub fn flush(&self) {
        let inner = &self.inner;
        let emitted = {
            let mut st = inner.state.lock();
            if st.stopped || !st.has_acc {
                return;
            }
            st.has_acc = false;
            st.timer_gen += 1;
            st.acc.clone()
        };
        if let Some(acc) = emitted {
            let _serial = inner.emit_serial.lock();
            (inner.emit)(acc);
        }
    }

    /// Stops the coalescer and runs the configured [`StopMode`]: the flush
    /// (when configured and a window is open) and `on_stop` both receive the
    /// pre-flush, most recent accumulator. Idempotent; later `add`/`flush`
    /// calls are no-ops.
    pub fn stop(&self) {
        let inner = &self.inner;
        let (flush_acc, stop_acc) = {
            let mut st = inner.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.timer_gen += 1;
            let has_acc = st.has_acc;
            st.has_acc = false;
            let acc = st.acc.take();

            let should_flush = matches!(
                inner.config.stop_mode,
                StopMode::Flush | StopMode::FlushAndCallback
            ) && has_acc;
            let should_callback = matches!(
                inner.config.stop_mode,
                StopMode::CallbackOnly | StopMode::FlushAndCallback
            ) && inner.config.on_stop.is_some();

            match (should_flush, should_callback) {
                (true, true) => (acc.clone(), acc),
                (true, false) => (acc, None),
                (false, true) => (None, acc),
                (false, false) => (None, None),
            }
        };

        let _serial = inner.emit_serial.lock();
        if let Some(acc) = flush_acc {
            (inner.emit)(acc);
        }
        if let Some(acc) = stop_acc {
            if let Some(on_stop) = &inner.config.on_stop {
                on_stop(acc);
            }
        }
    }
}

impl<T: Clone + Send + 'static> CoalesceInner<T> {
    fn arm(inner: &Arc<Self>, st: &mut CoalesceState<T>) {
        st.timer_gen += 1;
        let generation = st.timer_gen;
        let weak = Arc::downgrade(inner);
        let cancel = inner.cancel.clone();
        let window = inner.config.window;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(window) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(generation);
                    }
                }
            }
        });
    }

    fn expire(&self, generation: u64) {
        let emitted = {
            let mut st = self.state.lock();
            if st.timer_gen != generation || st.stopped {
                return;
            }
            st.timer_gen += 1;
            if st.has_acc {
                st.has_acc = false;
                st.acc.clone()
            } else {
                None
            }
        };
        if let Some(acc) = emitted {
            let _serial = self.emit_serial.lock();
            (self.emit)(acc);
        }
    }
}
