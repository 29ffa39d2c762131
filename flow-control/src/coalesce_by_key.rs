// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Keyed fan-out of independent coalescers with idle eviction.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::coalesce::{CoalesceConfig, Coalescer, Fold};
use crate::debounce::Callback;
use crate::debounce_by_key::KeyedCallback;
use crate::error::ConfigError;
use crate::StopMode;

/// Configuration for [`CoalescerByKey`].
pub struct CoalesceKeyConfig<K, V> {
    window: Duration,
    idle_ttl: Option<Duration>,
    stop_mode: StopMode,
    on_stop: Option<KeyedCallback<K, V>>,
}

impl<K, V> CoalesceKeyConfig<K, V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            idle_ttl: None,
            stop_mode: StopMode::Noop,
            on_stop: None,
        }
    }

    /// Keys untouched for longer than `idle_ttl` are evicted by a background
    /// task ticking at the same period.
    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = Some(idle_ttl);
        self
    }

    pub fn with_stop_mode(mut self, stop_mode: StopMode) -> Self {
        self.stop_mode = stop_mode;
        self
    }

    /// Per-key stop callback; receives `(key, accumulator)` where the
    /// accumulator is the most recent one the key's coalescer built, whether
    /// its window is still open or already emitted.
    pub fn with_on_stop(mut self, on_stop: impl Fn(K, V) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(on_stop));
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.window == Duration::ZERO {
            return Err(ConfigError::NonPositiveWindow);
        }
        if self.idle_ttl == Some(Duration::ZERO) {
            return Err(ConfigError::NonPositiveIdleTtl);
        }
        Ok(())
    }
}

/// Per-key [`Coalescer`] fan-out sharing one fold function.
///
/// As with [`DebouncerByKey`](crate::DebouncerByKey), an idle-evicted child
/// is **stopped with the configured stop mode**, so an accumulator whose
/// window has not yet closed at eviction time is flushed, dropped, or handed
/// to `on_stop` according to that mode.
pub struct CoalescerByKey<K, V> {
    inner: Arc<CoalesceByKeyInner<K, V>>,
}

impl<K, V> Clone for CoalescerByKey<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CoalesceByKeyInner<K, V> {
    config: CoalesceKeyConfig<K, V>,
    fold: Fold<V>,
    emit: KeyedCallback<K, V>,
    cancel: CancellationToken,
    state: Mutex<CoalesceByKeyState<K, V>>,
}

struct CoalesceByKeyState<K, V> {
    nodes: HashMap<K, CoalesceNode<V>>,
    stopped: bool,
}

struct CoalesceNode<V> {
    child: Coalescer<V>,
    last_touched: Instant,
}

impl<K, V> CoalescerByKey<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Must be called from within a Tokio runtime. The eviction task (when
    /// `idle_ttl` is set) exits when `cancel` fires or the manager stops.
    pub fn new(
        cancel: CancellationToken,
        config: CoalesceKeyConfig<K, V>,
        fold: impl Fn(V, V) -> V + Send + Sync + 'static,
        emit: impl Fn(K, V) + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let idle_ttl = config.idle_ttl;
        let inner = Arc::new(CoalesceByKeyInner {
            config,
            fold: Arc::new(fold),
            emit: Arc::new(emit),
            cancel,
            state: Mutex::new(CoalesceByKeyState {
                nodes: HashMap::new(),
                stopped: false,
            }),
        });
        if let Some(ttl) = idle_ttl {
            CoalesceByKeyInner::spawn_evictor(&inner, ttl);
        }
        Ok(Self { inner })
    }

    /// Folds `value` into the key's accumulator, creating the child on first
    /// use and refreshing the key's idle clock. No-op once stopped.
    pub fn add(&self, key: K, value: V) {
        let child = {
            let mut st = self.inner.state.lock();
            if st.stopped {
                return;
            }
            let node = st
                .nodes
                .entry(key.clone())
                .or_insert_with(|| CoalesceNode {
                    child: self.inner.child_for(&key),
                    last_touched: Instant::now(),
                });
            node.last_touched = Instant::now();
            node.child.clone()
        };
        child.add(value);
    }

    /// Flushes one key's accumulator, if any. Missing keys are no-ops.
    pub fn flush_key(&self, key: &K) {
        let child = self
            .inner
            .state
            .lock()
            .nodes
            .get(key)
            .map(|node| node.child.clone());
        if let Some(child) = child {
            child.flush();
        }
    }

    /// Flushes every live key.
    pub fn flush_all(&self) {
        let children: Vec<_> = self
            .inner
            .state
            .lock()
            .nodes
            .values()
            .map(|node| node.child.clone())
            .collect();
        for child in children {
            child.flush();
        }
    }

    /// Stops every child (each runs its own configured stop mode) and
    /// releases them. Idempotent.
    pub fn stop(&self) {
        let children: Vec<_> = {
            let mut st = self.inner.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.nodes.drain().map(|(_, node)| node.child).collect()
        };
        for child in children {
            child.stop();
        }
    }
}

impl<K, V> CoalesceByKeyInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    fn child_for(&self, key: &K) -> Coalescer<V> {
        let forward: Callback<V> = {
            let emit = Arc::clone(&self.emit);
            let key = key.clone();
            Arc::new(move |acc| emit(key.clone(), acc))
        };
        let on_stop = self.config.on_stop.clone().map(|on_stop| {
            let key = key.clone();
            let wrapped: Callback<V> = Arc::new(move |acc| on_stop(key.clone(), acc));
            wrapped
        });
        let config = CoalesceConfig {
            window: self.config.window,
            stop_mode: self.config.stop_mode,
            on_stop,
        };
        Coalescer::from_validated(self.cancel.clone(), config, Arc::clone(&self.fold), forward)
    }

    fn spawn_evictor(inner: &Arc<Self>, ttl: Duration) {
        let weak = Arc::downgrade(inner);
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + ttl, ttl);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                if !inner.evict_idle(ttl) {
                    break;
                }
            }
            debug!("coalesce evictor exiting");
        });
    }

    // Returns false once the manager is stopped.
    fn evict_idle(&self, ttl: Duration) -> bool {
        let Some(cutoff) = Instant::now().checked_sub(ttl) else {
            return true;
        };
        let mut expired = Vec::new();
        {
            let mut st = self.state.lock();
            if st.stopped {
                return false;
            }
            let cold: Vec<K> = st
                .nodes
                .iter()
                .filter(|(_, node)| node.last_touched < cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            for key in cold {
                if let Some(node) = st.nodes.remove(&key) {
                    expired.push(node.child);
                }
            }
        }
        if !expired.is_empty() {
            debug!("evicting {} idle coalesced key(s)", expired.len());
        }
        for child in expired {
            child.stop();
        }
        true
    }
}
