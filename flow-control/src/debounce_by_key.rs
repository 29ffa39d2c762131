// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Keyed fan-out of independent debouncers with idle eviction.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::debounce::{Callback, DebounceConfig, Debouncer};
use crate::error::ConfigError;
use crate::StopMode;

pub(crate) type KeyedCallback<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

/// Configuration for [`DebouncerByKey`].
pub struct DebounceKeyConfig<K, V> {
    wait: Duration,
    leading: bool,
    trailing: bool,
    max_wait: Option<Duration>,
    idle_ttl: Option<Duration>,
    stop_mode: StopMode,
    on_stop: Option<KeyedCallback<K, V>>,
}

impl<K, V> DebounceKeyConfig<K, V> {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            leading: false,
            trailing: false,
            max_wait: None,
            idle_ttl: None,
            stop_mode: StopMode::Noop,
            on_stop: None,
        }
    }

    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
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

    /// Per-key stop callback; receives `(key, value)` where the value is the
    /// most recent one the key's debouncer saw, pending or already emitted.
    pub fn with_on_stop(mut self, on_stop: impl Fn(K, V) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(on_stop));
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.wait == Duration::ZERO {
            return Err(ConfigError::NonPositiveWait);
        }
        if self.max_wait == Some(Duration::ZERO) {
            return Err(ConfigError::NonPositiveMaxWait);
        }
        if self.idle_ttl == Some(Duration::ZERO) {
            return Err(ConfigError::NonPositiveIdleTtl);
        }
        Ok(())
    }
}

/// Per-key [`Debouncer`] fan-out.
///
/// Children are created lazily on first trigger and their callbacks carry the
/// key. Callbacks for one key are serialized; callbacks across keys may run
/// concurrently.
///
/// When `idle_ttl` is set, a key idle for longer than the TTL has its child
/// **stopped with the configured stop mode** and is removed. A burst whose
/// quiet window has not yet elapsed at eviction time therefore has its
/// pending value flushed, dropped, or handed to `on_stop` according to that
/// mode — pick the stop mode with eviction in mind.
pub struct DebouncerByKey<K, V> {
    inner: Arc<DebounceByKeyInner<K, V>>,
}

impl<K, V> Clone for DebouncerByKey<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DebounceByKeyInner<K, V> {
    config: DebounceKeyConfig<K, V>,
    callback: KeyedCallback<K, V>,
    cancel: CancellationToken,
    state: Mutex<DebounceByKeyState<K, V>>,
}

struct DebounceByKeyState<K, V> {
    nodes: HashMap<K, DebounceNode<V>>,
    stopped: bool,
}

struct DebounceNode<V> {
    child: Debouncer<V>,
    last_touched: Instant,
}

impl<K, V> DebouncerByKey<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Must be called from within a Tokio runtime. The eviction task (when
    /// `idle_ttl` is set) exits when `cancel` fires or the manager stops.
    pub fn new(
        cancel: CancellationToken,
        mut config: DebounceKeyConfig<K, V>,
        callback: impl Fn(K, V) + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if !config.leading && !config.trailing {
            config.trailing = true;
        }
        let idle_ttl = config.idle_ttl;
        let inner = Arc::new(DebounceByKeyInner {
            config,
            callback: Arc::new(callback),
            cancel,
            state: Mutex::new(DebounceByKeyState {
                nodes: HashMap::new(),
                stopped: false,
            }),
        });
        if let Some(ttl) = idle_ttl {
            DebounceByKeyInner::spawn_evictor(&inner, ttl);
        }
        Ok(Self { inner })
    }

    /// Forwards `value` to the key's debouncer, creating it on first use and
    /// refreshing the key's idle clock. No-op once the manager is stopped.
    pub fn trigger(&self, key: K, value: V) {
        let child = {
            let mut st = self.inner.state.lock();
            if st.stopped {
                return;
            }
            let node = st
                .nodes
                .entry(key.clone())
                .or_insert_with(|| DebounceNode {
                    child: self.inner.child_for(&key),
                    last_touched: Instant::now(),
                });
            node.last_touched = Instant::now();
            node.child.clone()
        };
        child.trigger(value);
    }

    /// Flushes one key's pending value, if any. Missing keys are no-ops.
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

impl<K, V> DebounceByKeyInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    fn child_for(&self, key: &K) -> Debouncer<V> {
        let forward: Callback<V> = {
            let callback = Arc::clone(&self.callback);
            let key = key.clone();
            Arc::new(move |value| callback(key.clone(), value))
        };
        let on_stop = self.config.on_stop.clone().map(|on_stop| {
            let key = key.clone();
            let wrapped: Callback<V> = Arc::new(move |value| on_stop(key.clone(), value));
            wrapped
        });
        let config = DebounceConfig {
            wait: self.config.wait,
            leading: self.config.leading,
            trailing: self.config.trailing,
            max_wait: self.config.max_wait,
            stop_mode: self.config.stop_mode,
            on_stop,
        };
        Debouncer::from_validated(self.cancel.clone(), config, forward)
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
            debug!("debounce evictor exiting");
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
            debug!("evicting {} idle debounced key(s)", expired.len());
        }
        for child in expired {
            child.stop();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::{pause, sleep};

    type Seen = Arc<Mutex<Vec<(String, &'static str)>>>;

    fn capture() -> (Seen, impl Fn(String, &'static str) + Send + Sync + 'static) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |k, v| sink.lock().push((k, v)))
    }

    #[tokio::test]
    async fn per_key_trailing_emits_latest_value() {
        pause();
        let (seen, sink) = capture();
        let deb = DebouncerByKey::new(
            CancellationToken::new(),
            DebounceKeyConfig::new(Duration::from_millis(30)).trailing(true),
            sink,
        )
        .unwrap();

        deb.trigger("alice".to_string(), "A1");
        deb.trigger("alice".to_string(), "A2");
        deb.trigger("bob".to_string(), "B1");
        sleep(Duration::from_millis(45)).await;

        let got = seen.lock().clone();
        assert!(got.contains(&("alice".to_string(), "A2")));
        assert!(got.contains(&("bob".to_string(), "B1")));
        assert_eq!(got.len(), 2);
        deb.stop();
    }

    #[tokio::test]
    async fn idle_key_is_evicted_and_child_stopped_with_stop_mode() {
        pause();
        let (seen, sink) = capture();
        let stops: Seen = Arc::new(Mutex::new(Vec::new()));
        let stop_sink = Arc::clone(&stops);
        let deb = DebouncerByKey::new(
            CancellationToken::new(),
            DebounceKeyConfig::new(Duration::from_millis(100))
                .trailing(true)
                .with_idle_ttl(Duration::from_millis(40))
                .with_stop_mode(StopMode::FlushAndCallback)
                .with_on_stop(move |k, v| stop_sink.lock().push((k, v))),
            sink,
        )
        .unwrap();

        // The quiet window (100ms) outlives the idle TTL, so eviction stops
        // the child while its value is still pending; FlushAndCallback
        // flushes it on the way out.
        deb.trigger("bob".to_string(), "B1");
        sleep(Duration::from_millis(90)).await;
        assert_eq!(*seen.lock(), [("bob".to_string(), "B1")]);
        assert_eq!(*stops.lock(), [("bob".to_string(), "B1")]);

        // The overall stop finds no children left.
        deb.stop();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(stops.lock().len(), 1);
    }

    #[tokio::test]
    async fn touched_keys_survive_eviction_passes() {
        pause();
        let (seen, sink) = capture();
        let deb = DebouncerByKey::new(
            CancellationToken::new(),
            DebounceKeyConfig::new(Duration::from_millis(10))
                .with_idle_ttl(Duration::from_millis(50)),
            sink,
        )
        .unwrap();

        // Keep alice warm across several eviction ticks.
        for _ in 0..6 {
            deb.trigger("alice".to_string(), "hot");
            sleep(Duration::from_millis(30)).await;
        }
        deb.trigger("alice".to_string(), "final");
        sleep(Duration::from_millis(20)).await;
        assert!(seen
            .lock()
            .iter()
            .any(|(k, v)| k == "alice" && *v == "final"));
        deb.stop();
    }

    #[tokio::test]
    async fn flush_key_and_flush_all() {
        pause();
        let (seen, sink) = capture();
        let deb = DebouncerByKey::new(
            CancellationToken::new(),
            DebounceKeyConfig::new(Duration::from_secs(60)),
            sink,
        )
        .unwrap();

        deb.trigger("a".to_string(), "1");
        deb.trigger("b".to_string(), "2");

        deb.flush_key(&"a".to_string());
        assert_eq!(*seen.lock(), [("a".to_string(), "1")]);

        // Missing key is a no-op.
        deb.flush_key(&"nope".to_string());

        deb.flush_all();
        let got = seen.lock().clone();
        assert!(got.contains(&("b".to_string(), "2")));
        assert_eq!(got.len(), 2);
        deb.stop();
    }

    #[tokio::test]
    async fn stop_runs_each_child_stop_mode_and_ignores_later_triggers() {
        pause();
        let (seen, sink) = capture();
        let stops: Seen = Arc::new(Mutex::new(Vec::new()));
        let stop_sink = Arc::clone(&stops);
        let deb = DebouncerByKey::new(
            CancellationToken::new(),
            DebounceKeyConfig::new(Duration::from_secs(60))
                .trailing(true)
                .with_stop_mode(StopMode::CallbackOnly)
                .with_on_stop(move |k, v| stop_sink.lock().push((k, v))),
            sink,
        )
        .unwrap();

        deb.trigger("x".to_string(), "pending");
        deb.stop();
        deb.stop();
        assert!(seen.lock().is_empty());
        assert_eq!(*stops.lock(), [("x".to_string(), "pending")]);

        deb.trigger("x".to_string(), "late");
        sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().is_empty());
    }
}
