// Asynchronous typed pub/sub connecting the audio components to their
// collaborators.
//
// Publishing enqueues onto a bounded queue drained by a single dispatch
// thread; at capacity the oldest event is dropped. Listener invocation
// order is global listeners first, then kind-specific, each in
// registration order, so a single publisher observes its events delivered
// in publish order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use colored::Colorize;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audio::denoiser::DenoiserConfig;

/// Every event category the pipeline publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    DeviceListChanged,
    DeviceSelected,
    DeviceError,
    AudioLevelInput,
    AudioLevelOutput,
    ProcessingStarted,
    ProcessingStopped,
    NoiseReductionChanged,
    RouterConnected,
    RouterDisconnected,
    ConfigChanged,
    Fatal,
}

/// Typed payload attached to an [`Event`].
#[derive(Debug, Clone)]
pub enum EventPayload {
    None,
    /// Smoothed level in [0, 1].
    Level(f32),
    Device {
        id: String,
        name: String,
    },
    Error {
        message: String,
    },
    NoiseReduction(DenoiserConfig),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: EventPayload,
    pub timestamp: Instant,
}

impl Event {
    fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self {
            kind,
            payload,
            timestamp: Instant::now(),
        }
    }
}

/// Opaque subscription handle returned by `subscribe`/`subscribe_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Queue depth before drop-oldest kicks in.
    pub max_queue: usize,
    /// Budget for a single listener invocation before it is counted as a
    /// timeout.
    pub delivery_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_queue: 256,
            delivery_timeout: Duration::from_millis(100),
        }
    }
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventBusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub listener_timeouts: u64,
    pub active_listeners: usize,
    pub ema_delivery_ms: f64,
    pub queue_len: usize,
}

#[derive(Default)]
struct ListenerRegistry {
    global: Vec<(u64, Listener)>,
    by_kind: HashMap<EventKind, Vec<(u64, Listener)>>,
    next_handle: u64,
}

impl ListenerRegistry {
    fn len(&self) -> usize {
        self.global.len() + self.by_kind.values().map(Vec::len).sum::<usize>()
    }
}

struct BusShared {
    queue: Mutex<VecDeque<Event>>,
    queue_cv: Condvar,
    listeners: Mutex<ListenerRegistry>,
    filtered: Mutex<HashSet<EventKind>>,
    running: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    listener_timeouts: AtomicU64,
    ema_delivery_ms: Mutex<f64>,
    config: EventBusConfig,
}

/// Asynchronous event bus with a bounded queue and per-kind filters.
pub struct EventBus {
    shared: Arc<BusShared>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            shared: Arc::new(BusShared {
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                listeners: Mutex::new(ListenerRegistry::default()),
                filtered: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                listener_timeouts: AtomicU64::new(0),
                ema_delivery_ms: Mutex::new(0.0),
                config,
            }),
            dispatch: Mutex::new(None),
        }
    }

    /// Start the dispatch thread. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("quiet-event-dispatch".to_string())
            .spawn(move || dispatch_loop(shared))
            .ok();

        *self.dispatch.lock() = handle;
        info!("{} event dispatch thread started", "EVENT_BUS".bright_cyan());
    }

    /// Stop the dispatch thread and discard pending events. Idempotent;
    /// joins the dispatcher before returning.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shared.queue_cv.notify_all();
        if let Some(handle) = self.dispatch.lock().take() {
            let _ = handle.join();
        }

        let discarded = {
            let mut queue = self.shared.queue.lock();
            let n = queue.len();
            queue.clear();
            n as u64
        };
        if discarded > 0 {
            self.shared.dropped.fetch_add(discarded, Ordering::Relaxed);
        }
        info!(
            "{} event dispatch thread stopped ({} pending discarded)",
            "EVENT_BUS".bright_cyan(),
            discarded
        );
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Enqueue an event for asynchronous delivery. At capacity the oldest
    /// queued event is dropped to make room.
    pub fn publish(&self, kind: EventKind, payload: EventPayload) {
        if self.shared.filtered.lock().contains(&kind) {
            return;
        }

        self.shared.published.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.config.max_queue {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(Event::new(kind, payload));
        }
        self.shared.queue_cv.notify_one();
    }

    /// Deliver an event inline on the calling thread, bypassing the queue.
    pub fn publish_immediate(&self, kind: EventKind, payload: EventPayload) {
        if self.shared.filtered.lock().contains(&kind) {
            return;
        }
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        let event = Event::new(kind, payload);
        deliver(&self.shared, &event);
    }

    /// Subscribe to a single event kind.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.shared.listeners.lock();
        registry.next_handle += 1;
        let handle = registry.next_handle;
        registry
            .by_kind
            .entry(kind)
            .or_default()
            .push((handle, Arc::new(listener)));
        ListenerHandle(handle)
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.shared.listeners.lock();
        registry.next_handle += 1;
        let handle = registry.next_handle;
        registry.global.push((handle, Arc::new(listener)));
        ListenerHandle(handle)
    }

    /// Remove a subscription. Returns whether the handle was known.
    pub fn unsubscribe(&self, handle: ListenerHandle) -> bool {
        let mut registry = self.shared.listeners.lock();
        let before = registry.len();
        registry.global.retain(|(id, _)| *id != handle.0);
        for listeners in registry.by_kind.values_mut() {
            listeners.retain(|(id, _)| *id != handle.0);
        }
        registry.len() != before
    }

    /// Enable or disable a kind. Filtered kinds are rejected at publish
    /// time.
    pub fn set_filter(&self, kind: EventKind, enabled: bool) {
        let mut filtered = self.shared.filtered.lock();
        if enabled {
            filtered.remove(&kind);
        } else {
            filtered.insert(kind);
        }
    }

    pub fn stats(&self) -> EventBusStats {
        let active_listeners = self.shared.listeners.lock().len();

        EventBusStats {
            published: self.shared.published.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            listener_timeouts: self.shared.listener_timeouts.load(Ordering::Relaxed),
            active_listeners,
            ema_delivery_ms: *self.shared.ema_delivery_ms.lock(),
            queue_len: self.shared.queue.lock().len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(shared: Arc<BusShared>) {
    loop {
        let event = {
            let mut queue = shared.queue.lock();
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(event) = queue.pop_front() {
                    break event;
                }
                shared.queue_cv.wait(&mut queue);
            }
        };

        let started = Instant::now();
        deliver(&shared, &event);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut ema = shared.ema_delivery_ms.lock();
        *ema = 0.1 * elapsed_ms + 0.9 * *ema;
    }
}

/// Invoke every matching listener sequentially: global first, then
/// kind-specific, each in registration order. A panic is caught and an
/// over-budget invocation is logged and counted; neither aborts the
/// remaining listeners.
fn deliver(shared: &Arc<BusShared>, event: &Event) {
    let matching: Vec<Listener> = {
        let registry = shared.listeners.lock();
        registry
            .global
            .iter()
            .map(|(_, l)| l.clone())
            .chain(
                registry
                    .by_kind
                    .get(&event.kind)
                    .into_iter()
                    .flat_map(|listeners| listeners.iter().map(|(_, l)| l.clone())),
            )
            .collect()
    };

    for listener in matching {
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| listener(event)));
        if result.is_err() {
            warn!(
                "{} listener panicked while handling {:?}",
                "EVENT_BUS".bright_red(),
                event.kind
            );
        }
        if started.elapsed() > shared.config.delivery_timeout {
            shared.listener_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} listener for {:?} exceeded the {}ms delivery budget",
                "EVENT_BUS".bright_yellow(),
                event.kind,
                shared.config.delivery_timeout.as_millis()
            );
        }
    }

    shared.delivered.fetch_add(1, Ordering::Relaxed);
}
