//! Timer Subsystem
//!
//! Millisecond countdown timers driven by an external tick source. The manager
//! performs no sleeping or clock reads; every call to [`TimerManager::on_tick`]
//! advances all registered timers by one millisecond.

use interfaces::LayerMessage;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::{lock, LayerError};

/// Opaque timer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u32);

impl TimerId {
    /// Reserved value meaning "no timer"
    pub const INVALID: TimerId = TimerId(u32::MAX);

    /// Whether this id can refer to a registered timer
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expiry callback, invoked at most once with the id of the expired timer
pub type TimerCallback = Box<dyn FnOnce(TimerId) + Send>;

/// A single countdown timer
pub struct Timer {
    id: TimerId,
    expiry_ms: u32,
    elapsed_ms: u32,
    callback: Option<TimerCallback>,
}

impl Timer {
    fn new(id: TimerId, expiry_ms: u32, callback: TimerCallback) -> Self {
        Self {
            id,
            expiry_ms,
            elapsed_ms: 0,
            callback: Some(callback),
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn expiry_ms(&self) -> u32 {
        self.expiry_ms
    }

    pub fn elapsed_ms(&self) -> u32 {
        self.elapsed_ms
    }

    /// Advance by one millisecond
    pub fn increment(&mut self) {
        self.elapsed_ms = self.elapsed_ms.saturating_add(1);
    }

    /// Restart the countdown
    pub fn reset(&mut self) {
        self.elapsed_ms = 0;
    }

    /// A timer of N ms expires on the (N+1)th tick
    pub fn expired(&self) -> bool {
        self.elapsed_ms > self.expiry_ms
    }

    fn fire(mut self) {
        if self.expired() {
            if let Some(callback) = self.callback.take() {
                callback(self.id);
            }
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("expiry_ms", &self.expiry_ms)
            .field("elapsed_ms", &self.elapsed_ms)
            .finish()
    }
}

struct Registry {
    timers: BTreeMap<TimerId, Timer>,
    next_id: u32,
}

impl Registry {
    fn allocate_id(&mut self) -> TimerId {
        while TimerId(self.next_id) == TimerId::INVALID
            || self.timers.contains_key(&TimerId(self.next_id))
        {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

/// Registry of active timers
pub struct TimerManager {
    registry: Mutex<Registry>,
}

impl TimerManager {
    /// Create an empty timer manager
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                timers: BTreeMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Register a timer that fires `callback` once `duration_ms` ticks have passed
    pub fn start_timer<F>(&self, duration_ms: u32, callback: F) -> TimerId
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.allocate_id();
        registry
            .timers
            .insert(id, Timer::new(id, duration_ms, Box::new(callback)));
        trace!("Started timer {} for {} ms", id, duration_ms);
        id
    }

    /// Remove a timer without firing it
    pub fn stop_timer(&self, id: TimerId) -> Result<(), LayerError> {
        match lock(&self.registry).timers.remove(&id) {
            Some(_) => {
                trace!("Stopped timer {}", id);
                Ok(())
            }
            None => Err(LayerError::TimerNotFound),
        }
    }

    /// Restart a timer's countdown from zero
    pub fn reset_timer(&self, id: TimerId) -> Result<(), LayerError> {
        match lock(&self.registry).timers.get_mut(&id) {
            Some(timer) => {
                timer.reset();
                Ok(())
            }
            None => Err(LayerError::TimerNotFound),
        }
    }

    /// Advance every timer by one millisecond and fire the expired ones
    ///
    /// Callbacks run without the registry lock held, so they may start or
    /// stop timers themselves.
    pub fn on_tick(&self) {
        let expired: Vec<TimerId> = {
            let mut registry = lock(&self.registry);
            for timer in registry.timers.values_mut() {
                timer.increment();
            }
            registry
                .timers
                .values()
                .filter(|timer| timer.expired())
                .map(|timer| timer.id)
                .collect()
        };

        for id in expired {
            // A callback fired earlier in this tick may have stopped or reset it
            let timer = lock(&self.registry).timers.remove(&id);
            match timer {
                Some(timer) if timer.expired() => {
                    debug!("Timer {} expired after {} ms", id, timer.expiry_ms);
                    timer.fire();
                }
                Some(timer) => {
                    lock(&self.registry).timers.insert(id, timer);
                }
                None => {}
            }
        }
    }

    /// Dispatch a message from the tick source
    pub fn handle_msg(&self, msg: &LayerMessage) {
        match msg {
            LayerMessage::TimerTick => self.on_tick(),
            other => warn!("Timer manager received unexpected message {:?}", other),
        }
    }

    /// Whether a timer with this id is registered
    pub fn is_running(&self, id: TimerId) -> bool {
        lock(&self.registry).timers.contains_key(&id)
    }

    /// Milliseconds elapsed on a registered timer
    #[cfg(test)]
    fn elapsed_ms(&self, id: TimerId) -> Option<u32> {
        lock(&self.registry).timers.get(&id).map(Timer::elapsed_ms)
    }

    /// Number of registered timers
    pub fn active_timers(&self) -> usize {
        lock(&self.registry).timers.len()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(TimerId) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        (count, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_timer_fires_on_tick_after_duration() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        let id = mgr.start_timer(3, cb);

        for _ in 0..3 {
            mgr.on_tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(mgr.is_running(id));

        mgr.on_tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!mgr.is_running(id));

        mgr.on_tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_timer() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        let id = mgr.start_timer(1, cb);

        assert!(mgr.stop_timer(id).is_ok());
        assert_eq!(mgr.stop_timer(id), Err(LayerError::TimerNotFound));

        for _ in 0..5 {
            mgr.on_tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_timer() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        let id = mgr.start_timer(2, cb);

        mgr.on_tick();
        mgr.on_tick();
        assert_eq!(mgr.elapsed_ms(id), Some(2));
        mgr.reset_timer(id).unwrap();
        assert_eq!(mgr.elapsed_ms(id), Some(0));

        mgr.on_tick();
        mgr.on_tick();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        mgr.on_tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert_eq!(mgr.reset_timer(TimerId(12345)), Err(LayerError::TimerNotFound));
    }

    #[test]
    fn test_ids_skip_invalid_and_in_use() {
        let mgr = TimerManager::new();
        lock(&mgr.registry).next_id = u32::MAX - 1;

        let a = mgr.start_timer(10, |_| {});
        let b = mgr.start_timer(10, |_| {});
        assert_eq!(a, TimerId(u32::MAX - 1));
        assert_eq!(b, TimerId(0));

        lock(&mgr.registry).next_id = u32::MAX - 1;
        let c = mgr.start_timer(10, |_| {});
        assert_eq!(c, TimerId(1));
        assert_eq!(mgr.active_timers(), 3);
    }

    #[test]
    fn test_callback_can_restart_timer() {
        let mgr = Arc::new(TimerManager::new());
        let (count, cb) = counter();
        let inner_mgr = mgr.clone();

        mgr.start_timer(0, move |_| {
            inner_mgr.start_timer(0, cb);
        });

        mgr.on_tick();
        assert_eq!(mgr.active_timers(), 1);
        mgr.on_tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.active_timers(), 0);
    }

    #[test]
    fn test_callback_stopping_peer_prevents_its_expiry() {
        let mgr = Arc::new(TimerManager::new());
        let (count, cb) = counter();
        let peer = Arc::new(Mutex::new(TimerId::INVALID));

        let inner_mgr = mgr.clone();
        let inner_peer = peer.clone();
        let first = mgr.start_timer(0, move |_| {
            let _ = inner_mgr.stop_timer(*inner_peer.lock().unwrap());
        });
        *peer.lock().unwrap() = mgr.start_timer(0, cb);
        assert!(first < *peer.lock().unwrap());

        mgr.on_tick();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.active_timers(), 0);
    }

    #[test]
    fn test_handle_tick_message() {
        let mgr = TimerManager::new();
        let (count, cb) = counter();
        mgr.start_timer(0, cb);

        mgr.handle_msg(&LayerMessage::TimerTick);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
