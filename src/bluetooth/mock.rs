//! Scripted routing layer for tests and dry runs.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::bluetooth::routing::{
    LinkListener, LinkState, ListenerRegistry, RoutingLayer, SubscriptionId,
};
use crate::error::BluetoothError;

/// A routing layer whose link-state notifications are scripted
///
/// With a scripted response, every `start_sco` call spawns a notifier
/// thread that reports the state after the delay, the way the real system
/// answers from its own event thread.
pub struct MockRouting {
    supported: bool,
    response: Option<(LinkState, Duration)>,
    fail_start: Option<String>,
    fail_routing: Option<String>,
    registry: Arc<ListenerRegistry>,
    routing_on: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    notified: Arc<Mutex<Vec<(LinkState, Instant)>>>,
}

impl MockRouting {
    fn with(supported: bool, response: Option<(LinkState, Duration)>) -> Self {
        Self {
            supported,
            response,
            fail_start: None,
            fail_routing: None,
            registry: Arc::new(ListenerRegistry::new()),
            routing_on: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            notified: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// No hands-free support at all
    pub fn unsupported() -> Self {
        Self::with(false, None)
    }

    /// Supported, but never answers on its own; drive it with [`emit`](Self::emit)
    pub fn silent() -> Self {
        Self::with(true, None)
    }

    /// Reports `Connected` `delay` after each SCO request
    pub fn connecting_after(delay: Duration) -> Self {
        Self::with(true, Some((LinkState::Connected, delay)))
    }

    /// Reports `state` `delay` after each SCO request
    pub fn responding_with(state: LinkState, delay: Duration) -> Self {
        Self::with(true, Some((state, delay)))
    }

    pub fn failing_start(mut self, reason: &str) -> Self {
        self.fail_start = Some(reason.to_string());
        self
    }

    /// `set_sco_routing(true)` fails, as when the headset exposes no audio nodes
    pub fn failing_routing(mut self, reason: &str) -> Self {
        self.fail_routing = Some(reason.to_string());
        self
    }

    /// Deliver a notification to current subscribers on the calling thread
    pub fn emit(&self, state: LinkState) {
        self.notified.lock().push((state, Instant::now()));
        self.registry.notify(state);
    }

    pub fn start_sco_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_sco_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Every notification delivered so far, with its delivery time
    pub fn notifications(&self) -> Vec<(LinkState, Instant)> {
        self.notified.lock().clone()
    }
}

impl RoutingLayer for MockRouting {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_sco_available(&self) -> bool {
        self.supported
    }

    fn start_sco(&self) -> Result<(), BluetoothError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_start {
            return Err(BluetoothError::Routing(reason.clone()));
        }
        if let Some((state, delay)) = self.response {
            let registry = self.registry.clone();
            let notified = self.notified.clone();
            thread::Builder::new()
                .name("mock-routing".to_string())
                .spawn(move || {
                    thread::sleep(delay);
                    notified.lock().push((state, Instant::now()));
                    registry.notify(state);
                })
                .map_err(|e| BluetoothError::Routing(e.to_string()))?;
        }
        Ok(())
    }

    fn stop_sco(&self) -> Result<(), BluetoothError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_sco_routing(&self, on: bool) -> Result<(), BluetoothError> {
        if let (true, Some(reason)) = (on, &self.fail_routing) {
            return Err(BluetoothError::Routing(reason.clone()));
        }
        self.routing_on.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn is_sco_routing_on(&self) -> bool {
        self.routing_on.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: LinkListener) -> SubscriptionId {
        self.registry.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.registry.remove(id);
    }
}
