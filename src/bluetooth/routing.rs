//! Hands-free audio routing layer
//!
//! The routing layer is the system service that moves audio input and output
//! onto a Bluetooth headset. Bringing the SCO link up is a request; the outcome
//! arrives later as a link-state notification.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::BluetoothError;

/// Payload of a link-state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl LinkState {
    /// Decode the raw state value used on the notification channel
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(LinkState::Error),
            0 => Some(LinkState::Disconnected),
            1 => Some(LinkState::Connected),
            2 => Some(LinkState::Connecting),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            LinkState::Error => -1,
            LinkState::Disconnected => 0,
            LinkState::Connected => 1,
            LinkState::Connecting => 2,
        }
    }

    /// Whether a pending request is settled by this state
    pub fn is_terminal(self) -> bool {
        !matches!(self, LinkState::Connecting)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Receives link-state notifications
pub type LinkListener = Arc<dyn Fn(LinkState) + Send + Sync>;

/// Registration token returned by [`RoutingLayer::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The system service that routes audio through a hands-free headset
///
/// Implementations deliver notifications on their own thread and must not
/// hold internal locks while invoking listeners: a listener may unsubscribe
/// itself from inside the callback.
pub trait RoutingLayer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether hands-free audio can be routed outside a phone call
    fn is_sco_available(&self) -> bool;

    /// Ask the system to bring the SCO link up; the result is notified later
    fn start_sco(&self) -> Result<(), BluetoothError>;

    /// Take the SCO link down
    fn stop_sco(&self) -> Result<(), BluetoothError>;

    /// Switch capture and playback routing to (or away from) the headset
    fn set_sco_routing(&self, on: bool) -> Result<(), BluetoothError>;

    fn is_sco_routing_on(&self) -> bool;

    fn subscribe(&self, listener: LinkListener) -> SubscriptionId;

    /// Remove a listener; unknown ids are ignored
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Listener bookkeeping shared by routing implementations
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, LinkListener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: LinkListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: SubscriptionId) {
        self.listeners.lock().retain(|(existing, _)| *existing != id);
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Deliver `state` to every listener registered at the time of the call
    pub fn notify(&self, state: LinkState) {
        let snapshot: Vec<LinkListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_state_codes() {
        for state in [
            LinkState::Disconnected,
            LinkState::Connecting,
            LinkState::Connected,
            LinkState::Error,
        ] {
            assert_eq!(LinkState::from_code(state.code()), Some(state));
        }
        assert_eq!(LinkState::from_code(7), None);
        assert!(!LinkState::Connecting.is_terminal());
        assert!(LinkState::Connected.is_terminal());
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let registry = Arc::new(ListenerRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        let reg = registry.clone();
        let counter = calls.clone();
        let slot = own_id.clone();
        let id = registry.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot.lock() {
                reg.remove(id);
            }
        }));
        *own_id.lock() = Some(id);

        registry.notify(LinkState::Connected);
        registry.notify(LinkState::Connected);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
