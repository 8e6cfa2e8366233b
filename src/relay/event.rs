//! Observer notifications from the relay controller
//!
//! Events are observational only; nothing on the data path waits for them.
//! They are delivered from the controller's worker thread, so a callback
//! must not call back into the controller and block on it.

use serde::Serialize;
use std::sync::Arc;

use crate::bluetooth::LinkFailure;
use crate::relay::session::{SessionState, SourceMode};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    /// The controller moved between lifecycle states
    StateChanged { from: SessionState, to: SessionState },

    /// A Bluetooth start was refused because there is no hands-free routing
    BluetoothUnsupported,

    /// Link negotiation began
    Negotiating,

    /// The SCO link came up
    LinkConnected,

    /// Negotiation ended without a link
    NegotiationFailed { reason: LinkFailure },

    /// Audio is flowing from source to sink
    Streaming { mode: SourceMode },

    /// The session ended and every resource was released
    Stopped,

    /// An error with its stable reason code
    Error { code: &'static str, message: String },
}

pub type EventCallback = Arc<dyn Fn(RelayEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(RelayEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_event_callback_helper() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = event_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        callback(RelayEvent::Stopped);
        callback(RelayEvent::LinkConnected);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let json = serde_json::to_string(&RelayEvent::StateChanged {
            from: SessionState::Idle,
            to: SessionState::Negotiating,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"state_changed","from":"idle","to":"negotiating"}"#);

        let json = serde_json::to_string(&RelayEvent::NegotiationFailed {
            reason: LinkFailure::Timeout,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"negotiation_failed","reason":"timeout"}"#);
    }
}
