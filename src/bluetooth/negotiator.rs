//! Bluetooth SCO link negotiation
//!
//! A link request is a one-shot asynchronous operation: the negotiator asks
//! the routing layer for the SCO link, subscribes to exactly one terminal
//! link-state notification, and completes through a single-fire pair of
//! callbacks. The returned [`PendingLink`] is the cancellation token.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::bluetooth::routing::{LinkState, RoutingLayer, SubscriptionId};
use crate::error::BluetoothError;

/// Why a link request ended without a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFailure {
    /// No hands-free routing on this system
    Unsupported,
    /// No terminal notification within the negotiation window
    Timeout,
    /// The routing layer reported the link down
    Disconnected,
    /// The routing layer reported an error, or audio could not be routed
    /// to the headset once the link was up
    RoutingError,
    /// The caller cancelled the request
    Cancelled,
    /// The request itself could not be issued
    Request(String),
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFailure::Unsupported => f.write_str("unsupported"),
            LinkFailure::Timeout => f.write_str("timed out waiting for link"),
            LinkFailure::Disconnected => f.write_str("link disconnected"),
            LinkFailure::RoutingError => f.write_str("routing layer reported an error"),
            LinkFailure::Cancelled => f.write_str("cancelled"),
            LinkFailure::Request(reason) => write!(f, "request failed: {}", reason),
        }
    }
}

/// Request state of the SCO link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRequestState {
    Requested,
    Connected,
    Failed,
    Disconnected,
}

/// The negotiator's record of the SCO link
#[derive(Debug, Clone)]
pub struct LinkHandle {
    pub state: LinkRequestState,
    /// Routing layer that owns the underlying resource
    pub routing: String,
    pub requested_at: Option<Instant>,
    pub connected_at: Option<Instant>,
}

impl LinkHandle {
    fn new(routing: &str) -> Self {
        Self {
            state: LinkRequestState::Disconnected,
            routing: routing.to_string(),
            requested_at: None,
            connected_at: None,
        }
    }
}

/// Owns the handshake with the hands-free routing layer
pub struct LinkNegotiator {
    routing: Arc<dyn RoutingLayer>,
    timeout: Duration,
    handle: Arc<Mutex<LinkHandle>>,
}

impl LinkNegotiator {
    pub fn new(routing: Arc<dyn RoutingLayer>, timeout: Duration) -> Self {
        let handle = Arc::new(Mutex::new(LinkHandle::new(routing.name())));
        Self {
            routing,
            timeout,
            handle,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.routing.is_sco_available()
    }

    pub fn link_state(&self) -> LinkRequestState {
        self.handle.lock().state
    }

    /// Request the SCO link
    ///
    /// Exactly one of the callbacks fires, at most once. If hands-free
    /// routing is unsupported `on_failed(Unsupported)` runs before this
    /// returns and nothing else happens. Otherwise the callbacks run later on
    /// the routing layer's notification thread or the timeout thread.
    pub fn request_link<C, F>(&self, on_connected: C, on_failed: F) -> PendingLink
    where
        C: FnOnce() + Send + 'static,
        F: FnOnce(LinkFailure) + Send + 'static,
    {
        if !self.routing.is_sco_available() {
            tracing::warn!(
                "Routing layer '{}' has no hands-free audio support",
                self.routing.name()
            );
            on_failed(LinkFailure::Unsupported);
            return PendingLink { negotiation: None };
        }

        {
            let mut handle = self.handle.lock();
            handle.state = LinkRequestState::Requested;
            handle.requested_at = Some(Instant::now());
            handle.connected_at = None;
        }

        let negotiation = Arc::new(Negotiation {
            routing: self.routing.clone(),
            handle: self.handle.clone(),
            inner: Mutex::new(NegotiationInner {
                callbacks: Some(Callbacks {
                    on_connected: Box::new(on_connected),
                    on_failed: Box::new(on_failed),
                }),
                subscription: None,
                watchdog: None,
                sco_requested: false,
            }),
        });

        let listener_neg = negotiation.clone();
        let id = self.routing.subscribe(Arc::new(move |state| {
            listener_neg.on_link_state(state);
        }));
        {
            let mut inner = negotiation.inner.lock();
            if inner.callbacks.is_some() {
                inner.subscription = Some(id);
            } else {
                drop(inner);
                self.routing.unsubscribe(id);
            }
        }

        let (wake_tx, wake_rx) = bounded::<()>(0);
        negotiation.inner.lock().watchdog = Some(wake_tx);
        let watchdog_neg = negotiation.clone();
        let timeout = self.timeout;
        let spawned = thread::Builder::new()
            .name("link-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = wake_rx.recv_timeout(timeout) {
                    tracing::warn!("No SCO link after {:?}", timeout);
                    watchdog_neg.complete(Err(LinkFailure::Timeout));
                }
            });
        if let Err(e) = spawned {
            negotiation.complete(Err(LinkFailure::Request(e.to_string())));
            return PendingLink {
                negotiation: Some(negotiation),
            };
        }

        negotiation.inner.lock().sco_requested = true;
        tracing::debug!("Requesting SCO link from '{}'", self.routing.name());
        if let Err(e) = self.routing.start_sco() {
            negotiation.complete(Err(LinkFailure::Request(e.to_string())));
        }

        PendingLink {
            negotiation: Some(negotiation),
        }
    }

    /// Turn headset routing off and take the link down if it is connected
    ///
    /// Idempotent; a no-op when no link exists.
    pub fn release_link(&self) -> Result<(), BluetoothError> {
        let mut handle = self.handle.lock();
        if handle.state != LinkRequestState::Connected {
            return Ok(());
        }
        handle.state = LinkRequestState::Disconnected;
        handle.connected_at = None;

        let routing_off = self.routing.set_sco_routing(false);
        let stopped = self.routing.stop_sco();
        tracing::info!("SCO link released");
        routing_off.and(stopped)
    }
}

/// Cancellation token for an outstanding link request
pub struct PendingLink {
    negotiation: Option<Arc<Negotiation>>,
}

impl PendingLink {
    /// Cancel the request if it is still outstanding
    ///
    /// Unregisters the notification listener, withdraws the SCO request and
    /// runs `on_failed(Cancelled)`. Returns `false` if the request had
    /// already settled, in which case nothing happens.
    pub fn cancel(&self) -> bool {
        match &self.negotiation {
            Some(negotiation) => negotiation.complete(Err(LinkFailure::Cancelled)),
            None => false,
        }
    }

    /// Whether a callback has already fired
    pub fn is_settled(&self) -> bool {
        match &self.negotiation {
            Some(negotiation) => negotiation.inner.lock().callbacks.is_none(),
            None => true,
        }
    }
}

struct Callbacks {
    on_connected: Box<dyn FnOnce() + Send>,
    on_failed: Box<dyn FnOnce(LinkFailure) + Send>,
}

struct NegotiationInner {
    callbacks: Option<Callbacks>,
    subscription: Option<SubscriptionId>,
    /// Dropping the sender wakes the timeout thread
    watchdog: Option<Sender<()>>,
    sco_requested: bool,
}

struct Negotiation {
    routing: Arc<dyn RoutingLayer>,
    handle: Arc<Mutex<LinkHandle>>,
    inner: Mutex<NegotiationInner>,
}

impl Negotiation {
    fn on_link_state(&self, state: LinkState) {
        tracing::debug!("SCO link state: {}", state);
        if !state.is_terminal() {
            return;
        }
        let reason = match state {
            LinkState::Connected => {
                self.complete(Ok(()));
                return;
            }
            LinkState::Error => LinkFailure::RoutingError,
            _ => LinkFailure::Disconnected,
        };
        // Only a failure reported after the request settles it
        if self.inner.lock().sco_requested {
            self.complete(Err(reason));
        }
    }

    /// Settle the request; returns `false` if it was already settled
    fn complete(&self, outcome: Result<(), LinkFailure>) -> bool {
        let (callbacks, subscription, withdraw) = {
            let mut inner = self.inner.lock();
            let Some(callbacks) = inner.callbacks.take() else {
                return false;
            };
            inner.watchdog = None;

            // The handle is updated under the same lock that cancellation
            // takes, so a canceller that lost the race sees Connected and
            // releases the link itself
            let mut handle = self.handle.lock();
            match outcome {
                Ok(()) => {
                    handle.state = LinkRequestState::Connected;
                    handle.connected_at = Some(Instant::now());
                }
                Err(_) => handle.state = LinkRequestState::Failed,
            }
            (callbacks, inner.subscription.take(), inner.sco_requested && outcome.is_err())
        };

        if let Some(id) = subscription {
            self.routing.unsubscribe(id);
        }

        let outcome = match outcome {
            Ok(()) => self.route_to_headset(),
            Err(reason) => {
                if withdraw {
                    self.withdraw();
                }
                Err(reason)
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!("SCO link connected");
                (callbacks.on_connected)();
            }
            Err(reason) => {
                tracing::info!("SCO link request ended: {}", reason);
                (callbacks.on_failed)(reason);
            }
        }
        true
    }

    /// Move capture and playback onto the headset once the link is up
    ///
    /// A link without routing is useless, so a routing failure takes the
    /// link down and fails the request.
    fn route_to_headset(&self) -> Result<(), LinkFailure> {
        let routed = self.routing.set_sco_routing(true);

        let mut handle = self.handle.lock();
        if handle.state != LinkRequestState::Connected {
            // Released while routing was switched on
            drop(handle);
            if routed.is_ok() {
                if let Err(e) = self.routing.set_sco_routing(false) {
                    tracing::warn!("Failed to restore audio routing: {}", e);
                }
            }
            return Ok(());
        }

        let Err(e) = routed else {
            return Ok(());
        };
        tracing::warn!("Failed to route audio to headset: {}", e);
        handle.state = LinkRequestState::Failed;
        handle.connected_at = None;
        drop(handle);
        // Undo whatever part of the switch went through
        if let Err(e) = self.routing.set_sco_routing(false) {
            tracing::warn!("Failed to restore audio routing: {}", e);
        }
        self.withdraw();
        Err(LinkFailure::RoutingError)
    }

    fn withdraw(&self) {
        if let Err(e) = self.routing.stop_sco() {
            tracing::warn!("Failed to withdraw SCO request: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::MockRouting;
    use crossbeam_channel::unbounded;

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Connected,
        Failed(LinkFailure),
    }

    fn request(negotiator: &LinkNegotiator) -> (PendingLink, crossbeam_channel::Receiver<Outcome>) {
        let (tx, rx) = unbounded();
        let tx2 = tx.clone();
        let pending = negotiator.request_link(
            move || {
                let _ = tx.send(Outcome::Connected);
            },
            move |reason| {
                let _ = tx2.send(Outcome::Failed(reason));
            },
        );
        (pending, rx)
    }

    #[test]
    fn test_unsupported_fails_synchronously() {
        let routing = Arc::new(MockRouting::unsupported());
        let negotiator = LinkNegotiator::new(routing.clone(), Duration::from_secs(1));

        let (pending, rx) = request(&negotiator);

        assert_eq!(rx.try_recv().unwrap(), Outcome::Failed(LinkFailure::Unsupported));
        assert!(pending.is_settled());
        assert_eq!(routing.start_sco_calls(), 0);
        assert_eq!(routing.subscriber_count(), 0);
    }

    #[test]
    fn test_connected_notification_completes_once() {
        let routing = Arc::new(MockRouting::silent());
        let negotiator = LinkNegotiator::new(routing.clone(), Duration::from_secs(5));

        let (pending, rx) = request(&negotiator);
        assert_eq!(negotiator.link_state(), LinkRequestState::Requested);
        assert_eq!(routing.subscriber_count(), 1);

        routing.emit(LinkState::Connecting);
        routing.emit(LinkState::Connected);
        routing.emit(LinkState::Connected);

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Outcome::Connected);
        assert!(rx.try_recv().is_err());
        assert!(pending.is_settled());
        assert!(!pending.cancel());
        assert_eq!(routing.subscriber_count(), 0);
        assert_eq!(negotiator.link_state(), LinkRequestState::Connected);
        assert!(routing.is_sco_routing_on());
    }

    #[test]
    fn test_disconnected_notification_fails_and_withdraws() {
        let routing = Arc::new(MockRouting::silent());
        let negotiator = LinkNegotiator::new(routing.clone(), Duration::from_secs(5));

        let (_pending, rx) = request(&negotiator);
        routing.emit(LinkState::Disconnected);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Outcome::Failed(LinkFailure::Disconnected)
        );
        assert_eq!(routing.stop_sco_calls(), 1);
        assert_eq!(negotiator.link_state(), LinkRequestState::Failed);
    }

    #[test]
    fn test_cancel_unregisters_and_reports_cancelled() {
        let routing = Arc::new(MockRouting::silent());
        let negotiator = LinkNegotiator::new(routing.clone(), Duration::from_secs(5));

        let (pending, rx) = request(&negotiator);
        assert!(pending.cancel());
        assert!(!pending.cancel());

        routing.emit(LinkState::Connected);

        assert_eq!(rx.try_recv().unwrap(), Outcome::Failed(LinkFailure::Cancelled));
        assert!(rx.try_recv().is_err());
        assert_eq!(routing.subscriber_count(), 0);
        assert_eq!(negotiator.link_state(), LinkRequestState::Failed);
    }

    #[test]
    fn test_timeout_fails_request() {
        let routing = Arc::new(MockRouting::silent());
        let negotiator = LinkNegotiator::new(routing.clone(), Duration::from_millis(30));

        let (_pending, rx) = request(&negotiator);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Outcome::Failed(LinkFailure::Timeout)
        );
        assert_eq!(routing.subscriber_count(), 0);
    }

    #[test]
    fn test_start_sco_error_fails_request() {
        let routing = Arc::new(MockRouting::silent().failing_start("adapter off"));
        let negotiator = LinkNegotiator::new(routing.clone(), Duration::from_secs(5));

        let (_pending, rx) = request(&negotiator);

        match rx.try_recv().unwrap() {
            Outcome::Failed(LinkFailure::Request(reason)) => {
                assert!(reason.contains("adapter off"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_routing_failure_fails_request_and_takes_link_down() {
        let routing = Arc::new(MockRouting::silent().failing_routing("no headset source"));
        let negotiator = LinkNegotiator::new(routing.clone(), Duration::from_secs(5));

        let (pending, rx) = request(&negotiator);
        routing.emit(LinkState::Connected);

        assert_eq!(rx.try_recv().unwrap(), Outcome::Failed(LinkFailure::RoutingError));
        assert!(rx.try_recv().is_err());
        assert!(pending.is_settled());
        assert_eq!(negotiator.link_state(), LinkRequestState::Failed);
        assert_eq!(routing.stop_sco_calls(), 1);
        assert!(!routing.is_sco_routing_on());
        assert_eq!(routing.subscriber_count(), 0);

        // Nothing left to release
        negotiator.release_link().unwrap();
        assert_eq!(routing.stop_sco_calls(), 1);
    }

    #[test]
    fn test_release_link_is_idempotent() {
        let routing = Arc::new(MockRouting::connecting_after(Duration::from_millis(5)));
        let negotiator = LinkNegotiator::new(routing.clone(), Duration::from_secs(5));

        let (_pending, rx) = request(&negotiator);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Outcome::Connected);

        negotiator.release_link().unwrap();
        negotiator.release_link().unwrap();

        assert_eq!(routing.stop_sco_calls(), 1);
        assert!(!routing.is_sco_routing_on());
        assert_eq!(negotiator.link_state(), LinkRequestState::Disconnected);
    }

    #[test]
    fn test_release_without_link_is_noop() {
        let routing = Arc::new(MockRouting::silent());
        let negotiator = LinkNegotiator::new(routing.clone(), Duration::from_secs(5));
        negotiator.release_link().unwrap();
        assert_eq!(routing.stop_sco_calls(), 0);
    }
}
