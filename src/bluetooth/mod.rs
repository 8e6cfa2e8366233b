//! Bluetooth hands-free support
//!
//! [`LinkNegotiator`] owns the SCO link handshake against a [`RoutingLayer`];
//! [`PulseRouting`] drives a BlueZ headset through PulseAudio or PipeWire.

pub mod mock;
pub mod negotiator;
pub mod pulse;
pub mod routing;

pub use negotiator::{LinkFailure, LinkHandle, LinkNegotiator, LinkRequestState, PendingLink};
pub use pulse::PulseRouting;
pub use routing::{LinkListener, LinkState, ListenerRegistry, RoutingLayer, SubscriptionId};
