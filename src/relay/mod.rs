//! Relay orchestration: session model, controller and observer events

pub mod capability;
pub mod controller;
pub mod event;
pub mod session;

pub use capability::Capabilities;
pub use controller::{RelayBuilder, RelayController, StartAck};
pub use event::{event_callback, EventCallback, RelayEvent};
pub use session::{Session, SessionInfo, SessionState, SourceMode};
