//! Chain connectivity for the show-line contract
//!
//! This module provides:
//! - Contract bindings and call encoding
//! - Event types for the five correlated contract events
//! - WebSocket event listener with automatic reconnection
//! - Polling fallback for RPC providers without WebSocket support

mod contract;
mod errors;
mod event_listener;
pub(crate) mod event_types;

pub use contract::{IShowLine, LineCall, encode_key};
pub use errors::LinkError;
pub use event_listener::{ChainEventListener, EventListenerConfig, ListenerState};
pub use event_types::{
    EventParseError, EventSignatures, LineEvent, parse_log,
    LinePeekedEvent, PointsRewardedEvent, TokenRewardedEvent, TurnAssignedEvent,
    UserAllocatedEvent,
};
