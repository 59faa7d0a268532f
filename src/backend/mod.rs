//! Child Transport (C1) and Stdio Router (C2): spawning, supervising, and
//! fanning out requests to backend child processes.

pub mod error;
mod router;
mod transport;

pub use error::RouteError;
pub use router::{DiscoveredTool, StdioRouter, ToolDescriptor};
pub(crate) use router::longest_prefix_match;
pub use transport::ChildTransport;

use std::sync::atomic::{AtomicU8, Ordering};

/// Per-backend lifecycle state, encoded as an atomic u8 so readers never
/// block on the writer (the supervisor loop and the router's handshake both
/// mutate it from different tasks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Registered,
    Starting,
    Handshaking,
    Connected,
    Disconnected,
}

const STATE_REGISTERED: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_HANDSHAKING: u8 = 2;
const STATE_CONNECTED: u8 = 3;
const STATE_DISCONNECTED: u8 = 4;

pub(crate) fn new_state_atomic() -> AtomicU8 {
    AtomicU8::new(STATE_REGISTERED)
}

pub(crate) fn state_from_atomic(a: &AtomicU8) -> BackendState {
    match a.load(Ordering::Acquire) {
        STATE_STARTING => BackendState::Starting,
        STATE_HANDSHAKING => BackendState::Handshaking,
        STATE_CONNECTED => BackendState::Connected,
        STATE_DISCONNECTED => BackendState::Disconnected,
        _ => BackendState::Registered,
    }
}

pub(crate) fn store_state(a: &AtomicU8, state: BackendState) {
    let encoded = match state {
        BackendState::Registered => STATE_REGISTERED,
        BackendState::Starting => STATE_STARTING,
        BackendState::Handshaking => STATE_HANDSHAKING,
        BackendState::Connected => STATE_CONNECTED,
        BackendState::Disconnected => STATE_DISCONNECTED,
    };
    a.store(encoded, Ordering::Release);
}

/// Only `Connected` makes a backend eligible for routing (spec.md §3).
pub(crate) fn is_routable_from_atomic(a: &AtomicU8) -> bool {
    state_from_atomic(a) == BackendState::Connected
}
