//! # red-session — Peer-to-peer session coordinator for RED
//!
//! Accepts invitations, relays local edits to known collaborators, applies
//! remote edits through a merge engine and hands the converged text to the
//! presentation layer.
//!
//! ## Architecture
//!
//! ```text
//!  presentation ── notify(edit) ──► Session ── broadcast ──► Transport ──► peers
//!       ▲                              │
//!       │                       dispatch task
//!       │                              │  Invite → PeerSet
//!       └──── UpdateStream ◄───────────┘  Edit   → MergeEngine → text
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — INVITE / EDIT messages (bincode-encoded)
//! - [`transport`] — Transport trait, WebSocket and in-memory implementations
//! - [`membership`] — Deduplicated peer set
//! - [`broadcast`] — At-most-once fan-out with aggregated failures
//! - [`updates`] — Bounded update queue towards the presentation layer
//! - [`session`] — The coordinator and its dispatch loop

pub mod broadcast;
pub mod error;
pub mod membership;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod updates;

// Re-exports for convenience
pub use broadcast::{BroadcastError, BroadcastReport, SendFailure};
pub use error::SessionError;
pub use membership::PeerSet;
pub use protocol::{Message, MessageType, ProtocolError};
pub use session::{Session, SessionConfig, SessionStats};
pub use transport::{
    MemoryNetwork, MemoryTransport, Transport, TransportConfig, TransportError, WsTransport,
};
pub use updates::UpdateStream;

pub use red_core::{Edit, EditKind, MergeEngine, MergeError, TextMergeEngine};
