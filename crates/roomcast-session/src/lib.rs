//! # roomcast-session
//!
//! The per-connection duplex relay protocol for Roomcast.
//!
//! A session pairs one client connection with one broker subscription for
//! the session's lifetime and runs two relay loops against them:
//!
//! ```text
//!                     ┌───────────────── Session ─────────────────┐
//! ┌────────┐  text    │ ┌──────────────┐       ┌────────────────┐ │  publish  ┌────────┐
//! │ Client │─────────▶│ │ inbound loop │──────▶│  Broker handle │ │──────────▶│ Broker │
//! │        │◀─────────│ │outbound loop │◀──────│  Subscription  │ │◀──────────│        │
//! └────────┘  text    │ └──────────────┘       └────────────────┘ │  fan-out  └────────┘
//!                     └───────────────────────────────────────────┘
//! ```
//!
//! Teardown is joint: the first loop to finish wins the race, the sibling
//! is cancelled and awaited, and both the subscription and the connection
//! are released before the session reports its outcome.

pub mod connection;
pub mod message;
pub mod session;

pub use connection::{ClientConnection, ClientSink, ClientStream, ConnectionError};
pub use session::{Session, SessionError, SessionOutcome, SessionState};
