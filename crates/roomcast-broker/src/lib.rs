//! # roomcast-broker
//!
//! Pub/sub broker client abstraction for the Roomcast chat relay.
//!
//! A room is nothing more than a broker channel name: the broker's channel
//! namespace *is* the room registry, and the server keeps no membership
//! table of its own. This crate provides the seam the relay core depends on:
//!
//! - **Broker** - publish to a channel, subscribe to a channel
//! - **Subscription** - lazy, unbounded sequence of deliveries
//! - **MemoryBroker** - in-process fan-out for single-node deployments and tests
//! - **RemoteBroker** - client for an external pub/sub service over WebSocket
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  publish   ┌─────────────┐  fan-out   ┌──────────────┐
//! │   Session   │───────────▶│   Broker    │───────────▶│ Subscription │
//! └─────────────┘            └─────────────┘            └──────────────┘
//!                      MemoryBroker │ RemoteBroker
//! ```

pub mod memory;
pub mod remote;
pub mod traits;

pub use memory::MemoryBroker;
pub use remote::RemoteBroker;
pub use traits::{Broker, BrokerError, Delivery, Subscription};
