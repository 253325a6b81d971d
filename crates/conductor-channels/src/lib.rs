//! Publish/subscribe messaging for the Conductor coordination core.
//!
//! Agents receive assignments and cancellation requests on their inbox
//! channel, report heartbeats and results on `agents.events`, and outside
//! observers follow `tasks.updates` and `agents.heartbeat`.
//!
//! # Main types
//!
//! - [`Subscriber`] — Trait for bus consumers.
//! - [`FnSubscriber`] — Closure-backed subscriber.
//! - [`MessageBus`] — Fan-out bus with per-subscriber delivery queues.

/// Fan-out message bus.
pub mod bus;
/// Subscriber trait and adapters.
pub mod subscriber;

pub use bus::MessageBus;
pub use subscriber::{FnSubscriber, Subscriber};
