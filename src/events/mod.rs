//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to runtime events emitted by the supervisor, the
//! worker actors, the drain controller, the heartbeat aggregator and the
//! delegate broker.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] — event classification and payload metadata
//! - [`Bus`] — thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers (master)**: supervisor core loop, worker actors,
//!   heartbeat aggregator, delegate broker.
//! - **Publishers (worker)**: drain controller, control-loop, ECV
//!   responder.
//! - **Consumers**: the subscriber listener (fans out to
//!   [`SubscriberSet`](crate::subscribers::SubscriberSet)) and any
//!   application code holding a `Bus` subscription.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
