//! # Event subscribers for the clustervisor runtime.
//!
//! This module provides the [`Subscribe`] trait and the fan-out machinery
//! for handling runtime events broadcast through the
//! [`Bus`](crate::events::Bus).
//!
//! ## Architecture
//! ```text
//! Event flow:
//!   core loop / actors ── publish(Event) ──► Bus ──► subscriber listener
//!                                                         │
//!                                                         ▼
//!                                                   SubscriberSet
//!                                              ┌─────────┼─────────┐
//!                                              ▼         ▼         ▼
//!                                          [queue S1] [queue S2] [queue SN]
//!                                              ▼         ▼         ▼
//!                                        sub1.on_event  ...   subN.on_event
//! ```
//!
//! ## Implementing custom subscribers
//! ```no_run
//! use clustervisor::{Subscribe, Event, EventKind};
//! use async_trait::async_trait;
//!
//! struct DeathCounter;
//!
//! #[async_trait]
//! impl Subscribe for DeathCounter {
//!     async fn on_event(&self, event: &Event) {
//!         if event.kind == EventKind::WorkerDied {
//!             // increment a metric...
//!         }
//!     }
//! }
//! ```

mod set;
mod subscribe;

#[cfg(feature = "logging")]
mod log;

pub use set::{forward, SubscriberSet};
pub use subscribe::Subscribe;

#[cfg(feature = "logging")]
pub use log::LogWriter;
