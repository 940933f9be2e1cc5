//! Control protocol between master and workers.
//!
//! ## Contents
//! - [`ControlMessage`] and friends — the closed, serde-tagged message
//!   union (redesign of the original's stringly-typed event names)
//! - [`ControlSender`]/[`ControlReceiver`] — newline-delimited JSON
//!   framing over the worker's stdio pipes
//! - [`DelegateBroker`]/[`DelegateHub`] — the request/response delegate
//!   pattern with correlation, routing and timeout
//!
//! ## Ordering
//! Within one worker's channel, messages are delivered in send order.
//! No ordering is guaranteed across different workers.

mod channel;
mod delegate;
mod message;

pub use channel::{ControlReceiver, ControlSender};
pub use delegate::{DelegateBroker, DelegateHub, Outbound};
pub use message::{
    ClusterHeartbeat, Command, ControlMessage, DelegateRequest, HeartbeatSample,
    DEFAULT_DELEGATE_TIMEOUT,
};
