//! # Worker-side runtime.
//!
//! Everything that runs inside a spawned worker process:
//! - [`handler`]: the [`ConnectionHandler`] application seam and the
//!   [`ControlHandle`] back-channel
//! - [`drain`]: shared-port listeners, connection accounting, draining
//! - [`runtime`]: the [`WorkerRuntime`] control loop tying it together

mod drain;
mod handler;
mod runtime;

pub use drain::{Connection, DrainState};
pub use handler::{ConnectionHandler, ControlHandle, HandlerFn};
pub use runtime::WorkerRuntime;
