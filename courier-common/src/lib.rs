//! Shared building blocks for courier
//!
//! - [`logging`]: subscriber initialisation and the span-wrapping log macros
//! - [`message`]: the outbound message envelope handed to the dispatcher
//! - [`task`]: cancellable periodic background tasks

pub mod logging;
pub mod message;
pub mod task;

pub use message::Message;
pub use task::{ScheduledTask, TaskError};
pub use tracing;

/// Process-wide lifecycle signals broadcast to long running components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
