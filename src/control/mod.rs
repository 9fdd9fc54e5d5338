// =============================================================================
// Control plane — per-user command topic, priority queue, handlers
// =============================================================================

pub mod channel;
pub mod command;

pub use channel::{CommandExecutor, ControlChannel};
pub use command::{ClearScope, Command, CommandEnvelope, CommandResponse, ResponseStatus};
