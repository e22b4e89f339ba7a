//! The build/execute engine.
//!
//! - [`ExecState`] - Operating states
//! - [`EngineEvent`] - Callbacks marshaled onto the controller thread
//! - [`ExecutionEngine`] - The state machine itself

mod events;
mod machine;
mod state;

pub use events::EngineEvent;
pub use machine::ExecutionEngine;
pub use state::ExecState;
