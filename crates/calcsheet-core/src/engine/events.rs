//! The engine's internal event channel.
//!
//! Generator and runtime callbacks fire on threads the engine does not
//! control. They are marshaled here: worker threads enqueue
//! [`EngineEvent`]s, and only the controller thread - inside
//! `ExecutionEngine::process_pending` - dequeues them and touches engine
//! state.

use crate::generator::GeneratorEvent;
use crate::runtime::RuntimeEvent;

/// An event queued for the controller thread.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// Translation lifecycle callback from the code generator.
    Generator(GeneratorEvent),
    /// Execution callback from the loaded model.
    Runtime(RuntimeEvent),
}

impl EngineEvent {
    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            EngineEvent::Generator(ev) => ev.type_name(),
            EngineEvent::Runtime(ev) => ev.type_name(),
        }
    }
}
