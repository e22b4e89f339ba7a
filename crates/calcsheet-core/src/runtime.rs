//! Narrow interface to a loaded model's runtime.
//!
//! A [`ModelApi`] is what the engine holds while a model is live. The real
//! implementation wraps symbols from a loaded library; tests substitute
//! scripted doubles. Control calls are issued from the controller thread;
//! the model reports back through [`RuntimeEvent`]s which may be enqueued
//! from the model's own execution thread(s) and are therefore delivered
//! over a channel, never by direct state mutation.

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::abi::AbortReason;
use crate::engine::EngineEvent;
use crate::symbols::{IdentifierHandle, OperationHandle};

/// Callbacks from a running model.
#[derive(Clone, Debug)]
pub enum RuntimeEvent {
    /// The model began executing.
    Started,
    /// The model ran to completion.
    Finished,
    /// The model terminated abnormally.
    Aborted {
        reason: AbortReason,
        operation: Option<OperationHandle>,
    },
    /// The model halted at a safe point after a pause request.
    PausedOnUserRequest { operation: OperationHandle },
    /// The model halted at an instruction breakpoint or run-to target.
    PausedAtOperation { operation: OperationHandle },
    /// The model halted because a watched identifier was updated.
    PausedOnVariableUpdate {
        operation: OperationHandle,
        identifier: IdentifierHandle,
    },
    /// The model resumed after a pause.
    Resumed,
    /// The model produced a value on an output device.
    Output { device: usize, value: f64 },
}

impl RuntimeEvent {
    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            RuntimeEvent::Started => "Started",
            RuntimeEvent::Finished => "Finished",
            RuntimeEvent::Aborted { .. } => "Aborted",
            RuntimeEvent::PausedOnUserRequest { .. } => "PausedOnUserRequest",
            RuntimeEvent::PausedAtOperation { .. } => "PausedAtOperation",
            RuntimeEvent::PausedOnVariableUpdate { .. } => "PausedOnVariableUpdate",
            RuntimeEvent::Resumed => "Resumed",
            RuntimeEvent::Output { .. } => "Output",
        }
    }
}

/// Errors starting a model run.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The model is already running.
    #[error("Model is already running")]
    AlreadyRunning,

    /// The model instance could not be created.
    #[error("Model instance creation failed")]
    CreateFailed,
}

/// Execution interface of a loaded model.
///
/// All methods are called from the controller thread. Implementations
/// must tolerate control calls arriving while the model's run thread is
/// executing; the generated runtime uses atomics for every control word.
pub trait ModelApi: Send {
    /// Begin execution. Events are delivered on `events`, possibly from a
    /// thread other than the caller's.
    fn start(&mut self, debug: bool, events: Sender<EngineEvent>) -> Result<(), ModelError>;

    /// Ask the model to pause at its next safe point.
    fn request_pause(&mut self);

    /// Resume a paused model.
    fn resume(&mut self);

    /// Ask the model to terminate.
    fn request_abort(&mut self);

    /// Set or clear an instruction breakpoint. Best-effort while running.
    fn set_instruction_breakpoint(&mut self, operation: OperationHandle, set: bool) -> bool;

    /// Install or clear the run-to target.
    fn set_run_to(&mut self, operation: Option<OperationHandle>);

    /// Enable or disable single-step mode.
    fn set_single_step(&mut self, on: bool);

    /// Arm or disarm a watchpoint on an identifier.
    fn set_variable_watch(&mut self, identifier: IdentifierHandle, set: bool) -> bool;

    /// Write a value into the model's memory. Only meaningful while the
    /// model is paused; the model rejects writes it cannot take.
    fn update_identifier(&mut self, identifier: IdentifierHandle, value: f64) -> bool;

    /// Read an identifier's current value.
    fn read_identifier(&self, identifier: IdentifierHandle) -> Option<f64>;
}
