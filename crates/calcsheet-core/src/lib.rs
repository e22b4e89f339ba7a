//! CalcSheet Core - The build/execute engine of the CalcSheet worksheet
//! application.
//!
//! This crate provides the fundamental building blocks for CalcSheet:
//!
//! - **Document** - Worksheet model, registry, and weak document handles
//! - **Expr** - Arithmetic expression AST and parser
//! - **Symbols** - Identifier/operation databases captured at build time
//! - **Diag** - Uniform diagnostics for build errors and runtime aborts
//! - **Abi** - The C contract between host and generated model libraries
//! - **Generator** - Narrow interface to the code generator collaborator
//! - **Runtime** - Execution interface of a loaded model
//! - **Loader** - Dynamic library loading and unloading
//! - **Notify** - Observer bus for outbound notifications
//! - **Engine** - The build/execute state machine
//!
//! # Architecture
//!
//! All public engine operations are issued from one controller thread.
//! The code generator and the running model report back from their own
//! threads by enqueuing [`EngineEvent`]s; the controller drains the queue
//! through [`ExecutionEngine::process_pending`] and is the only place
//! state changes or notifications happen. Observers register on the
//! engine's [`notify::ObserverBus`] and receive [`Notification`]s.

pub mod abi;
pub mod diag;
pub mod document;
pub mod engine;
pub mod expr;
pub mod generator;
pub mod loader;
pub mod notify;
pub mod runtime;
pub mod symbols;

// Re-export main types for convenience.
pub use abi::{AbortReason, ModelEventCode};
pub use diag::{Diagnostic, DiagnosticCode, Severity};
pub use document::{
    Calculation, DocHandle, DocumentId, DocumentRegistry, Element, ElementId, ElementKind,
    Worksheet,
};
pub use engine::{EngineEvent, ExecState, ExecutionEngine};
pub use expr::{BinOp, Expr, MathFn};
pub use generator::{
    BuildArtifacts, CodeGenerator, GeneratorError, GeneratorEvent, OutputKind,
    TranslationProgress, TranslationRequest,
};
pub use loader::{LibraryLoader, LoadError, LoadedModel, ModelLoader};
pub use notify::{Notification, ObserverBus, ObserverId};
pub use runtime::{ModelApi, ModelError, RuntimeEvent};
pub use symbols::{
    CalculatedValue, IdentifierDatabase, IdentifierHandle, OperationDatabase, OperationHandle,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_defaults() {
        let state = ExecState::Idle;
        assert!(!state.has_model());
        assert!(state.accepts_run());
    }

    #[test]
    fn test_value_construction() {
        let value = CalculatedValue::new("x", 2.5);
        assert_eq!(value.name, "x");
        assert!((value.value - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_expr_reexport_parses() {
        let e = expr::parse("a + b * 2").unwrap();
        assert_eq!(e.identifiers().len(), 2);
    }
}
