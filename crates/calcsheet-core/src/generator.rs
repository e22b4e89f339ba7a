//! Narrow interface to the code generator collaborator.
//!
//! The generator is a shared, single-owner resource: a client must claim
//! it before translating and release it afterwards. Translation itself is
//! asynchronous; lifecycle callbacks arrive as [`GeneratorEvent`]s on the
//! event channel the claiming client supplied, keyed by root document id
//! so superseded builds can be discarded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::diag::Diagnostic;
use crate::document::{DocHandle, DocumentId};
use crate::engine::EngineEvent;
use crate::symbols::{IdentifierDatabase, OperationDatabase};

/// What a translation produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    /// Emit C++ and compile/link it into a shared library.
    SharedLibrary,
    /// Stop after emitting C++ source.
    SourceOnly,
}

/// A request to translate one worksheet.
#[derive(Clone, Debug)]
pub struct TranslationRequest {
    /// The worksheet to translate. Weak: the document may be closed while
    /// the request is queued, in which case translation fails.
    pub root: DocHandle,
    /// What to produce.
    pub output: OutputKind,
    /// Where the artifact goes.
    pub output_path: PathBuf,
    /// Whether to include debug instrumentation.
    pub debug: bool,
}

/// Everything the generator hands back on success.
#[derive(Clone, Debug)]
pub struct BuildArtifacts {
    /// Path of the compiled shared library (absent for source-only runs).
    pub library_path: Option<PathBuf>,
    /// Path of the emitted C++ source.
    pub source_path: PathBuf,
    /// Identifier symbol table for this build.
    pub identifiers: IdentifierDatabase,
    /// Operation symbol table for this build.
    pub operations: OperationDatabase,
    /// Output device names, indexed by the device index used on the ABI.
    pub devices: Vec<String>,
}

/// Translation lifecycle callbacks.
#[derive(Clone, Debug)]
pub enum GeneratorEvent {
    /// The generator became free; a waiting claim may now be granted.
    Idle,
    /// Translation of `root` began; `steps` elements will be translated.
    TranslationStarted {
        root: DocumentId,
        output: OutputKind,
        steps: u64,
    },
    /// Another translation step finished.
    StepCompleted { completed: u64 },
    /// Translation finished. `result` is `None` on failure.
    TranslationCompleted {
        root: DocumentId,
        result: Option<Box<BuildArtifacts>>,
    },
    /// A diagnostic was detected; does not by itself end the translation.
    TranslationError {
        root: DocumentId,
        diagnostic: Diagnostic,
    },
}

impl GeneratorEvent {
    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            GeneratorEvent::Idle => "Idle",
            GeneratorEvent::TranslationStarted { .. } => "TranslationStarted",
            GeneratorEvent::StepCompleted { .. } => "StepCompleted",
            GeneratorEvent::TranslationCompleted { .. } => "TranslationCompleted",
            GeneratorEvent::TranslationError { .. } => "TranslationError",
        }
    }
}

/// Errors surfaced synchronously by generator operations.
#[derive(Error, Debug)]
pub enum GeneratorError {
    /// `translate` was called without a successful claim.
    #[error("Generator is not owned by the caller")]
    NotOwned,

    /// A translation is already in flight.
    #[error("A translation is already in progress")]
    Busy,

    /// The generator worker is gone.
    #[error("Generator worker has shut down")]
    WorkerGone,
}

/// The single-owner borrow protocol plus asynchronous translation.
///
/// Implemented by the real `GeneratorService` in calcsheet-codegen and by
/// test doubles in the engine's tests.
pub trait CodeGenerator: Send {
    /// Try to claim exclusive ownership. On `false` the caller is queued
    /// and will receive [`GeneratorEvent::Idle`] on `events` when the
    /// generator frees up.
    fn claim(&mut self, events: Sender<EngineEvent>) -> bool;

    /// Release ownership, waking the next waiter if any.
    fn release(&mut self);

    /// Start translating. Events arrive on the channel given to `claim`.
    fn translate(&mut self, request: TranslationRequest) -> Result<(), GeneratorError>;

    /// Cancel the in-flight translation, if any. Late completion events
    /// for a cancelled request may still arrive and must be ignored by
    /// root-id comparison on the receiving side.
    fn cancel(&mut self);

    /// Whether a translation is currently in flight.
    fn busy(&self) -> bool;

    /// Shared progress counter for the current translation.
    fn progress(&self) -> Arc<TranslationProgress>;
}

/// Step counter shared between the generator worker and reader threads.
///
/// The worker bumps `completed` at high frequency while the controller or
/// a UI reads it. Readers use the re-read-and-compare idiom: load the
/// counter, load the total, then re-load the counter and retry if it
/// moved, so the returned pair is never torn across a step boundary.
#[derive(Debug, Default)]
pub struct TranslationProgress {
    completed: AtomicU64,
    total: AtomicU64,
}

impl TranslationProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new translation of `total` steps. Worker-side.
    pub fn begin(&self, total: u64) {
        self.completed.store(0, Ordering::Release);
        self.total.store(total, Ordering::Release);
    }

    /// Record one completed step. Worker-side.
    pub fn step(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Read `(completed, total)` without tearing.
    pub fn read(&self) -> (u64, u64) {
        loop {
            let completed = self.completed.load(Ordering::Acquire);
            let total = self.total.load(Ordering::Acquire);
            if self.completed.load(Ordering::Acquire) == completed {
                return (completed, total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_progress_begin_and_step() {
        let progress = TranslationProgress::new();
        progress.begin(3);
        assert_eq!(progress.read(), (0, 3));
        assert_eq!(progress.step(), 1);
        assert_eq!(progress.step(), 2);
        assert_eq!(progress.read(), (2, 3));
    }

    #[test]
    fn test_progress_concurrent_reads_are_consistent() {
        let progress = Arc::new(TranslationProgress::new());
        progress.begin(10_000);

        let writer = {
            let progress = progress.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    progress.step();
                }
            })
        };

        // Reads racing with the writer must never exceed the total.
        for _ in 0..1_000 {
            let (completed, total) = progress.read();
            assert!(completed <= total, "{} > {}", completed, total);
        }

        writer.join().unwrap();
        assert_eq!(progress.read(), (10_000, 10_000));
    }

    #[test]
    fn test_event_type_names() {
        let ev = GeneratorEvent::Idle;
        assert_eq!(ev.type_name(), "Idle");
        let ev = GeneratorEvent::StepCompleted { completed: 4 };
        assert_eq!(ev.type_name(), "StepCompleted");
    }
}
