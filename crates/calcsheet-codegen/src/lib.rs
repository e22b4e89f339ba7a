//! CalcSheet Codegen - Translates worksheets into native model libraries.
//!
//! This crate implements the code generator collaborator of the CalcSheet
//! engine:
//!
//! - **Emit** - Worksheet -> C++ translation (`emit_model`)
//! - **Toolchain** - Compiler discovery and invocation
//! - **Service** - [`GeneratorService`], the process-wide single-owner
//!   generator with a persistent worker thread
//!
//! The service implements the borrow protocol of
//! [`calcsheet_core::generator::CodeGenerator`]: one client owns it at a
//! time, translation runs asynchronously on the worker thread, and
//! lifecycle callbacks are delivered over the owning client's event
//! channel keyed by root document id.

pub mod emit;
pub mod errors;
pub mod toolchain;

pub use emit::{emit_model, step_count, EmittedModel};
pub use errors::{CodegenError, Result};
pub use toolchain::{CompileOutcome, Toolchain};

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use calcsheet_core::diag::Diagnostic;
use calcsheet_core::document::{DocumentRegistry, Worksheet};
use calcsheet_core::engine::EngineEvent;
use calcsheet_core::generator::{
    BuildArtifacts, CodeGenerator, GeneratorError, GeneratorEvent, OutputKind,
    TranslationProgress, TranslationRequest,
};

/// Commands for the worker thread.
enum WorkerCommand {
    Translate {
        request: TranslationRequest,
        events: Sender<EngineEvent>,
        generation: u64,
    },
    Shutdown,
}

#[derive(Default)]
struct ServiceState {
    /// Event channel of the current owner, if claimed.
    owner: Option<Sender<EngineEvent>>,
    /// Clients waiting for ownership.
    waiters: Vec<Sender<EngineEvent>>,
    /// Whether a translation is in flight on the worker.
    busy: bool,
}

/// The process-wide code generator.
///
/// Owns a persistent worker thread fed through a command channel:
/// callers enqueue requests, the worker translates and compiles, and
/// completion flows back as events on the owner's channel.
pub struct GeneratorService {
    state: Arc<Mutex<ServiceState>>,
    progress: Arc<TranslationProgress>,
    /// Bumped to cancel: the worker abandons work for older generations.
    generation: Arc<AtomicU64>,
    command_tx: Sender<WorkerCommand>,
    worker: Option<JoinHandle<()>>,
}

impl GeneratorService {
    /// Start the generator with a discovered toolchain.
    pub fn new(registry: DocumentRegistry) -> Result<Self> {
        let toolchain = Toolchain::discover()?;
        Ok(Self::with_toolchain(registry, Some(toolchain)))
    }

    /// Start the generator without a toolchain; only
    /// [`OutputKind::SourceOnly`] requests can succeed.
    pub fn source_only(registry: DocumentRegistry) -> Self {
        Self::with_toolchain(registry, None)
    }

    fn with_toolchain(registry: DocumentRegistry, toolchain: Option<Toolchain>) -> Self {
        let state = Arc::new(Mutex::new(ServiceState::default()));
        let progress = Arc::new(TranslationProgress::new());
        let generation = Arc::new(AtomicU64::new(0));
        let (command_tx, command_rx) = unbounded();

        let worker = {
            let state = state.clone();
            let progress = progress.clone();
            let generation = generation.clone();
            thread::spawn(move || {
                let mut worker = Worker {
                    registry,
                    toolchain,
                    state,
                    progress,
                    generation,
                };
                worker.run(command_rx);
            })
        };

        Self {
            state,
            progress,
            generation,
            command_tx,
            worker: Some(worker),
        }
    }
}

impl CodeGenerator for GeneratorService {
    fn claim(&mut self, events: Sender<EngineEvent>) -> bool {
        let mut state = self.state.lock().expect("Generator state lock poisoned");
        if state.owner.is_none() {
            state.owner = Some(events);
            true
        } else {
            log::debug!("Generator claim queued; owned elsewhere");
            state.waiters.push(events);
            false
        }
    }

    fn release(&mut self) {
        let mut state = self.state.lock().expect("Generator state lock poisoned");
        state.owner = None;
        // Everyone waiting races for the next claim; first caller wins.
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(EngineEvent::Generator(GeneratorEvent::Idle));
        }
    }

    fn translate(&mut self, request: TranslationRequest) -> std::result::Result<(), GeneratorError> {
        let events = {
            let mut state = self.state.lock().expect("Generator state lock poisoned");
            let Some(events) = state.owner.clone() else {
                return Err(GeneratorError::NotOwned);
            };
            state.busy = true;
            events
        };
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.command_tx
            .send(WorkerCommand::Translate {
                request,
                events,
                generation,
            })
            .map_err(|_| GeneratorError::WorkerGone)
    }

    fn cancel(&mut self) {
        // The worker abandons anything older at its next step boundary.
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn busy(&self) -> bool {
        self.state.lock().expect("Generator state lock poisoned").busy
    }

    fn progress(&self) -> Arc<TranslationProgress> {
        self.progress.clone()
    }
}

impl Drop for GeneratorService {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// The worker thread: translates one request at a time.
struct Worker {
    registry: DocumentRegistry,
    toolchain: Option<Toolchain>,
    state: Arc<Mutex<ServiceState>>,
    progress: Arc<TranslationProgress>,
    generation: Arc<AtomicU64>,
}

impl Worker {
    fn run(&mut self, commands: Receiver<WorkerCommand>) {
        while let Ok(command) = commands.recv() {
            match command {
                WorkerCommand::Shutdown => break,
                WorkerCommand::Translate {
                    request,
                    events,
                    generation,
                } => {
                    self.translate(request, &events, generation);
                    self.state
                        .lock()
                        .expect("Generator state lock poisoned")
                        .busy = false;
                }
            }
        }
        log::debug!("Generator worker exiting");
    }

    fn live(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn translate(&self, request: TranslationRequest, events: &Sender<EngineEvent>, generation: u64) {
        let root_id = request.root.id();
        let send = |event: GeneratorEvent| {
            let _ = events.send(EngineEvent::Generator(event));
        };

        let Some(sheet) = request.root.with_read(|s| s.clone()) else {
            log::debug!("Translation request for closed document {}", root_id);
            send(GeneratorEvent::TranslationError {
                root: root_id,
                diagnostic: Diagnostic::translation_error(
                    CodegenError::DocumentGone.to_string(),
                    None,
                ),
            });
            send(GeneratorEvent::TranslationCompleted {
                root: root_id,
                result: None,
            });
            return;
        };

        let steps = emit::step_count(&self.registry, &sheet);
        self.progress.begin(steps);
        send(GeneratorEvent::TranslationStarted {
            root: root_id,
            output: request.output,
            steps,
        });

        let emitted = self.emit_with_progress(&sheet, events, generation);
        let emitted = match emitted {
            EmitOutcome::Done(emitted) => emitted,
            EmitOutcome::Cancelled => {
                log::debug!("Translation of {} cancelled during emission", root_id);
                return;
            }
            EmitOutcome::Failed(errors) => {
                for diagnostic in errors {
                    send(GeneratorEvent::TranslationError {
                        root: root_id,
                        diagnostic,
                    });
                }
                send(GeneratorEvent::TranslationCompleted {
                    root: root_id,
                    result: None,
                });
                return;
            }
        };

        for diagnostic in &emitted.warnings {
            send(GeneratorEvent::TranslationError {
                root: root_id,
                diagnostic: diagnostic.clone(),
            });
        }

        let source_path = request.output_path.with_extension("cpp");
        if let Err(err) = fs::write(&source_path, &emitted.source) {
            send(GeneratorEvent::TranslationError {
                root: root_id,
                diagnostic: Diagnostic::translation_error(
                    format!("failed to write {}: {}", source_path.display(), err),
                    None,
                ),
            });
            send(GeneratorEvent::TranslationCompleted {
                root: root_id,
                result: None,
            });
            return;
        }

        if !self.live(generation) {
            log::debug!("Translation of {} cancelled before compile", root_id);
            return;
        }

        let library_path = match request.output {
            OutputKind::SourceOnly => None,
            OutputKind::SharedLibrary => {
                let Some(toolchain) = self.toolchain.as_ref() else {
                    send(GeneratorEvent::TranslationError {
                        root: root_id,
                        diagnostic: Diagnostic::translation_error(
                            CodegenError::NoCompiler.to_string(),
                            None,
                        ),
                    });
                    send(GeneratorEvent::TranslationCompleted {
                        root: root_id,
                        result: None,
                    });
                    return;
                };
                let outcome = toolchain.compile(
                    &source_path,
                    &request.output_path,
                    request.debug,
                    &emitted.line_map,
                );
                match outcome {
                    Ok(outcome) => {
                        for diagnostic in outcome.diagnostics {
                            send(GeneratorEvent::TranslationError {
                                root: root_id,
                                diagnostic,
                            });
                        }
                        if !outcome.success {
                            send(GeneratorEvent::TranslationCompleted {
                                root: root_id,
                                result: None,
                            });
                            return;
                        }
                        Some(request.output_path.clone())
                    }
                    Err(err) => {
                        send(GeneratorEvent::TranslationError {
                            root: root_id,
                            diagnostic: Diagnostic::translation_error(err.to_string(), None),
                        });
                        send(GeneratorEvent::TranslationCompleted {
                            root: root_id,
                            result: None,
                        });
                        return;
                    }
                }
            }
        };

        if !self.live(generation) {
            log::debug!("Translation of {} cancelled after compile", root_id);
            return;
        }

        send(GeneratorEvent::TranslationCompleted {
            root: root_id,
            result: Some(Box::new(BuildArtifacts {
                library_path,
                source_path,
                identifiers: emitted.identifiers,
                operations: emitted.operations,
                devices: emitted.devices,
            })),
        });
    }

    fn emit_with_progress(
        &self,
        sheet: &Worksheet,
        events: &Sender<EngineEvent>,
        generation: u64,
    ) -> EmitOutcome {
        let result = emit::emit_model(&self.registry, sheet, |_| {
            let completed = self.progress.step();
            let _ = events.send(EngineEvent::Generator(GeneratorEvent::StepCompleted {
                completed,
            }));
            self.live(generation)
        });
        match result {
            Ok(Some(emitted)) => EmitOutcome::Done(emitted),
            Ok(None) => EmitOutcome::Cancelled,
            Err(errors) => EmitOutcome::Failed(errors),
        }
    }
}

enum EmitOutcome {
    Done(EmittedModel),
    Cancelled,
    Failed(Vec<Diagnostic>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcsheet_core::document::{Calculation, ElementKind};
    use calcsheet_core::expr;
    use std::time::Duration;

    fn sheet(registry: &DocumentRegistry, calcs: &[(&str, &str)]) -> calcsheet_core::DocHandle {
        let id = registry.allocate_id();
        let mut sheet = Worksheet::new(id, "test");
        for (target, src) in calcs {
            sheet.push(ElementKind::Calculation(Calculation {
                target: target.to_string(),
                expr: expr::parse(src).unwrap(),
            }));
        }
        registry.insert(sheet)
    }

    fn drain_until_completed(
        rx: &Receiver<EngineEvent>,
        root: calcsheet_core::DocumentId,
    ) -> (Vec<&'static str>, Option<Box<BuildArtifacts>>) {
        let mut seen = Vec::new();
        loop {
            let event = rx
                .recv_timeout(Duration::from_secs(10))
                .expect("generator event");
            let EngineEvent::Generator(event) = event else {
                continue;
            };
            seen.push(event.type_name());
            if let GeneratorEvent::TranslationCompleted {
                root: done,
                result,
            } = event
            {
                if done == root {
                    return (seen, result);
                }
            }
        }
    }

    #[test]
    fn test_claim_is_exclusive_until_released() {
        let registry = DocumentRegistry::new();
        let mut service = GeneratorService::source_only(registry);
        let (tx_a, _rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();

        assert!(service.claim(tx_a));
        assert!(!service.claim(tx_b));

        service.release();
        // The waiter is told the generator is free again.
        let event = rx_b.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            event,
            EngineEvent::Generator(GeneratorEvent::Idle)
        ));
    }

    #[test]
    fn test_translate_requires_ownership() {
        let registry = DocumentRegistry::new();
        let doc = sheet(&registry, &[("x", "1")]);
        let mut service = GeneratorService::source_only(registry);
        let dir = tempfile::tempdir().unwrap();

        let request = TranslationRequest {
            root: doc,
            output: OutputKind::SourceOnly,
            output_path: dir.path().join("model.so"),
            debug: false,
        };
        assert!(matches!(
            service.translate(request),
            Err(GeneratorError::NotOwned)
        ));
    }

    #[test]
    fn test_source_only_translation_end_to_end() {
        let registry = DocumentRegistry::new();
        let doc = sheet(&registry, &[("x", "1"), ("y", "x * 3")]);
        let mut service = GeneratorService::source_only(registry);
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();

        assert!(service.claim(tx));
        service
            .translate(TranslationRequest {
                root: doc.clone(),
                output: OutputKind::SourceOnly,
                output_path: dir.path().join("model.so"),
                debug: true,
            })
            .unwrap();

        let (seen, result) = drain_until_completed(&rx, doc.id());
        assert_eq!(seen.first(), Some(&"TranslationStarted"));
        assert!(seen.contains(&"StepCompleted"));

        let artifacts = result.expect("source-only translation succeeds");
        assert!(artifacts.library_path.is_none());
        assert!(artifacts.source_path.exists());
        assert_eq!(artifacts.identifiers.len(), 2);
        assert_eq!(artifacts.operations.len(), 2);

        let source = fs::read_to_string(&artifacts.source_path).unwrap();
        assert!(source.contains("calcsheet_model_run"));

        let (completed, total) = service.progress().read();
        assert_eq!((completed, total), (2, 2));
        service.release();
    }

    #[test]
    fn test_translation_errors_fail_the_build() {
        let registry = DocumentRegistry::new();
        let doc = sheet(&registry, &[("x", "undefined_thing + 1")]);
        let mut service = GeneratorService::source_only(registry);
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();

        assert!(service.claim(tx));
        service
            .translate(TranslationRequest {
                root: doc.clone(),
                output: OutputKind::SourceOnly,
                output_path: dir.path().join("model.so"),
                debug: false,
            })
            .unwrap();

        let (seen, result) = drain_until_completed(&rx, doc.id());
        assert!(result.is_none());
        assert!(seen.contains(&"TranslationError"));
    }

    #[test]
    fn test_closed_document_fails_cleanly() {
        let registry = DocumentRegistry::new();
        let doc = sheet(&registry, &[("x", "1")]);
        registry.remove(doc.id());

        let mut service = GeneratorService::source_only(registry);
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        assert!(service.claim(tx));
        service
            .translate(TranslationRequest {
                root: doc.clone(),
                output: OutputKind::SourceOnly,
                output_path: dir.path().join("model.so"),
                debug: false,
            })
            .unwrap();

        let (_, result) = drain_until_completed(&rx, doc.id());
        assert!(result.is_none());
    }

    #[test]
    fn test_new_translation_supersedes_cancelled_one() {
        let registry = DocumentRegistry::new();
        let doc_a = sheet(&registry, &[("x", "1")]);
        let doc_b = sheet(&registry, &[("y", "2")]);
        let mut service = GeneratorService::source_only(registry);
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();

        assert!(service.claim(tx));
        service
            .translate(TranslationRequest {
                root: doc_a.clone(),
                output: OutputKind::SourceOnly,
                output_path: dir.path().join("a.so"),
                debug: false,
            })
            .unwrap();
        service.cancel();
        service
            .translate(TranslationRequest {
                root: doc_b.clone(),
                output: OutputKind::SourceOnly,
                output_path: dir.path().join("b.so"),
                debug: false,
            })
            .unwrap();

        // B must complete; A may at most have produced early events.
        let (_, result) = drain_until_completed(&rx, doc_b.id());
        assert!(result.is_some());
    }
}
