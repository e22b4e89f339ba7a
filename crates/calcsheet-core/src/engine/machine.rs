//! The build/execute state machine.
//!
//! One [`ExecutionEngine`] lives for the whole application. It owns the
//! build-then-run lifecycle of whichever worksheet is active: deciding
//! between rebuild and reuse, borrowing the shared code generator,
//! loading the compiled library, driving the running model, and fanning
//! state changes out to observers.
//!
//! Threading: every public method, including [`ExecutionEngine::process_pending`],
//! is called from one controller thread. Generator and runtime callbacks
//! arrive on other threads and only ever enqueue [`EngineEvent`]s; state
//! is touched exclusively while the controller drains the queue.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::diag::{Diagnostic, DiagnosticCode, Severity};
use crate::document::{DocHandle, DocumentId, DocumentRegistry, ElementId};
use crate::generator::{
    BuildArtifacts, CodeGenerator, GeneratorEvent, OutputKind, TranslationProgress,
    TranslationRequest,
};
use crate::loader::ModelLoader;
use crate::notify::{Notification, ObserverBus, ObserverId};
use crate::runtime::{ModelApi, RuntimeEvent};
use crate::symbols::{CalculatedValue, IdentifierHandle, OperationHandle};

use super::events::EngineEvent;
use super::state::ExecState;

/// A build bound to the engine: the artifact and the symbol snapshots
/// captured when it was produced.
struct BoundBuild {
    root: DocHandle,
    artifact: PathBuf,
    debug: bool,
    /// Root revision at translation start; a differing live revision
    /// means the artifact is stale.
    revision: u64,
    identifiers: crate::symbols::IdentifierDatabase,
    operations: crate::symbols::OperationDatabase,
    devices: Vec<String>,
    /// Set when an import (or the root, reported externally) was edited.
    stale: bool,
}

/// A run/step request in flight: being built, queued behind the
/// generator, or deferred behind an abort of the previous document.
struct PendingRun {
    root: DocHandle,
    debug: bool,
    run_to: Option<ElementId>,
    single_step: bool,
}

/// Why a pause event fired.
enum PauseKind {
    User,
    Operation,
    Variable(IdentifierHandle),
}

/// The build/execute state machine. One instance per application.
pub struct ExecutionEngine {
    registry: DocumentRegistry,
    generator: Box<dyn CodeGenerator>,
    loader: Box<dyn ModelLoader>,
    observers: ObserverBus,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
    output_dir: PathBuf,

    state: ExecState,
    target: ExecState,
    bound: Option<BoundBuild>,
    pending: Option<PendingRun>,
    /// Root id the in-flight translation belongs to; callbacks tagged
    /// with anything else are stale and discarded.
    building_root: Option<DocumentId>,
    building_revision: u64,
    building_import_stale: bool,
    claim_held: bool,

    model: Option<Box<dyn ModelApi>>,
    run_to: Option<ElementId>,
    single_step: bool,
    paused_element: Option<ElementId>,
    /// Values already reported to observers at a pause point.
    last_reported: HashMap<IdentifierHandle, f64>,
    /// Identifier names with armed watchpoints; re-applied on every load.
    watches: HashSet<String>,

    produced_artifacts: Vec<PathBuf>,
    shutdown_forced: bool,
    last_ready: Option<bool>,
    last_active: Option<bool>,
}

impl ExecutionEngine {
    /// Create the engine. `output_dir` is where build artifacts go.
    pub fn new(
        registry: DocumentRegistry,
        generator: Box<dyn CodeGenerator>,
        loader: Box<dyn ModelLoader>,
        output_dir: PathBuf,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            registry,
            generator,
            loader,
            observers: ObserverBus::new(),
            events_tx,
            events_rx,
            output_dir,
            state: ExecState::Idle,
            target: ExecState::Idle,
            bound: None,
            pending: None,
            building_root: None,
            building_revision: 0,
            building_import_stale: false,
            claim_held: false,
            model: None,
            run_to: None,
            single_step: false,
            paused_element: None,
            last_reported: HashMap::new(),
            watches: HashSet::new(),
            produced_artifacts: Vec::new(),
            shutdown_forced: false,
            last_ready: None,
            last_active: None,
        }
    }

    // === Observation ===

    /// Register an observer for outbound notifications.
    pub fn subscribe<F>(&mut self, observer: F) -> ObserverId
    where
        F: Fn(&Notification) + Send + 'static,
    {
        self.observers.subscribe(observer)
    }

    /// Unregister an observer.
    pub fn unsubscribe(&mut self, id: ObserverId) {
        self.observers.unsubscribe(id)
    }

    /// Current operating state.
    pub fn state(&self) -> ExecState {
        self.state
    }

    /// Desired operating state.
    pub fn target_state(&self) -> ExecState {
        self.target
    }

    /// Whether a loaded model is live.
    pub fn model_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Root document of the bound build, if any.
    pub fn current_root(&self) -> Option<DocumentId> {
        self.bound.as_ref().map(|b| b.root.id())
    }

    /// Path of the bound artifact, if any.
    pub fn current_artifact(&self) -> Option<&Path> {
        self.bound.as_ref().map(|b| b.artifact.as_path())
    }

    /// Whether the bound build has been invalidated by an edit.
    pub fn build_is_stale(&self) -> bool {
        self.bound.as_ref().map(|b| b.stale).unwrap_or(false)
    }

    /// Element the program counter is halted at, if paused.
    pub fn paused_element(&self) -> Option<ElementId> {
        self.paused_element
    }

    /// Run-to target of the current run, if one was requested.
    pub fn run_to_element(&self) -> Option<ElementId> {
        self.run_to
    }

    /// Whether the current run is in single-step mode.
    pub fn is_single_stepping(&self) -> bool {
        self.single_step
    }

    /// Whether the one-way shutdown latch has been set.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown_forced
    }

    /// Shared step counter of the current translation.
    pub fn translation_progress(&self) -> Arc<TranslationProgress> {
        self.generator.progress()
    }

    // === Public operations (controller thread) ===

    /// Request execution of `root`. Rebuilds first when the bound
    /// artifact is stale for this request; otherwise reuses it. Returns
    /// immediately; completion is observed via notifications.
    pub fn run(&mut self, root: &DocHandle, debug: bool, run_to: Option<ElementId>) {
        self.request_run(root.clone(), debug, run_to, false);
    }

    /// Like [`ExecutionEngine::run`] with single-step semantics forced
    /// on; implies a debug build if a rebuild is needed.
    pub fn step(&mut self, root: &DocHandle) {
        self.request_run(root.clone(), true, None, true);
    }

    /// Ask the running model to pause at its next safe point. A no-op
    /// outside `Running`.
    pub fn pause(&mut self) {
        if self.shutdown_forced || self.state != ExecState::Running {
            return;
        }
        if let Some(model) = self.model.as_mut() {
            model.request_pause();
            self.set_state(ExecState::Pausing);
        }
    }

    /// Resume a paused model, optionally installing a new run-to target.
    /// A no-op outside `Paused`.
    pub fn resume(&mut self, run_to: Option<ElementId>) {
        if self.shutdown_forced || self.state != ExecState::Paused {
            return;
        }
        self.clear_paused_decoration();
        let run_to_op = run_to.and_then(|el| self.operation_for(el));
        if let Some(model) = self.model.as_mut() {
            model.set_single_step(false);
            model.set_run_to(run_to_op);
            model.resume();
        }
        self.run_to = run_to;
        self.single_step = false;
        self.set_state(ExecState::Running);
        self.target = ExecState::Running;
    }

    /// Toggle between pause and resume based on the current state.
    pub fn pause_or_resume(&mut self) {
        match self.state {
            ExecState::Running => self.pause(),
            ExecState::Paused => self.resume(None),
            _ => {}
        }
    }

    /// Terminate the running or paused model, or cancel a pending build.
    pub fn abort(&mut self) {
        if self.shutdown_forced {
            return;
        }
        match self.state {
            ExecState::Running | ExecState::Pausing | ExecState::Paused => {
                if let Some(model) = self.model.as_mut() {
                    model.request_abort();
                }
                self.set_state(ExecState::Aborting);
                self.target = ExecState::Idle;
            }
            ExecState::WaitingToBuild | ExecState::Building => {
                self.generator.cancel();
                self.release_claim();
                self.pending = None;
                self.building_root = None;
                let rest = self.rest_state();
                self.set_state(rest);
                self.target = rest;
            }
            _ => {}
        }
    }

    /// Unconditional teardown, usable from any state. Sets the one-way
    /// shutdown latch; emits `NowShutdown` exactly once.
    pub fn shutdown_now(&mut self) {
        if self.shutdown_forced {
            return;
        }
        self.shutdown_forced = true;
        log::info!("Forced shutdown requested");

        if let Some(mut model) = self.model.take() {
            model.request_abort();
            // Dropping invokes the deallocator and unloads the library.
            drop(model);
        }
        self.clear_paused_decoration();
        self.generator.cancel();
        self.release_claim();
        self.pending = None;
        self.building_root = None;
        self.bound = None;
        self.last_reported.clear();

        for path in self.produced_artifacts.drain(..) {
            if path.exists() {
                if let Err(err) = fs::remove_file(&path) {
                    log::warn!("Failed to delete artifact {}: {}", path.display(), err);
                }
            }
        }

        self.state = ExecState::Idle;
        self.target = ExecState::Idle;
        self.publish_activity();
        self.observers.publish(&Notification::NowShutdown);
    }

    /// Set or clear the instruction breakpoint on a worksheet element,
    /// propagating the change into the live model when one is running.
    pub fn set_instruction_breakpoint(&mut self, root: &DocHandle, element: ElementId, set: bool) {
        let known = root
            .with_write(|sheet| sheet.set_breakpoint(element, set))
            .unwrap_or(false);
        if !known {
            return;
        }
        // Best-effort live update; only possible for the bound document.
        if self.current_root() == Some(root.id()) && self.state.has_model() {
            if let Some(op) = self.operation_for(element) {
                if let Some(model) = self.model.as_mut() {
                    model.set_instruction_breakpoint(op, set);
                }
            }
        }
    }

    /// Clear the instruction breakpoint on a worksheet element.
    pub fn clear_instruction_breakpoint(&mut self, root: &DocHandle, element: ElementId) {
        self.set_instruction_breakpoint(root, element, false);
    }

    /// Clear every instruction breakpoint on the bound document.
    pub fn clear_all_instruction_breakpoints(&mut self) {
        let Some(bound) = self.bound.as_ref() else {
            return;
        };
        bound.root.with_write(|sheet| sheet.clear_all_breakpoints());
        if self.state.has_model() {
            let ops: Vec<OperationHandle> = self
                .bound
                .as_ref()
                .map(|b| b.operations.entries().iter().map(|e| e.handle).collect())
                .unwrap_or_default();
            if let Some(model) = self.model.as_mut() {
                for op in ops {
                    model.set_instruction_breakpoint(op, false);
                }
            }
        }
    }

    /// Arm or disarm a watchpoint on an identifier. The watch survives
    /// rebuilds; it is re-applied whenever a model is loaded.
    pub fn set_variable_watch(&mut self, name: &str, set: bool) -> bool {
        if set {
            self.watches.insert(name.to_string());
        } else {
            self.watches.remove(name);
        }
        if self.state.has_model() {
            let handle = match self.bound.as_ref().and_then(|b| b.identifiers.by_name(name)) {
                Some(entry) => entry.handle,
                None => return false,
            };
            if let Some(model) = self.model.as_mut() {
                return model.set_variable_watch(handle, set);
            }
        }
        true
    }

    /// Push an edited value into the paused model. Returns `false` when
    /// no identifier mapping exists for the value's name or the model is
    /// not in a state that accepts writes.
    pub fn update_variable(&mut self, value: &CalculatedValue) -> bool {
        if self.shutdown_forced || self.state != ExecState::Paused {
            return false;
        }
        let handle = match self
            .bound
            .as_ref()
            .and_then(|b| b.identifiers.by_name(&value.name))
        {
            Some(entry) => entry.handle,
            None => return false,
        };
        match self.model.as_mut() {
            Some(model) => model.update_identifier(handle, value.value),
            None => false,
        }
    }

    /// The document layer reports an edit. Invalidates the bound build
    /// when the edited document is the root or anything it transitively
    /// imports; edits elsewhere are ignored.
    pub fn root_element_changed(&mut self, edited: DocumentId) {
        if let Some(root) = self.building_root {
            if self.registry.edit_affects(root, edited) {
                self.building_import_stale = true;
            }
        }
        if let Some(bound) = self.bound.as_mut() {
            let root = bound.root.id();
            if self.registry.edit_affects(root, edited) {
                log::debug!("Build for {} invalidated by edit to {}", root, edited);
                bound.stale = true;
            }
        }
    }

    /// Drain and apply queued generator/runtime events. Must be called
    /// from the controller thread; this is the only place callbacks are
    /// allowed to mutate engine state.
    pub fn process_pending(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            log::trace!("Engine event: {}", event.type_name());
            if self.shutdown_forced {
                continue;
            }
            match event {
                EngineEvent::Generator(ev) => self.handle_generator_event(ev),
                EngineEvent::Runtime(ev) => self.handle_runtime_event(ev),
            }
        }
    }

    // === Request handling ===

    fn request_run(
        &mut self,
        root: DocHandle,
        debug: bool,
        run_to: Option<ElementId>,
        single_step: bool,
    ) {
        if self.shutdown_forced {
            return;
        }

        // Step while paused on the same document is a single-step resume.
        if single_step
            && self.state == ExecState::Paused
            && self.current_root() == Some(root.id())
        {
            self.clear_paused_decoration();
            if let Some(model) = self.model.as_mut() {
                model.set_single_step(true);
                model.resume();
            }
            self.single_step = true;
            self.set_state(ExecState::Running);
            self.target = ExecState::Running;
            return;
        }

        let request = PendingRun {
            root,
            debug,
            run_to,
            single_step,
        };

        match self.state {
            ExecState::Running | ExecState::Pausing | ExecState::Paused => {
                if self.current_root() == Some(request.root.id()) {
                    log::debug!("Run request for the active document ignored");
                    return;
                }
                // A different document: abort the current run and defer.
                if let Some(model) = self.model.as_mut() {
                    model.request_abort();
                }
                self.pending = Some(request);
                self.set_state(ExecState::Aborting);
                self.target = ExecState::Running;
            }
            ExecState::Aborting => {
                // Last request wins.
                self.pending = Some(request);
                self.target = ExecState::Running;
            }
            ExecState::WaitingToBuild | ExecState::Building => {
                self.supersede_build(request);
            }
            ExecState::Idle | ExecState::BuildReady => {
                self.start_request(request);
            }
        }
    }

    fn start_request(&mut self, request: PendingRun) {
        self.target = ExecState::Running;
        if self.needs_rebuild(&request) {
            if !directory_writable(&self.output_dir) {
                log::warn!(
                    "Build directory {} is not writable; request dropped",
                    self.output_dir.display()
                );
                self.observers.publish(&Notification::DirectoryReadOnly {
                    path: self.output_dir.clone(),
                });
                self.target = self.state;
                return;
            }
            self.begin_build(request);
        } else {
            self.load_and_start(request);
        }
    }

    fn needs_rebuild(&self, request: &PendingRun) -> bool {
        let Some(bound) = self.bound.as_ref() else {
            return true;
        };
        if bound.root.id() != request.root.id() || bound.debug != request.debug || bound.stale {
            return true;
        }
        let live_revision = request.root.with_read(|sheet| sheet.revision);
        match live_revision {
            Some(revision) if revision == bound.revision => !bound.artifact.exists(),
            _ => true,
        }
    }

    fn begin_build(&mut self, request: PendingRun) {
        let revision = match request.root.with_read(|sheet| sheet.revision) {
            Some(revision) => revision,
            None => {
                // Document closed under us; nothing to build.
                log::debug!("Run request for a closed document discarded");
                self.target = self.state;
                return;
            }
        };
        self.building_revision = revision;
        self.building_import_stale = false;
        self.building_root = Some(request.root.id());
        self.pending = Some(request);
        if self.generator.claim(self.events_tx.clone()) {
            self.claim_held = true;
            self.begin_translation();
        } else {
            log::debug!("Code generator busy; waiting to build");
            self.set_state(ExecState::WaitingToBuild);
        }
    }

    /// Replace the queued/in-flight build request (last request wins;
    /// the superseded request is discarded without notification).
    fn supersede_build(&mut self, request: PendingRun) {
        let revision = match request.root.with_read(|sheet| sheet.revision) {
            Some(revision) => revision,
            None => return,
        };
        log::debug!(
            "Build request superseded: {} replaces {:?}",
            request.root.id(),
            self.building_root
        );
        if self.state == ExecState::Building {
            self.generator.cancel();
        }
        self.building_revision = revision;
        self.building_import_stale = false;
        self.building_root = Some(request.root.id());
        self.pending = Some(request);
        self.target = ExecState::Running;
        if self.state == ExecState::Building {
            // Still the owner; start over with the new request.
            self.begin_translation();
        }
    }

    fn begin_translation(&mut self) {
        let Some(request) = self.pending.as_ref() else {
            return;
        };
        let translation = TranslationRequest {
            root: request.root.clone(),
            output: OutputKind::SharedLibrary,
            output_path: self.artifact_path(request.root.id()),
            debug: request.debug,
        };
        let root = request.root.id();
        match self.generator.translate(translation) {
            Ok(()) => self.set_state(ExecState::Building),
            Err(err) => {
                log::error!("Failed to start translation: {}", err);
                self.release_claim();
                self.pending = None;
                self.building_root = None;
                self.observers.publish(&Notification::DiagnosticsReported {
                    root,
                    diagnostics: vec![Diagnostic::translation_error(err.to_string(), None)],
                });
                let rest = self.rest_state();
                self.set_state(rest);
                self.target = rest;
            }
        }
    }

    fn artifact_path(&self, root: DocumentId) -> PathBuf {
        self.output_dir.join(format!(
            "calcsheet_model_{}.{}",
            root.0,
            std::env::consts::DLL_EXTENSION
        ))
    }

    // === Generator events ===

    fn handle_generator_event(&mut self, event: GeneratorEvent) {
        match event {
            GeneratorEvent::Idle => {
                if self.state == ExecState::WaitingToBuild
                    && self.generator.claim(self.events_tx.clone())
                {
                    self.claim_held = true;
                    self.begin_translation();
                }
            }
            GeneratorEvent::TranslationStarted {
                root,
                output,
                steps,
            } => {
                if self.building_root != Some(root) {
                    log::debug!("Stale TranslationStarted for {} discarded", root);
                    return;
                }
                log::info!(
                    "Translation of {} started: {:?}, {} steps",
                    root,
                    output,
                    steps
                );
            }
            GeneratorEvent::StepCompleted { .. } => {
                // Progress is mirrored through the shared counter.
            }
            GeneratorEvent::TranslationError { root, diagnostic } => {
                if self.building_root != Some(root) {
                    return;
                }
                self.observers.publish(&Notification::DiagnosticsReported {
                    root,
                    diagnostics: vec![diagnostic],
                });
            }
            GeneratorEvent::TranslationCompleted { root, result } => {
                if self.building_root != Some(root) {
                    log::debug!("Stale TranslationCompleted for {} discarded", root);
                    return;
                }
                self.building_root = None;
                self.release_claim();
                self.finish_translation(root, result);
            }
        }
    }

    fn finish_translation(&mut self, root: DocumentId, result: Option<Box<BuildArtifacts>>) {
        let artifacts = match result {
            Some(artifacts) => artifacts,
            None => {
                log::warn!("Translation of {} failed", root);
                self.pending = None;
                let rest = self.rest_state();
                self.set_state(rest);
                self.target = rest;
                return;
            }
        };
        let library_path = match artifacts.library_path.clone() {
            Some(path) => path,
            None => {
                log::error!("Translation of {} produced no library", root);
                self.pending = None;
                let rest = self.rest_state();
                self.set_state(rest);
                self.target = rest;
                return;
            }
        };
        let Some(request) = self.pending.take() else {
            // Superseded at the last moment; artifact is left unbound.
            let rest = self.rest_state();
            self.set_state(rest);
            return;
        };

        // This build replaces whatever was bound before it.
        if let Some(previous) = self.bound.take() {
            if previous.artifact != library_path && previous.artifact.exists() {
                if let Err(err) = fs::remove_file(&previous.artifact) {
                    log::warn!(
                        "Failed to delete superseded artifact {}: {}",
                        previous.artifact.display(),
                        err
                    );
                }
                self.produced_artifacts.retain(|p| *p != previous.artifact);
            }
        }
        if !self.produced_artifacts.contains(&library_path) {
            self.produced_artifacts.push(library_path.clone());
        }
        self.bound = Some(BoundBuild {
            root: request.root.clone(),
            artifact: library_path,
            debug: request.debug,
            revision: self.building_revision,
            identifiers: artifacts.identifiers,
            operations: artifacts.operations,
            devices: artifacts.devices,
            stale: self.building_import_stale,
        });
        self.set_state(ExecState::BuildReady);

        if self.target == ExecState::Running {
            self.load_and_start(request);
        }
    }

    // === Load and run ===

    fn load_and_start(&mut self, request: PendingRun) {
        let (root, artifact, debug) = match self.bound.as_ref() {
            Some(bound) => (bound.root.id(), bound.artifact.clone(), bound.debug),
            None => {
                self.set_state(ExecState::Idle);
                self.target = ExecState::Idle;
                return;
            }
        };
        if self.bound.as_ref().and_then(|b| b.root.upgrade()).is_none() {
            // Document closed between build and run.
            log::debug!("Document {} closed before run; unbinding", root);
            self.bound = None;
            self.set_state(ExecState::Idle);
            self.target = ExecState::Idle;
            return;
        }

        let mut model = match self.loader.load(&artifact) {
            Ok(model) => model,
            Err(err) => {
                log::error!("{}", err);
                self.observers.publish(&Notification::DiagnosticsReported {
                    root,
                    diagnostics: vec![Diagnostic {
                        severity: Severity::Error,
                        code: DiagnosticCode::LoadFailure,
                        message: err.to_string(),
                        element: None,
                    }],
                });
                self.bound = None;
                self.set_state(ExecState::Idle);
                self.target = ExecState::Idle;
                return;
            }
        };

        // Install annotations before execution begins.
        if let Some(bound) = self.bound.as_ref() {
            let breakpoints: Vec<OperationHandle> = bound
                .root
                .with_read(|sheet| {
                    sheet
                        .elements
                        .iter()
                        .filter(|el| el.breakpoint)
                        .filter_map(|el| bound.operations.by_element(el.id))
                        .collect()
                })
                .unwrap_or_default();
            for op in breakpoints {
                model.set_instruction_breakpoint(op, true);
            }
            for name in &self.watches {
                if let Some(entry) = bound.identifiers.by_name(name) {
                    model.set_variable_watch(entry.handle, true);
                }
            }
            if let Some(element) = request.run_to {
                if let Some(op) = bound.operations.by_element(element) {
                    model.set_run_to(Some(op));
                }
            }
        }
        model.set_single_step(request.single_step);

        match model.start(debug, self.events_tx.clone()) {
            Ok(()) => {
                self.model = Some(model);
                self.run_to = request.run_to;
                self.single_step = request.single_step;
                self.last_reported.clear();
                self.set_state(ExecState::Running);
                self.target = ExecState::Running;
            }
            Err(err) => {
                log::error!("Failed to start model: {}", err);
                self.observers.publish(&Notification::DiagnosticsReported {
                    root,
                    diagnostics: vec![Diagnostic {
                        severity: Severity::Error,
                        code: DiagnosticCode::LoadFailure,
                        message: err.to_string(),
                        element: None,
                    }],
                });
                let rest = self.rest_state();
                self.set_state(rest);
                self.target = rest;
            }
        }
    }

    // === Runtime events ===

    fn handle_runtime_event(&mut self, event: RuntimeEvent) {
        if self.model.is_none() {
            // Late callback after a forced teardown.
            log::debug!("Runtime event {} with no model discarded", event.type_name());
            return;
        }
        let Some(root) = self.current_root() else {
            return;
        };
        match event {
            RuntimeEvent::Started => {
                let debug = self.bound.as_ref().map(|b| b.debug).unwrap_or(false);
                self.observers
                    .publish(&Notification::Running { root, debug });
            }
            RuntimeEvent::Finished => {
                self.finish_run(root, false);
            }
            RuntimeEvent::Aborted { reason, operation } => {
                let element = operation.and_then(|op| self.element_for(op));
                self.observers.publish(&Notification::DiagnosticsReported {
                    root,
                    diagnostics: vec![Diagnostic::from_abort(reason, element)],
                });
                self.finish_run(root, true);
            }
            RuntimeEvent::PausedOnUserRequest { operation } => {
                self.enter_paused(root, operation, PauseKind::User);
            }
            RuntimeEvent::PausedAtOperation { operation } => {
                self.enter_paused(root, operation, PauseKind::Operation);
            }
            RuntimeEvent::PausedOnVariableUpdate {
                operation,
                identifier,
            } => {
                self.enter_paused(root, operation, PauseKind::Variable(identifier));
            }
            RuntimeEvent::Resumed => {
                if self.state == ExecState::Running {
                    self.observers.publish(&Notification::Resumed { root });
                }
            }
            RuntimeEvent::Output { device, value } => {
                let device = self
                    .bound
                    .as_ref()
                    .and_then(|b| b.devices.get(device).cloned())
                    .unwrap_or_else(|| format!("device{}", device));
                self.observers
                    .publish(&Notification::OutputToDevice { device, value });
            }
        }
    }

    fn enter_paused(&mut self, root: DocumentId, operation: OperationHandle, kind: PauseKind) {
        if !matches!(self.state, ExecState::Running | ExecState::Pausing) {
            // Pause confirmations racing an abort are dropped.
            log::debug!("Pause event in state {} discarded", self.state);
            return;
        }
        let element = self.element_for(operation);
        self.decorate_paused_element(element);
        self.set_state(ExecState::Paused);
        self.target = ExecState::Paused;

        let changed = self.collect_changed_identifiers();
        let notification = match kind {
            PauseKind::User => Notification::PausedOnUserRequest {
                root,
                element,
                changed,
            },
            PauseKind::Operation => Notification::PausedAtBreakpoint {
                root,
                element,
                changed,
            },
            PauseKind::Variable(identifier) => {
                let info = self.identifier_info(identifier);
                Notification::PausedOnVariableUpdate {
                    root,
                    element,
                    identifier: info,
                    changed,
                }
            }
        };
        self.observers.publish(&notification);
    }

    /// Diff current identifier values against the last report and record
    /// the new snapshot.
    fn collect_changed_identifiers(&mut self) -> Vec<CalculatedValue> {
        let mut changed = Vec::new();
        if let (Some(bound), Some(model)) = (self.bound.as_ref(), self.model.as_ref()) {
            for entry in bound.identifiers.entries() {
                let Some(value) = model.read_identifier(entry.handle) else {
                    continue;
                };
                let fresh = self
                    .last_reported
                    .get(&entry.handle)
                    .map(|previous| *previous != value)
                    .unwrap_or(true);
                if fresh {
                    changed.push((entry.handle, CalculatedValue::new(&entry.name, value)));
                }
            }
        }
        let mut out = Vec::with_capacity(changed.len());
        for (handle, value) in changed {
            self.last_reported.insert(handle, value.value);
            out.push(value);
        }
        out
    }

    fn identifier_info(&self, identifier: IdentifierHandle) -> CalculatedValue {
        let name = self
            .bound
            .as_ref()
            .and_then(|b| b.identifiers.by_handle(identifier))
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| format!("identifier{}", identifier.0));
        let value = self
            .model
            .as_ref()
            .and_then(|m| m.read_identifier(identifier))
            .unwrap_or(f64::NAN);
        CalculatedValue::new(name, value)
    }

    fn finish_run(&mut self, root: DocumentId, aborted: bool) {
        self.teardown_model();
        let rest = self.rest_state();
        self.set_state(rest);
        self.target = rest;
        if aborted {
            self.observers.publish(&Notification::Aborted { root });
        } else {
            self.observers.publish(&Notification::Stopped { root });
        }
        if let Some(request) = self.pending.take() {
            self.start_request(request);
        }
    }

    // === Internals ===

    fn teardown_model(&mut self) {
        self.clear_paused_decoration();
        // Dropping the model invokes the deallocator and unloads the
        // library; nothing else may hold the image.
        self.model = None;
        self.last_reported.clear();
        self.run_to = None;
        self.single_step = false;
    }

    /// State to come to rest in when nothing is building or running.
    fn rest_state(&mut self) -> ExecState {
        match self.bound.as_ref() {
            Some(bound) if bound.root.upgrade().is_some() => ExecState::BuildReady,
            Some(_) => {
                // Artifact retained on disk, but the document is gone.
                self.bound = None;
                ExecState::Idle
            }
            None => ExecState::Idle,
        }
    }

    fn release_claim(&mut self) {
        if self.claim_held {
            self.generator.release();
            self.claim_held = false;
        }
        // A queued claim stays queued; the Idle event it eventually
        // produces is ignored unless the engine is waiting again.
    }

    fn operation_for(&self, element: ElementId) -> Option<OperationHandle> {
        self.bound.as_ref().and_then(|b| b.operations.by_element(element))
    }

    fn element_for(&self, operation: OperationHandle) -> Option<ElementId> {
        self.bound.as_ref().and_then(|b| b.operations.by_handle(operation))
    }

    fn decorate_paused_element(&mut self, element: Option<ElementId>) {
        self.clear_paused_decoration();
        let (Some(bound), Some(element)) = (self.bound.as_ref(), element) else {
            return;
        };
        bound.root.with_write(|sheet| {
            if let Some(el) = sheet.element_mut(element) {
                el.paused_marker = true;
            }
        });
        self.paused_element = Some(element);
    }

    fn clear_paused_decoration(&mut self) {
        let Some(element) = self.paused_element.take() else {
            return;
        };
        if let Some(bound) = self.bound.as_ref() {
            bound.root.with_write(|sheet| {
                if let Some(el) = sheet.element_mut(element) {
                    el.paused_marker = false;
                }
            });
        }
    }

    fn set_state(&mut self, state: ExecState) {
        if self.state != state {
            log::debug!("State {} -> {}", self.state, state);
            self.state = state;
        }
        self.publish_activity();
    }

    fn publish_activity(&mut self) {
        let ready = !self.shutdown_forced && self.state.accepts_run();
        let active = !self.shutdown_forced && self.state.is_active();
        if self.last_ready != Some(ready) {
            self.last_ready = Some(ready);
            self.observers.publish(&Notification::Ready(ready));
        }
        if self.last_active != Some(active) {
            self.last_active = Some(active);
            self.observers.publish(&Notification::Active(active));
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("state", &self.state)
            .field("target", &self.target)
            .field("root", &self.current_root())
            .field("model", &self.model.is_some())
            .finish_non_exhaustive()
    }
}

/// Probe whether `dir` can take a new build artifact.
fn directory_writable(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(format!(".calcsheet-probe-{}", std::process::id()));
    match fs::File::create(&probe) {
        Ok(file) => {
            drop(file);
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
