//! Dynamic library loading for compiled models.
//!
//! A successful build produces a shared library exporting the
//! [`crate::abi`] entry points. [`LibraryLoader`] opens it, resolves the
//! symbols, and wraps them in a [`LoadedModel`] implementing
//! [`ModelApi`]. Dropping the model invokes the library's deallocator and
//! then releases the library handle, so the image is fully unloaded
//! before the same document's next build is loaded.

use std::os::raw::c_void;
use std::path::Path;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use libloading::Library;
use thiserror::Error;

use crate::abi::{self, AbortReason, ModelEventCode};
use crate::engine::EngineEvent;
use crate::runtime::{ModelApi, ModelError, RuntimeEvent};
use crate::symbols::{IdentifierHandle, OperationHandle};

/// Errors opening a compiled model library.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The library could not be opened.
    #[error("Failed to load model library {path}: {source}")]
    Open {
        path: String,
        source: libloading::Error,
    },

    /// A required ABI export is missing.
    #[error("Model library is missing symbol {name}: {source}")]
    MissingSymbol {
        name: String,
        source: libloading::Error,
    },
}

/// Loads compiled model libraries.
pub trait ModelLoader: Send {
    /// Load the library at `path` and wrap its runtime interface.
    fn load(&self, path: &Path) -> Result<Box<dyn ModelApi>, LoadError>;
}

/// The libloading-backed loader.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibraryLoader;

impl LibraryLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModelLoader for LibraryLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn ModelApi>, LoadError> {
        let library = unsafe { Library::new(path) }.map_err(|source| LoadError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let symbols = ModelSymbols::resolve(&library)?;
        log::info!("Loaded model library {}", path.display());
        Ok(Box::new(LoadedModel {
            _library: library,
            symbols,
            instance: std::ptr::null_mut(),
            callback_ctx: std::ptr::null_mut(),
            run_thread: None,
        }))
    }
}

/// Resolved ABI entry points. Plain fn pointers copied out of the
/// library; valid for as long as the `Library` stays alive.
struct ModelSymbols {
    create: abi::CreateFn,
    destroy: abi::DestroyFn,
    run: abi::RunFn,
    request_pause: abi::CommandFn,
    request_resume: abi::CommandFn,
    request_abort: abi::CommandFn,
    set_breakpoint: abi::SetBreakpointFn,
    set_run_to: abi::SetRunToFn,
    set_single_step: abi::SetSingleStepFn,
    set_watch: abi::SetWatchFn,
    update_identifier: abi::UpdateIdentifierFn,
    read_identifier: abi::ReadIdentifierFn,
}

impl ModelSymbols {
    fn resolve(library: &Library) -> Result<Self, LoadError> {
        unsafe fn get<T: Copy>(library: &Library, name: &[u8]) -> Result<T, LoadError> {
            unsafe {
                library
                    .get::<T>(name)
                    .map(|symbol| *symbol)
                    .map_err(|source| LoadError::MissingSymbol {
                        name: String::from_utf8_lossy(name).into_owned(),
                        source,
                    })
            }
        }
        unsafe {
            Ok(Self {
                create: get(library, abi::symbols::CREATE)?,
                destroy: get(library, abi::symbols::DESTROY)?,
                run: get(library, abi::symbols::RUN)?,
                request_pause: get(library, abi::symbols::REQUEST_PAUSE)?,
                request_resume: get(library, abi::symbols::REQUEST_RESUME)?,
                request_abort: get(library, abi::symbols::REQUEST_ABORT)?,
                set_breakpoint: get(library, abi::symbols::SET_BREAKPOINT)?,
                set_run_to: get(library, abi::symbols::SET_RUN_TO)?,
                set_single_step: get(library, abi::symbols::SET_SINGLE_STEP)?,
                set_watch: get(library, abi::symbols::SET_WATCH)?,
                update_identifier: get(library, abi::symbols::UPDATE_IDENTIFIER)?,
                read_identifier: get(library, abi::symbols::READ_IDENTIFIER)?,
            })
        }
    }
}

/// Heap context handed to the model as callback user data.
struct CallbackCtx {
    events: Sender<EngineEvent>,
}

/// Translates ABI callbacks into [`RuntimeEvent`]s.
///
/// Runs on the model's execution thread; it only decodes and enqueues.
unsafe extern "C" fn host_callback(
    user_data: *mut c_void,
    event: i32,
    operation: i32,
    identifier: i32,
    reason: i32,
    value: f64,
) {
    let ctx = unsafe { &*(user_data as *const CallbackCtx) };
    let operation_handle = (operation >= 0).then(|| OperationHandle(operation));
    let event = match ModelEventCode::from_raw(event) {
        Some(ModelEventCode::Started) => RuntimeEvent::Started,
        Some(ModelEventCode::Finished) => RuntimeEvent::Finished,
        Some(ModelEventCode::Aborted) => RuntimeEvent::Aborted {
            reason: AbortReason::from_raw(reason).unwrap_or(AbortReason::Internal),
            operation: operation_handle,
        },
        Some(ModelEventCode::PausedOnUserRequest) => RuntimeEvent::PausedOnUserRequest {
            operation: OperationHandle(operation),
        },
        Some(ModelEventCode::PausedAtOperation) => RuntimeEvent::PausedAtOperation {
            operation: OperationHandle(operation),
        },
        Some(ModelEventCode::PausedOnVariableUpdate) => RuntimeEvent::PausedOnVariableUpdate {
            operation: OperationHandle(operation),
            identifier: IdentifierHandle(identifier),
        },
        Some(ModelEventCode::Resumed) => RuntimeEvent::Resumed,
        Some(ModelEventCode::Output) => RuntimeEvent::Output {
            device: identifier.max(0) as usize,
            value,
        },
        None => {
            log::warn!("Model delivered unknown event code {}", event);
            return;
        }
    };
    // The engine may already be draining its channel down; a failed send
    // just means nobody is listening anymore.
    let _ = ctx.events.send(EngineEvent::Runtime(event));
}

/// A loaded, possibly running model.
pub struct LoadedModel {
    _library: Library,
    symbols: ModelSymbols,
    instance: *mut c_void,
    callback_ctx: *mut CallbackCtx,
    run_thread: Option<JoinHandle<()>>,
}

// The ABI requires every exported control function to be callable from
// the controller thread while the run thread executes; the generated
// runtime synchronizes through atomics.
unsafe impl Send for LoadedModel {}

struct RawInstance(*mut c_void);
unsafe impl Send for RawInstance {}

impl ModelApi for LoadedModel {
    fn start(&mut self, debug: bool, events: Sender<EngineEvent>) -> Result<(), ModelError> {
        if !self.instance.is_null() {
            return Err(ModelError::AlreadyRunning);
        }
        let ctx = Box::into_raw(Box::new(CallbackCtx { events }));
        let instance = unsafe { (self.symbols.create)(host_callback, ctx as *mut c_void) };
        if instance.is_null() {
            // Reclaim the context we just leaked to the model.
            drop(unsafe { Box::from_raw(ctx) });
            return Err(ModelError::CreateFailed);
        }
        self.instance = instance;
        self.callback_ctx = ctx;

        let run = self.symbols.run;
        let raw = RawInstance(instance);
        self.run_thread = Some(thread::spawn(move || {
            let raw = raw;
            let rc = unsafe { run(raw.0, debug as i32) };
            log::debug!("Model run thread finished with rc={}", rc);
        }));
        Ok(())
    }

    fn request_pause(&mut self) {
        if !self.instance.is_null() {
            unsafe { (self.symbols.request_pause)(self.instance) };
        }
    }

    fn resume(&mut self) {
        if !self.instance.is_null() {
            unsafe { (self.symbols.request_resume)(self.instance) };
        }
    }

    fn request_abort(&mut self) {
        if !self.instance.is_null() {
            unsafe { (self.symbols.request_abort)(self.instance) };
        }
    }

    fn set_instruction_breakpoint(&mut self, operation: OperationHandle, set: bool) -> bool {
        if self.instance.is_null() {
            return false;
        }
        unsafe { (self.symbols.set_breakpoint)(self.instance, operation.0, set as i32) != 0 }
    }

    fn set_run_to(&mut self, operation: Option<OperationHandle>) {
        if !self.instance.is_null() {
            let op = operation.map(|o| o.0).unwrap_or(-1);
            unsafe { (self.symbols.set_run_to)(self.instance, op) };
        }
    }

    fn set_single_step(&mut self, on: bool) {
        if !self.instance.is_null() {
            unsafe { (self.symbols.set_single_step)(self.instance, on as i32) };
        }
    }

    fn set_variable_watch(&mut self, identifier: IdentifierHandle, set: bool) -> bool {
        if self.instance.is_null() {
            return false;
        }
        unsafe { (self.symbols.set_watch)(self.instance, identifier.0, set as i32) != 0 }
    }

    fn update_identifier(&mut self, identifier: IdentifierHandle, value: f64) -> bool {
        if self.instance.is_null() {
            return false;
        }
        unsafe { (self.symbols.update_identifier)(self.instance, identifier.0, value) != 0 }
    }

    fn read_identifier(&self, identifier: IdentifierHandle) -> Option<f64> {
        if self.instance.is_null() {
            return None;
        }
        let mut out = 0.0_f64;
        let present =
            unsafe { (self.symbols.read_identifier)(self.instance, identifier.0, &mut out) };
        (present != 0).then_some(out)
    }
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        if !self.instance.is_null() {
            unsafe { (self.symbols.request_abort)(self.instance) };
            if let Some(handle) = self.run_thread.take() {
                let _ = handle.join();
            }
            unsafe { (self.symbols.destroy)(self.instance) };
            self.instance = std::ptr::null_mut();
        }
        if !self.callback_ctx.is_null() {
            drop(unsafe { Box::from_raw(self.callback_ctx) });
            self.callback_ctx = std::ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_library_fails() {
        let loader = LibraryLoader::new();
        let err = loader
            .load(Path::new("/nonexistent/model.so"))
            .err()
            .expect("loading a missing library must fail");
        assert!(matches!(err, LoadError::Open { .. }));
        assert!(err.to_string().contains("/nonexistent/model.so"));
    }
}
