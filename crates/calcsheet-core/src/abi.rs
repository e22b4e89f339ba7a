//! C ABI contract between the host and generated model libraries.
//!
//! The code generator emits C++ that implements this contract, and the
//! loader resolves it back out of the compiled library. Keeping both
//! sides pinned to one module is what keeps the enumerations below in
//! sync: the emitter writes these numeric values into the generated
//! source and the host decodes the same values out of callbacks.
//!
//! Thread-safety contract: every exported control function may be called
//! from the host controller thread while the model's run thread is inside
//! `calcsheet_model_run`; the generated code uses atomics for all shared
//! control words. The host callback may fire from the model's run thread
//! and must therefore only enqueue.

use std::os::raw::c_void;

/// Symbol names exported by every generated model library.
pub mod symbols {
    pub const CREATE: &[u8] = b"calcsheet_model_create";
    pub const DESTROY: &[u8] = b"calcsheet_model_destroy";
    pub const RUN: &[u8] = b"calcsheet_model_run";
    pub const REQUEST_PAUSE: &[u8] = b"calcsheet_model_request_pause";
    pub const REQUEST_RESUME: &[u8] = b"calcsheet_model_request_resume";
    pub const REQUEST_ABORT: &[u8] = b"calcsheet_model_request_abort";
    pub const SET_BREAKPOINT: &[u8] = b"calcsheet_model_set_breakpoint";
    pub const SET_RUN_TO: &[u8] = b"calcsheet_model_set_run_to";
    pub const SET_SINGLE_STEP: &[u8] = b"calcsheet_model_set_single_step";
    pub const SET_WATCH: &[u8] = b"calcsheet_model_set_watch";
    pub const UPDATE_IDENTIFIER: &[u8] = b"calcsheet_model_update_identifier";
    pub const READ_IDENTIFIER: &[u8] = b"calcsheet_model_read_identifier";
}

/// Event codes delivered through the host callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ModelEventCode {
    Started = 1,
    Finished = 2,
    Aborted = 3,
    PausedOnUserRequest = 4,
    PausedAtOperation = 5,
    PausedOnVariableUpdate = 6,
    Resumed = 7,
    Output = 8,
}

impl ModelEventCode {
    /// Decode an ABI event code.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(ModelEventCode::Started),
            2 => Some(ModelEventCode::Finished),
            3 => Some(ModelEventCode::Aborted),
            4 => Some(ModelEventCode::PausedOnUserRequest),
            5 => Some(ModelEventCode::PausedAtOperation),
            6 => Some(ModelEventCode::PausedOnVariableUpdate),
            7 => Some(ModelEventCode::Resumed),
            8 => Some(ModelEventCode::Output),
            _ => None,
        }
    }
}

/// Why a model run terminated abnormally.
///
/// The numeric values cross the C ABI: generated code reports them in the
/// `Aborted` callback, and [`crate::diag::DiagnosticCode`] mirrors every
/// variant through an exhaustive `match`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AbortReason {
    /// The host asked the model to stop.
    UserRequest = 0,
    /// The model failed to allocate memory.
    OutOfMemory = 1,
    /// A file operation inside the model failed.
    FileIo = 2,
    /// Division by zero, domain error, or a non-finite intermediate.
    InvalidNumeric = 3,
    /// Matrix operands with incompatible dimensions.
    MatrixDimension = 4,
    /// An operand had the wrong type for the operation.
    TypeMismatch = 5,
    /// An iterative solver failed to converge.
    ConvergenceFailure = 6,
    /// The model runtime hit an internal fault.
    Internal = 7,
}

impl AbortReason {
    /// Every reason, for test-time exhaustiveness checks.
    pub const ALL: [AbortReason; 8] = [
        AbortReason::UserRequest,
        AbortReason::OutOfMemory,
        AbortReason::FileIo,
        AbortReason::InvalidNumeric,
        AbortReason::MatrixDimension,
        AbortReason::TypeMismatch,
        AbortReason::ConvergenceFailure,
        AbortReason::Internal,
    ];

    /// Decode an ABI abort reason.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(AbortReason::UserRequest),
            1 => Some(AbortReason::OutOfMemory),
            2 => Some(AbortReason::FileIo),
            3 => Some(AbortReason::InvalidNumeric),
            4 => Some(AbortReason::MatrixDimension),
            5 => Some(AbortReason::TypeMismatch),
            6 => Some(AbortReason::ConvergenceFailure),
            7 => Some(AbortReason::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AbortReason::UserRequest => "aborted on user request",
            AbortReason::OutOfMemory => "out of memory",
            AbortReason::FileIo => "file I/O error",
            AbortReason::InvalidNumeric => "invalid numeric operation",
            AbortReason::MatrixDimension => "matrix dimension mismatch",
            AbortReason::TypeMismatch => "type mismatch",
            AbortReason::ConvergenceFailure => "convergence failure",
            AbortReason::Internal => "internal runtime fault",
        };
        f.write_str(text)
    }
}

/// Host callback installed at model creation.
///
/// Arguments: user data, event code, operation handle (or -1), identifier
/// handle / output device index (or -1), abort reason (or -1), value.
pub type HostCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    event: i32,
    operation: i32,
    identifier: i32,
    reason: i32,
    value: f64,
);

/// `calcsheet_model_create(callback, user_data) -> instance`
pub type CreateFn = unsafe extern "C" fn(HostCallback, *mut c_void) -> *mut c_void;
/// `calcsheet_model_destroy(instance)` - the deallocator function.
pub type DestroyFn = unsafe extern "C" fn(*mut c_void);
/// `calcsheet_model_run(instance, debug) -> 0 on normal completion`
pub type RunFn = unsafe extern "C" fn(*mut c_void, i32) -> i32;
/// `calcsheet_model_request_pause/resume/abort(instance)`
pub type CommandFn = unsafe extern "C" fn(*mut c_void);
/// `calcsheet_model_set_breakpoint(instance, op, set) -> 1 if accepted`
pub type SetBreakpointFn = unsafe extern "C" fn(*mut c_void, i32, i32) -> i32;
/// `calcsheet_model_set_run_to(instance, op_or_minus_one)`
pub type SetRunToFn = unsafe extern "C" fn(*mut c_void, i32);
/// `calcsheet_model_set_single_step(instance, on)`
pub type SetSingleStepFn = unsafe extern "C" fn(*mut c_void, i32);
/// `calcsheet_model_set_watch(instance, ident, set) -> 1 if accepted`
pub type SetWatchFn = unsafe extern "C" fn(*mut c_void, i32, i32) -> i32;
/// `calcsheet_model_update_identifier(instance, ident, value) -> 1 if accepted`
pub type UpdateIdentifierFn = unsafe extern "C" fn(*mut c_void, i32, f64) -> i32;
/// `calcsheet_model_read_identifier(instance, ident, out) -> 1 if present`
pub type ReadIdentifierFn = unsafe extern "C" fn(*mut c_void, i32, *mut f64) -> i32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_code_roundtrip() {
        for code in [
            ModelEventCode::Started,
            ModelEventCode::Finished,
            ModelEventCode::Aborted,
            ModelEventCode::PausedOnUserRequest,
            ModelEventCode::PausedAtOperation,
            ModelEventCode::PausedOnVariableUpdate,
            ModelEventCode::Resumed,
            ModelEventCode::Output,
        ] {
            assert_eq!(ModelEventCode::from_raw(code as i32), Some(code));
        }
        assert_eq!(ModelEventCode::from_raw(0), None);
        assert_eq!(ModelEventCode::from_raw(99), None);
    }

    #[test]
    fn test_abort_reason_roundtrip_is_exhaustive() {
        for reason in AbortReason::ALL {
            assert_eq!(AbortReason::from_raw(reason as i32), Some(reason));
        }
        assert_eq!(AbortReason::from_raw(-1), None);
        assert_eq!(AbortReason::from_raw(AbortReason::ALL.len() as i32), None);
    }
}
