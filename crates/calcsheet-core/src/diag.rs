//! Diagnostics reported to observers.
//!
//! Translation errors from the generator and abort reasons from the model
//! runtime flow through the same [`Diagnostic`] type, so a UI can answer
//! "why did my program stop" the same way for a compile error and for a
//! division by zero.

use crate::abi::AbortReason;
use crate::document::ElementId;

/// How serious a diagnostic is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// Machine-readable diagnostic category.
///
/// Mirrors [`AbortReason`] for runtime faults and adds the build-side
/// categories. The `From<AbortReason>` impl is an exhaustive match, so a
/// new abort reason fails to compile until it is mapped here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticCode {
    // Build-side.
    TranslationError,
    ToolchainFailure,
    LoadFailure,
    // Runtime-side, mirroring AbortReason.
    UserAbort,
    OutOfMemory,
    FileIo,
    InvalidNumeric,
    MatrixDimension,
    TypeMismatch,
    ConvergenceFailure,
    InternalFault,
}

impl From<AbortReason> for DiagnosticCode {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::UserRequest => DiagnosticCode::UserAbort,
            AbortReason::OutOfMemory => DiagnosticCode::OutOfMemory,
            AbortReason::FileIo => DiagnosticCode::FileIo,
            AbortReason::InvalidNumeric => DiagnosticCode::InvalidNumeric,
            AbortReason::MatrixDimension => DiagnosticCode::MatrixDimension,
            AbortReason::TypeMismatch => DiagnosticCode::TypeMismatch,
            AbortReason::ConvergenceFailure => DiagnosticCode::ConvergenceFailure,
            AbortReason::Internal => DiagnosticCode::InternalFault,
        }
    }
}

/// One diagnostic, attributed to a worksheet element when possible.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
    /// The element the diagnostic points at, if attribution succeeded.
    pub element: Option<ElementId>,
}

impl Diagnostic {
    /// A build-side error diagnostic.
    pub fn translation_error(message: impl Into<String>, element: Option<ElementId>) -> Self {
        Self {
            severity: Severity::Error,
            code: DiagnosticCode::TranslationError,
            message: message.into(),
            element,
        }
    }

    /// A build-side warning diagnostic.
    pub fn translation_warning(message: impl Into<String>, element: Option<ElementId>) -> Self {
        Self {
            severity: Severity::Warning,
            code: DiagnosticCode::TranslationError,
            message: message.into(),
            element,
        }
    }

    /// A diagnostic describing an abnormal run termination.
    pub fn from_abort(reason: AbortReason, element: Option<ElementId>) -> Self {
        Self {
            severity: Severity::Error,
            code: reason.into(),
            message: reason.to_string(),
            element,
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.element {
            Some(el) => write!(f, "{}: {} ({})", self.severity, self.message, el),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}
