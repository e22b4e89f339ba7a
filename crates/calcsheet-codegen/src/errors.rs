//! Error types for the calcsheet-codegen crate.

use thiserror::Error;

/// Errors that can occur while translating and compiling a worksheet.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// No usable C++ compiler was found.
    #[error("No C++ compiler found (set CALCSHEET_CXX or install c++/clang++/g++)")]
    NoCompiler,

    /// The compiler process could not be spawned.
    #[error("Failed to invoke compiler {compiler}: {source}")]
    Spawn {
        compiler: String,
        source: std::io::Error,
    },

    /// The worksheet being translated has been closed.
    #[error("Document was closed before translation")]
    DocumentGone,

    /// File I/O error while writing sources or artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using CodegenError.
pub type Result<T> = std::result::Result<T, CodegenError>;
