//! Worksheet document model.
//!
//! This module provides the minimal document layer the engine executes
//! against:
//!
//! - [`Worksheet`] - An ordered list of elements with an edit revision
//! - [`Element`] - A single worksheet region (calculation, output, ...)
//! - [`DocumentRegistry`] - Process-wide registry handing out weak handles
//!
//! The engine never owns a worksheet; it holds [`DocHandle`]s and treats a
//! failed upgrade as the stale-document discard case.

mod registry;
mod worksheet;

pub use registry::{DocHandle, DocumentRegistry};
pub use worksheet::{Calculation, DocumentId, Element, ElementId, ElementKind, Worksheet};
