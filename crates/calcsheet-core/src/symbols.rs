//! Symbol databases captured at build time.
//!
//! The generator assigns every identifier and every executable element an
//! opaque runtime handle while translating. The engine snapshots the
//! resulting databases when a build is bound and uses them to translate
//! runtime handles back into document-level names and elements, so
//! debugger surfaces never see raw handles.

use std::collections::HashMap;

use crate::document::ElementId;

/// Opaque handle of an identifier inside a loaded model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IdentifierHandle(pub i32);

/// Opaque handle of an operation inside a loaded model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperationHandle(pub i32);

/// A named value, as edited in or reported to debugger surfaces.
#[derive(Clone, Debug, PartialEq)]
pub struct CalculatedValue {
    /// Document-level identifier name.
    pub name: String,
    /// Current numeric value.
    pub value: f64,
}

impl CalculatedValue {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One identifier known to a build.
#[derive(Clone, Debug)]
pub struct IdentifierEntry {
    pub handle: IdentifierHandle,
    pub name: String,
    /// Element whose calculation defines the identifier, if any.
    pub defined_by: Option<ElementId>,
}

/// Snapshot of the identifier symbol table for one build.
#[derive(Clone, Debug, Default)]
pub struct IdentifierDatabase {
    entries: Vec<IdentifierEntry>,
    by_name: HashMap<String, usize>,
    by_handle: HashMap<IdentifierHandle, usize>,
}

impl IdentifierDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identifier. Returns its handle; re-registering a name
    /// returns the existing handle.
    pub fn register(&mut self, name: &str, defined_by: Option<ElementId>) -> IdentifierHandle {
        if let Some(&idx) = self.by_name.get(name) {
            if defined_by.is_some() && self.entries[idx].defined_by.is_none() {
                self.entries[idx].defined_by = defined_by;
            }
            return self.entries[idx].handle;
        }
        let handle = IdentifierHandle(self.entries.len() as i32);
        self.by_name.insert(name.to_string(), self.entries.len());
        self.by_handle.insert(handle, self.entries.len());
        self.entries.push(IdentifierEntry {
            handle,
            name: name.to_string(),
            defined_by,
        });
        handle
    }

    pub fn by_name(&self, name: &str) -> Option<&IdentifierEntry> {
        self.by_name.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn by_handle(&self, handle: IdentifierHandle) -> Option<&IdentifierEntry> {
        self.by_handle.get(&handle).map(|&idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[IdentifierEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One operation known to a build.
#[derive(Clone, Debug)]
pub struct OperationEntry {
    pub handle: OperationHandle,
    /// The worksheet element this operation was translated from.
    pub element: ElementId,
}

/// Snapshot of the operation symbol table for one build.
#[derive(Clone, Debug, Default)]
pub struct OperationDatabase {
    entries: Vec<OperationEntry>,
    by_element: HashMap<ElementId, usize>,
    by_handle: HashMap<OperationHandle, usize>,
}

impl OperationDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the operation translated from `element`.
    pub fn register(&mut self, element: ElementId) -> OperationHandle {
        if let Some(&idx) = self.by_element.get(&element) {
            return self.entries[idx].handle;
        }
        let handle = OperationHandle(self.entries.len() as i32);
        self.by_element.insert(element, self.entries.len());
        self.by_handle.insert(handle, self.entries.len());
        self.entries.push(OperationEntry { handle, element });
        handle
    }

    pub fn by_element(&self, element: ElementId) -> Option<OperationHandle> {
        self.by_element
            .get(&element)
            .map(|&idx| self.entries[idx].handle)
    }

    pub fn by_handle(&self, handle: OperationHandle) -> Option<ElementId> {
        self.by_handle
            .get(&handle)
            .map(|&idx| self.entries[idx].element)
    }

    pub fn entries(&self) -> &[OperationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_registration_dedupes() {
        let mut db = IdentifierDatabase::new();
        let g = db.register("g", None);
        let v0 = db.register("v0", Some(ElementId(2)));
        let g2 = db.register("g", Some(ElementId(1)));
        assert_eq!(g, g2);
        assert_ne!(g, v0);
        assert_eq!(db.len(), 2);
        // The later definition site sticks.
        assert_eq!(db.by_name("g").unwrap().defined_by, Some(ElementId(1)));
        assert_eq!(db.by_handle(v0).unwrap().name, "v0");
        assert!(db.by_name("missing").is_none());
    }

    #[test]
    fn test_operation_lookup_both_ways() {
        let mut db = OperationDatabase::new();
        let op_a = db.register(ElementId(10));
        let op_b = db.register(ElementId(11));
        assert_ne!(op_a, op_b);
        assert_eq!(db.by_element(ElementId(10)), Some(op_a));
        assert_eq!(db.by_handle(op_b), Some(ElementId(11)));
        assert_eq!(db.register(ElementId(10)), op_a);
        assert_eq!(db.len(), 2);
    }
}
