//! Worksheet and element types.

use crate::expr::Expr;

/// Unique id of a worksheet document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub u64);

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

/// Unique id of an element within a worksheet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "el#{}", self.0)
    }
}

/// An assignment of an expression to a named identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct Calculation {
    /// Identifier being defined.
    pub target: String,
    /// Right-hand side.
    pub expr: Expr,
}

/// The kind of a worksheet element.
#[derive(Clone, Debug, PartialEq)]
pub enum ElementKind {
    /// A calculation region: `target := expr`.
    Calculation(Calculation),
    /// An output region sending a value to a named device.
    Output { device: String, expr: Expr },
    /// Narrative text; not executable.
    Text(String),
    /// Reference to another worksheet whose definitions precede ours.
    Import(DocumentId),
}

impl ElementKind {
    /// Whether this element produces executable model code.
    pub fn is_executable(&self) -> bool {
        matches!(self, ElementKind::Calculation(_) | ElementKind::Output { .. })
    }
}

/// A single worksheet region.
#[derive(Clone, Debug)]
pub struct Element {
    /// Stable id, unique within the worksheet.
    pub id: ElementId,
    /// What the element is.
    pub kind: ElementKind,
    /// Instruction-breakpoint annotation, owned by the document layer.
    pub breakpoint: bool,
    /// Runtime diagnostic marker: the program counter is halted here.
    pub paused_marker: bool,
}

impl Element {
    /// Create an element with no annotations.
    pub fn new(id: ElementId, kind: ElementKind) -> Self {
        Self {
            id,
            kind,
            breakpoint: false,
            paused_marker: false,
        }
    }
}

/// A worksheet: an ordered list of elements.
///
/// `revision` is bumped by every mutation so collaborators can detect
/// edits without diffing content.
#[derive(Clone, Debug)]
pub struct Worksheet {
    /// Document id, assigned by the registry.
    pub id: DocumentId,
    /// Human-readable sheet name.
    pub name: String,
    /// Elements in document order.
    pub elements: Vec<Element>,
    /// Monotonically increasing edit counter.
    pub revision: u64,
    next_element: u64,
}

impl Worksheet {
    /// Create an empty worksheet.
    pub fn new(id: DocumentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            elements: Vec::new(),
            revision: 0,
            next_element: 1,
        }
    }

    /// Append an element, assigning it the next element id.
    pub fn push(&mut self, kind: ElementKind) -> ElementId {
        let id = ElementId(self.next_element);
        self.next_element += 1;
        self.elements.push(Element::new(id, kind));
        self.bump_revision();
        id
    }

    /// Bump the edit revision.
    pub fn bump_revision(&mut self) {
        self.revision += 1;
    }

    /// Find an element by id.
    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Find an element by id, mutably. Does not bump the revision; callers
    /// mutating document content are responsible for that.
    pub fn element_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        self.elements.iter_mut().find(|e| e.id == id)
    }

    /// Set or clear the instruction breakpoint on an element.
    ///
    /// Returns false if the element does not exist. Annotation changes do
    /// not count as content edits, so the revision is left alone.
    pub fn set_breakpoint(&mut self, id: ElementId, set: bool) -> bool {
        match self.element_mut(id) {
            Some(el) => {
                el.breakpoint = set;
                true
            }
            None => false,
        }
    }

    /// Clear every instruction breakpoint.
    pub fn clear_all_breakpoints(&mut self) {
        for el in &mut self.elements {
            el.breakpoint = false;
        }
    }

    /// Ids of the documents this worksheet imports directly.
    pub fn direct_imports(&self) -> Vec<DocumentId> {
        self.elements
            .iter()
            .filter_map(|e| match e.kind {
                ElementKind::Import(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Elements that translate to model operations, in document order.
    pub fn executable_elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| e.kind.is_executable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;

    fn calc(target: &str, src: &str) -> ElementKind {
        ElementKind::Calculation(Calculation {
            target: target.to_string(),
            expr: parse(src).unwrap(),
        })
    }

    #[test]
    fn test_push_assigns_ids_and_bumps_revision() {
        let mut sheet = Worksheet::new(DocumentId(1), "test");
        assert_eq!(sheet.revision, 0);
        let a = sheet.push(calc("x", "1"));
        let b = sheet.push(calc("y", "x + 1"));
        assert_ne!(a, b);
        assert_eq!(sheet.revision, 2);
    }

    #[test]
    fn test_breakpoint_toggle_keeps_revision() {
        let mut sheet = Worksheet::new(DocumentId(1), "test");
        let id = sheet.push(calc("x", "1"));
        let before = sheet.revision;
        assert!(sheet.set_breakpoint(id, true));
        assert!(sheet.element(id).unwrap().breakpoint);
        assert_eq!(sheet.revision, before);
        sheet.clear_all_breakpoints();
        assert!(!sheet.element(id).unwrap().breakpoint);
        assert!(!sheet.set_breakpoint(ElementId(999), true));
    }

    #[test]
    fn test_direct_imports() {
        let mut sheet = Worksheet::new(DocumentId(1), "test");
        sheet.push(ElementKind::Import(DocumentId(7)));
        sheet.push(calc("x", "1"));
        sheet.push(ElementKind::Import(DocumentId(9)));
        assert_eq!(sheet.direct_imports(), vec![DocumentId(7), DocumentId(9)]);
    }

    #[test]
    fn test_executable_elements_skip_text() {
        let mut sheet = Worksheet::new(DocumentId(1), "test");
        sheet.push(ElementKind::Text("notes".to_string()));
        sheet.push(calc("x", "1"));
        sheet.push(ElementKind::Output {
            device: "console".to_string(),
            expr: parse("x").unwrap(),
        });
        assert_eq!(sheet.executable_elements().count(), 2);
    }
}
