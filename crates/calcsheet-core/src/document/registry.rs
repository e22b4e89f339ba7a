//! Process-wide document registry.
//!
//! The registry is the only owner of live worksheets. Everyone else,
//! including the execution engine, holds [`DocHandle`]s: a document id
//! plus a weak pointer. A handle that fails to upgrade refers to a
//! document that has been closed, and any operation against it is
//! discarded the same way a stale callback is.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use super::worksheet::{DocumentId, Worksheet};

type Slot = Arc<RwLock<Worksheet>>;

/// Non-owning handle to a registered worksheet.
#[derive(Clone, Debug)]
pub struct DocHandle {
    id: DocumentId,
    slot: Weak<RwLock<Worksheet>>,
}

impl DocHandle {
    /// The document id this handle refers to.
    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Upgrade to a strong reference, if the document is still alive.
    pub fn upgrade(&self) -> Option<Slot> {
        self.slot.upgrade()
    }

    /// Read the worksheet through the handle.
    ///
    /// Returns `None` when the document has been closed.
    pub fn with_read<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Worksheet) -> R,
    {
        let slot = self.slot.upgrade()?;
        let sheet = slot.read().expect("Worksheet lock poisoned");
        Some(f(&sheet))
    }

    /// Mutate the worksheet through the handle.
    pub fn with_write<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Worksheet) -> R,
    {
        let slot = self.slot.upgrade()?;
        let mut sheet = slot.write().expect("Worksheet lock poisoned");
        Some(f(&mut sheet))
    }
}

/// Registry of live worksheets, shared across threads.
#[derive(Clone, Default)]
pub struct DocumentRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    documents: HashMap<DocumentId, Slot>,
    next_id: u64,
}

impl DocumentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh document id.
    pub fn allocate_id(&self) -> DocumentId {
        let mut inner = self.inner.write().expect("Registry lock poisoned");
        inner.next_id += 1;
        DocumentId(inner.next_id)
    }

    /// Register a worksheet and return a handle to it.
    pub fn insert(&self, sheet: Worksheet) -> DocHandle {
        let id = sheet.id;
        let slot: Slot = Arc::new(RwLock::new(sheet));
        let handle = DocHandle {
            id,
            slot: Arc::downgrade(&slot),
        };
        let mut inner = self.inner.write().expect("Registry lock poisoned");
        inner.documents.insert(id, slot);
        handle
    }

    /// Look up a handle by document id.
    pub fn handle(&self, id: DocumentId) -> Option<DocHandle> {
        let inner = self.inner.read().expect("Registry lock poisoned");
        inner.documents.get(&id).map(|slot| DocHandle {
            id,
            slot: Arc::downgrade(slot),
        })
    }

    /// Remove a worksheet. Outstanding handles go dead.
    pub fn remove(&self, id: DocumentId) -> bool {
        let mut inner = self.inner.write().expect("Registry lock poisoned");
        inner.documents.remove(&id).is_some()
    }

    /// The transitive set of documents imported by `root`, excluding
    /// `root` itself. Cycle-safe: each document is visited once.
    pub fn import_closure(&self, root: DocumentId) -> HashSet<DocumentId> {
        let inner = self.inner.read().expect("Registry lock poisoned");
        let mut closure = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let imports = match inner.documents.get(&id) {
                Some(slot) => slot
                    .read()
                    .expect("Worksheet lock poisoned")
                    .direct_imports(),
                None => continue,
            };
            for import in imports {
                if import != root && closure.insert(import) {
                    stack.push(import);
                }
            }
        }
        closure
    }

    /// Whether an edit to `edited` is relevant to a build of `root`:
    /// either the root itself or anything it transitively imports.
    pub fn edit_affects(&self, root: DocumentId, edited: DocumentId) -> bool {
        root == edited || self.import_closure(root).contains(&edited)
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("Registry lock poisoned");
        f.debug_struct("DocumentRegistry")
            .field("documents", &inner.documents.len())
            .finish()
    }
}
