//! Observer notifications.
//!
//! The engine publishes [`Notification`]s to any number of registered
//! observers through an explicit [`ObserverBus`]: subscribe, unsubscribe,
//! publish. Observers are plain callbacks, decoupling the engine from any
//! particular UI toolkit.

use std::path::PathBuf;

use crate::diag::Diagnostic;
use crate::document::{DocumentId, ElementId};
use crate::symbols::CalculatedValue;

/// Everything the engine tells the outside world.
#[derive(Clone, Debug)]
pub enum Notification {
    /// Whether the engine can accept a new run request.
    Ready(bool),
    /// Whether a build or run is in progress.
    Active(bool),
    /// The model started executing.
    Running { root: DocumentId, debug: bool },
    /// The model ran to completion.
    Stopped { root: DocumentId },
    /// The model was aborted.
    Aborted { root: DocumentId },
    /// Halted after an explicit pause request.
    PausedOnUserRequest {
        root: DocumentId,
        element: Option<ElementId>,
        changed: Vec<CalculatedValue>,
    },
    /// Halted at an instruction breakpoint or run-to target.
    PausedAtBreakpoint {
        root: DocumentId,
        element: Option<ElementId>,
        changed: Vec<CalculatedValue>,
    },
    /// Halted because a watched identifier was written.
    PausedOnVariableUpdate {
        root: DocumentId,
        element: Option<ElementId>,
        identifier: CalculatedValue,
        changed: Vec<CalculatedValue>,
    },
    /// Execution resumed after a pause.
    Resumed { root: DocumentId },
    /// One-time notification that a forced shutdown completed.
    NowShutdown,
    /// The model wrote a value to a named output device.
    OutputToDevice { device: String, value: f64 },
    /// The build target directory is not writable; the request was dropped.
    DirectoryReadOnly { path: PathBuf },
    /// Diagnostics from translation or from a runtime abort.
    DiagnosticsReported {
        root: DocumentId,
        diagnostics: Vec<Diagnostic>,
    },
}

impl Notification {
    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Notification::Ready(_) => "Ready",
            Notification::Active(_) => "Active",
            Notification::Running { .. } => "Running",
            Notification::Stopped { .. } => "Stopped",
            Notification::Aborted { .. } => "Aborted",
            Notification::PausedOnUserRequest { .. } => "PausedOnUserRequest",
            Notification::PausedAtBreakpoint { .. } => "PausedAtBreakpoint",
            Notification::PausedOnVariableUpdate { .. } => "PausedOnVariableUpdate",
            Notification::Resumed { .. } => "Resumed",
            Notification::NowShutdown => "NowShutdown",
            Notification::OutputToDevice { .. } => "OutputToDevice",
            Notification::DirectoryReadOnly { .. } => "DirectoryReadOnly",
            Notification::DiagnosticsReported { .. } => "DiagnosticsReported",
        }
    }
}

/// Subscription token returned by [`ObserverBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserverId(u64);

type Observer = Box<dyn Fn(&Notification) + Send>;

/// Fan-out of notifications to zero or more observers.
#[derive(Default)]
pub struct ObserverBus {
    observers: Vec<(ObserverId, Observer)>,
    next_id: u64,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; returns a token for unsubscribing.
    pub fn subscribe<F>(&mut self, observer: F) -> ObserverId
    where
        F: Fn(&Notification) + Send + 'static,
    {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Unknown tokens are ignored.
    pub fn unsubscribe(&mut self, id: ObserverId) {
        self.observers.retain(|(oid, _)| *oid != id);
    }

    /// Deliver a notification to every observer in subscription order.
    pub fn publish(&self, notification: &Notification) {
        log::debug!("notify: {}", notification.type_name());
        for (_, observer) in &self.observers {
            observer(notification);
        }
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for ObserverBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverBus")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_publish_reaches_all_observers() {
        let mut bus = ObserverBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            bus.subscribe(move |n| {
                seen.lock().unwrap().push(format!("{}:{}", tag, n.type_name()));
            });
        }

        bus.publish(&Notification::NowShutdown);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["a:NowShutdown", "b:NowShutdown"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut bus = ObserverBus::new();
        let count = Arc::new(Mutex::new(0usize));

        let id = {
            let count = count.clone();
            bus.subscribe(move |_| *count.lock().unwrap() += 1)
        };

        bus.publish(&Notification::Ready(true));
        bus.unsubscribe(id);
        bus.publish(&Notification::Ready(false));

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(bus.is_empty());
    }
}
