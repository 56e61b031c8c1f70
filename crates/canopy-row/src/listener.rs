//! Post-commit row change notification.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canopy_common::types::TableId;
use canopy_storage::Key;
use parking_lot::RwLock;
use thiserror::Error;

use crate::rowdata::RowData;

/// What a committed mutation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEventKind {
    /// A row was written.
    Inserted,
    /// A row was changed in place.
    Updated,
    /// A row was removed.
    Deleted,
}

/// A committed row change.
#[derive(Debug, Clone)]
pub struct RowEvent {
    /// What happened.
    pub kind: RowEventKind,
    /// Table of the row.
    pub table_id: TableId,
    /// The row's hkey.
    pub hkey: Key,
    /// The row before the change; `None` for inserts.
    pub old_row: Option<RowData>,
    /// The row after the change; `None` for deletes.
    pub new_row: Option<RowData>,
    /// Commit sequence number of the change.
    pub commit_seq: u64,
}

/// Failure reported by a listener. Logged, never propagated.
#[derive(Debug, Error)]
#[error("listener failed: {message}")]
pub struct ListenerError {
    /// What went wrong.
    pub message: String,
}

impl ListenerError {
    /// Creates an error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receives committed row changes.
///
/// Callbacks run on the mutating thread after the commit, so they must be
/// quick and must not call back into the store's mutation methods.
pub trait UpdateListener: Send + Sync {
    /// A row was inserted.
    fn inserted(&self, _event: &RowEvent) -> Result<(), ListenerError> {
        Ok(())
    }

    /// A row was updated in place.
    fn updated(&self, _event: &RowEvent) -> Result<(), ListenerError> {
        Ok(())
    }

    /// A row was deleted.
    fn deleted(&self, _event: &RowEvent) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Handle returned by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Registered listeners of one store.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn UpdateListener>)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn register(&self, listener: Arc<dyn UpdateListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub(crate) fn dispatch(&self, events: &[RowEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for event in events {
            for (id, listener) in &listeners {
                let result = match event.kind {
                    RowEventKind::Inserted => listener.inserted(event),
                    RowEventKind::Updated => listener.updated(event),
                    RowEventKind::Deleted => listener.deleted(event),
                };
                if let Err(e) = result {
                    tracing::warn!(
                        listener = %id,
                        table = %event.table_id,
                        hkey = %event.hkey,
                        error = %e,
                        "update listener failed"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<RowEventKind>>,
    }

    impl UpdateListener for Recorder {
        fn inserted(&self, event: &RowEvent) -> Result<(), ListenerError> {
            self.seen.lock().push(event.kind);
            Ok(())
        }

        fn deleted(&self, event: &RowEvent) -> Result<(), ListenerError> {
            self.seen.lock().push(event.kind);
            Err(ListenerError::new("refused"))
        }
    }

    fn event(kind: RowEventKind) -> RowEvent {
        RowEvent {
            kind,
            table_id: TableId::new(1),
            hkey: Key::new(),
            old_row: None,
            new_row: None,
            commit_seq: 1,
        }
    }

    #[test]
    fn test_dispatch_survives_failures() {
        let registry = ListenerRegistry::default();
        let recorder = Arc::new(Recorder::default());
        let id = registry.register(recorder.clone());
        registry.dispatch(&[
            event(RowEventKind::Deleted),
            event(RowEventKind::Inserted),
            event(RowEventKind::Updated),
        ]);
        assert_eq!(
            *recorder.seen.lock(),
            vec![RowEventKind::Deleted, RowEventKind::Inserted]
        );

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }
}
