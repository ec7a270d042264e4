//! Registry of live datapaths keyed by connection id.
//!
//! The helper assigns connection ids; the registry enforces that only one
//! live datapath exists per id at a time. Iteration takes a snapshot so
//! callers may close entries while walking the set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::datapath::Datapath;
use crate::event::DatapathId;

/// Registry of connected, negotiated datapaths.
#[derive(Debug, Default)]
pub struct DatapathRegistry {
    entries: RefCell<HashMap<u64, Rc<Datapath>>>,
}

impl DatapathRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a datapath under its connection id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateConnection`] when the id is still
    /// live; the helper never carries two connections under one id, so a
    /// duplicate signals a protocol violation upstream.
    pub(crate) fn insert(&self, datapath: Rc<Datapath>) -> Result<(), RegistryError> {
        let conn_id = datapath.conn_id();
        let mut entries = self.entries.borrow_mut();
        if entries.contains_key(&conn_id) {
            return Err(RegistryError::DuplicateConnection { conn_id });
        }
        entries.insert(conn_id, datapath);
        Ok(())
    }

    /// Removes and returns the datapath for a connection id.
    pub(crate) fn remove(&self, conn_id: u64) -> Option<Rc<Datapath>> {
        self.entries.borrow_mut().remove(&conn_id)
    }

    /// Looks up a datapath by connection id.
    #[must_use]
    pub fn get(&self, conn_id: u64) -> Option<Rc<Datapath>> {
        self.entries.borrow().get(&conn_id).cloned()
    }

    /// Looks up a datapath by its datapath id.
    #[must_use]
    pub fn find_by_datapath_id(&self, datapath_id: DatapathId) -> Option<Rc<Datapath>> {
        self.entries
            .borrow()
            .values()
            .find(|datapath| datapath.datapath_id() == datapath_id)
            .cloned()
    }

    /// Takes a snapshot of the current set, ordered by connection id.
    ///
    /// The snapshot is detached from the registry: entries may be closed or
    /// removed while iterating without observing partial updates.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Rc<Datapath>> {
        let mut datapaths: Vec<Rc<Datapath>> = self.entries.borrow().values().cloned().collect();
        datapaths.sort_by_key(|datapath| datapath.conn_id());
        datapaths
    }

    /// Number of live datapaths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether no datapath is currently registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// Errors raised by registry bookkeeping.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A datapath is already registered under this connection id.
    #[error("connection {conn_id} is already registered")]
    DuplicateConnection {
        /// The conflicting connection id.
        conn_id: u64,
    },
}
