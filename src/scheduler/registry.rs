//! Handler registry.
//!
//! Maps task-type names to the handlers that execute them. The registry is an
//! ordinary value shared as `Arc<Registry>`; the scanner re-reads the
//! registered types on every claim, so handlers registered after the
//! scheduler starts are picked up on the next scan.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::RegistryError;

use super::handler::TaskHandler;

/// Thread-safe map from task type to handler.
#[derive(Default)]
pub struct Registry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `task_type`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AlreadyRegistered` if the type already has a
    /// handler. The existing handler is kept.
    pub fn register<H>(&self, task_type: impl Into<String>, handler: H) -> Result<(), RegistryError>
    where
        H: TaskHandler + 'static,
    {
        self.register_arc(task_type, Arc::new(handler))
    }

    /// Registers an already shared handler.
    pub fn register_arc(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let task_type = task_type.into();
        let mut handlers = self
            .handlers
            .write()
            .expect("registry write lock poisoned");

        if handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        handlers.insert(task_type, handler);
        Ok(())
    }

    /// Returns the handler for `task_type`, if one is registered.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .expect("registry read lock poisoned")
            .get(task_type)
            .cloned()
    }

    /// Returns every registered type, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .expect("registry read lock poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers
            .read()
            .expect("registry read lock poisoned")
            .contains_key(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .expect("registry read lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.types())
            .finish()
    }
}
