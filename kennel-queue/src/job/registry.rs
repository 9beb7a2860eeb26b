use std::collections::HashMap;
use std::sync::Arc;

use super::JobHandler;
use crate::{QueueError, QueueResult};

/// Registry mapping job names to handlers.
///
/// Exact names win over prefixes; among prefixes the longest match wins.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    prefixes: Vec<(String, Arc<dyn JobHandler>)>,
}

impl JobRegistry {
    /// Create a new job registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one exact job name
    pub fn register(&mut self, name: impl Into<String>, handler: impl JobHandler + 'static) -> QueueResult<()> {
        self.register_arc(name, Arc::new(handler))
    }

    /// Register a shared handler for one exact job name
    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> QueueResult<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(QueueError::HandlerAlreadyRegistered(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Register a handler for every job name starting with `prefix`
    pub fn register_prefix(&mut self, prefix: impl Into<String>, handler: impl JobHandler + 'static) -> QueueResult<()> {
        let prefix = prefix.into();
        if self.prefixes.iter().any(|(existing, _)| *existing == prefix) {
            return Err(QueueError::HandlerAlreadyRegistered(format!("{prefix}*")));
        }
        self.prefixes.push((prefix, Arc::new(handler)));
        // Longest prefix first so resolution can stop at the first hit
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(())
    }

    /// Find the handler for a job name
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned().or_else(|| {
            self.prefixes
                .iter()
                .find(|(prefix, _)| name.starts_with(prefix.as_str()))
                .map(|(_, handler)| handler.clone())
        })
    }

    /// Check if a job name has a handler
    pub fn is_registered(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Exact names followed by prefixes (suffixed with `*`), sorted
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .keys()
            .cloned()
            .chain(self.prefixes.iter().map(|(prefix, _)| format!("{prefix}*")))
            .collect();
        names.sort();
        names
    }
}
