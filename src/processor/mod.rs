//! Item processors and their registry.
//!
//! Each work type has one processor. The registry maps type strings to
//! factories; the dispatcher resolves a fresh processor per claim and hands
//! it a [`Proxy`] bound to the claimed item.

pub mod delete_study;
pub mod proxy;

pub use delete_study::DeleteStudyProcessor;
pub use proxy::{Outcome, Proxy, Signals};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::WorkItem;

/// Executes the business action for one claimed work item.
///
/// `process` is called exactly once per claim. It must check
/// [`Proxy::cancel_pending`] and [`Proxy::stop_pending`] on entry and at each
/// safe checkpoint (see [`Proxy::checkpoint`]), keep progress current with
/// [`Proxy::update_progress`], and report exactly one outcome: `complete`,
/// `cancel`, `postpone` or `fail`. Returning `Err` without an outcome takes
/// the retry path; returning `Ok` without one is a protocol violation and is
/// treated the same way.
#[async_trait]
pub trait ItemProcessor: Send {
    async fn process(&mut self, proxy: &mut Proxy) -> Result<()>;
}

/// Produces a processor for a claimed item.
pub trait ProcessorFactory: Send + Sync {
    fn create(&self, item: &WorkItem) -> Result<Box<dyn ItemProcessor>>;
}

impl<F> ProcessorFactory for F
where
    F: Fn(&WorkItem) -> Result<Box<dyn ItemProcessor>> + Send + Sync,
{
    fn create(&self, item: &WorkItem) -> Result<Box<dyn ItemProcessor>> {
        self(item)
    }
}

/// Capability lookup: work type -> processor factory.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    factories: HashMap<String, Arc<dyn ProcessorFactory>>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the processors that ship with workq.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(DeleteStudyProcessor::WORK_TYPE, DeleteStudyProcessor::factory);
        registry
    }

    /// Register (or replace) the factory for `work_type`.
    pub fn register(
        &mut self,
        work_type: impl Into<String>,
        factory: impl ProcessorFactory + 'static,
    ) -> &mut Self {
        self.factories.insert(work_type.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, work_type: &str) -> bool {
        self.factories.contains_key(work_type)
    }

    /// Registered work types, sorted so poll order is deterministic.
    pub fn work_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build a processor for `item`.
    pub fn resolve(&self, item: &WorkItem) -> Result<Box<dyn ItemProcessor>> {
        let factory = self
            .factories
            .get(&item.work_type)
            .ok_or_else(|| Error::UnknownItemType(item.work_type.clone()))?;
        factory.create(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWorkItem;
    use chrono::Utc;

    struct Noop;

    #[async_trait]
    impl ItemProcessor for Noop {
        async fn process(&mut self, proxy: &mut Proxy) -> Result<()> {
            proxy.complete().await
        }
    }

    #[test]
    fn resolve_unknown_type_fails() {
        let registry = ProcessorRegistry::new();
        let item = NewWorkItem::new("Nope").into_item(Utc::now());
        assert!(matches!(
            registry.resolve(&item),
            Err(Error::UnknownItemType(t)) if t == "Nope"
        ));
    }

    #[test]
    fn closures_register_as_factories() {
        let mut registry = ProcessorRegistry::new();
        registry
            .register("B", |_: &WorkItem| -> Result<Box<dyn ItemProcessor>> {
                Ok(Box::new(Noop))
            })
            .register("A", |_: &WorkItem| -> Result<Box<dyn ItemProcessor>> {
                Ok(Box::new(Noop))
            });
        assert_eq!(registry.work_types(), vec!["A".to_string(), "B".to_string()]);
        let item = NewWorkItem::new("A").into_item(Utc::now());
        assert!(registry.resolve(&item).is_ok());
    }

    #[test]
    fn builtins_include_delete_study() {
        assert!(ProcessorRegistry::with_builtins().contains("DeleteStudy"));
    }
}
