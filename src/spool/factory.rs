//! Factory wiring configuration and a shared memory manager into spoolers

use super::builder::{SpoolBuilder, SpoolOptions};
use super::iterator::SpoolingIterator;
use crate::config::SpoolConfig;
use crate::error::Result;
use crate::memory::MemoryManager;
use crate::source::RecordSource;
use std::sync::Arc;

/// Creates spooling iterators that share one memory budget
///
/// One factory is typically created per process and used for every scan
/// whose results need to be buffered.
#[derive(Clone)]
pub struct SpoolingIteratorFactory {
    memory_manager: Arc<dyn MemoryManager>,
    options: SpoolOptions,
}

impl SpoolingIteratorFactory {
    pub fn new(config: &SpoolConfig, memory_manager: Arc<dyn MemoryManager>) -> Self {
        Self {
            memory_manager,
            options: config.spool_options(),
        }
    }

    /// Build the factory and its memory manager from configuration alone
    pub fn from_config(config: &SpoolConfig) -> Self {
        Self::new(config, Arc::new(config.memory_manager()))
    }

    pub fn options(&self) -> &SpoolOptions {
        &self.options
    }

    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.memory_manager
    }

    /// Spool `source` and return the replay iterator
    pub fn new_iterator<S: RecordSource>(&self, source: S) -> Result<SpoolingIterator> {
        SpoolBuilder::new(self.memory_manager.as_ref(), self.options.clone()).build(source)
    }
}

impl std::fmt::Debug for SpoolingIteratorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolingIteratorFactory")
            .field("options", &self.options)
            .field("max_memory", &self.memory_manager.max_memory())
            .finish()
    }
}
