//! Storage factory for creating backend instances.
//!
//! Provides a flexible way to instantiate backends without exposing
//! implementation details to consumers.

use std::str::FromStr;
use std::sync::Arc;

use prism_types::StoreError;

use crate::memory::MemoryBackend;
use crate::{DocumentStore, Result};

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// In-memory storage (for testing and development).
    Memory,
}

impl FromStr for BackendType {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BackendType::Memory),
            _ => Err(StoreError::Internal(format!("Unknown backend type: {s}"))),
        }
    }
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Memory => "memory",
        }
    }
}

/// Configuration for a storage backend.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: BackendType,
    /// Operator limits; `None` keeps the backend defaults.
    pub disjunction_cap: Option<usize>,
    pub op_ceiling: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { backend: BackendType::Memory, disjunction_cap: None, op_ceiling: None }
    }
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::default()
    }
}

/// Storage factory for creating backend instances.
pub struct StorageFactory;

impl StorageFactory {
    pub async fn create(config: StorageConfig) -> Result<Arc<dyn DocumentStore>> {
        match config.backend {
            BackendType::Memory => {
                let backend = match (config.disjunction_cap, config.op_ceiling) {
                    (Some(cap), Some(ceiling)) => MemoryBackend::with_limits(cap, ceiling),
                    (Some(cap), None) => MemoryBackend::with_limits(
                        cap,
                        prism_types::limits::DEFAULT_OPERATION_BUDGET,
                    ),
                    (None, Some(ceiling)) => MemoryBackend::with_limits(
                        prism_types::limits::DEFAULT_DISJUNCTION_CAP,
                        ceiling,
                    ),
                    (None, None) => MemoryBackend::new(),
                };
                Ok(Arc::new(backend) as Arc<dyn DocumentStore>)
            }
        }
    }
}
