/*!
 * Prelude module for ZigBridge Core.
 *
 * This module re-exports commonly used types and functions from the ZigBridge Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Attributes, Id, Value};

// Re-export config types
pub use crate::config::{BridgeConfig, Config, ConfigBuilder, SharedConfig};

// Re-export storage types
pub use crate::storage::{FileStore, KeyValueStore, MemoryStore, SharedStore};

// Re-export utility functions
pub use crate::utils::spawn_and_log;

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};
