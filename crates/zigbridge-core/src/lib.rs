/*!
 * ZigBridge Core
 *
 * This crate provides the shared foundation for the ZigBridge system:
 * error and value types, layered configuration, persistent storage and
 * logging setup.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod storage;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use serde;
    pub use serde_json;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// ZigBridge core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
