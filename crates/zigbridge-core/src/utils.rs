/*!
 * Utility functions and helpers for ZigBridge.
 */
use std::future::Future;

use tracing::{debug, warn};

/// Create a task that runs in the background and logs its outcome
///
/// Used for fire-and-forget coordinator calls whose result nobody awaits.
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}
