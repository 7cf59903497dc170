//! Model-manager collaborator contract.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ModelError;

/// A model wrapper that reports its memory footprint and can shed memory
/// on request. The resource manager only reads the gauge and calls
/// [`optimize_memory`](ModelManager::optimize_memory); it never touches the
/// model's internals.
#[async_trait]
pub trait ModelManager: Send + Sync {
    /// Display name used in logs.
    fn name(&self) -> &str {
        "model"
    }

    /// Current memory usage in megabytes, as computed by the model itself.
    fn memory_usage(&self) -> f64;

    /// Release whatever memory the model can spare.
    async fn optimize_memory(&self) -> Result<(), ModelError>;
}

/// Identity comparison for trait objects, ignoring vtable pointers.
pub(crate) fn same_manager(a: &Arc<dyn ModelManager>, b: &Arc<dyn ModelManager>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
