use std::sync::Arc;

use tracing::warn;
use vigil_core::{
    config::KbConfig,
    kb::{KbConnector, KbResult, MemoryConnector, MemoryKb, RetryPolicy, redis::RedisConnector},
};

/// Logical databases in the development store.
const MEMORY_KB_DATABASES: usize = 16;

/// Picks the KB backend. The in-memory store only exists for local
/// development; engines running as separate processes cannot see it.
pub fn build_connector(config: &KbConfig, memory: bool) -> KbResult<Arc<dyn KbConnector>> {
    if memory {
        warn!(
            databases = MEMORY_KB_DATABASES,
            "using in-memory KB; external engines will not see scan data"
        );
        let store = MemoryKb::new(MEMORY_KB_DATABASES);
        return Ok(Arc::new(MemoryConnector::new(
            store,
            RetryPolicy::from_config(config),
        )));
    }

    Ok(Arc::new(RedisConnector::new(config)?))
}
