//! Per-bundle advisory locking.
//!
//! The lock is a row in storage, so every connection to the same database
//! sees it. Acquisition is retried a bounded number of times; a lock older
//! than the configured TTL is treated as abandoned and taken over.

use entitlement_core::{ids::BundleId, Clock};
use entitlement_storage::Storage;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::EngineError;

pub fn acquire<S: Storage + ?Sized>(
    storage: &mut S,
    bundle_id: BundleId,
    owner: &str,
    clock: &dyn Clock,
    config: &EngineConfig,
) -> Result<(), EngineError> {
    for attempt in 1..=config.lock_retry_attempts {
        if storage.try_acquire_bundle_lock(bundle_id, owner, clock.now(), config.lock_ttl())? {
            return Ok(());
        }
        debug!(%bundle_id, attempt, "bundle lock busy");
        if attempt < config.lock_retry_attempts {
            std::thread::sleep(config.lock_backoff());
        }
    }
    Err(EngineError::LockTimeout {
        bundle_id,
        attempts: config.lock_retry_attempts,
    })
}

pub fn release<S: Storage + ?Sized>(
    storage: &mut S,
    bundle_id: BundleId,
    owner: &str,
) -> Result<(), EngineError> {
    storage.release_bundle_lock(bundle_id, owner)?;
    Ok(())
}
