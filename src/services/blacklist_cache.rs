//! TTL cache of per-address block status.
//!
//! Entries are externally managed; the hub only reads them. A cached entry
//! is a hint with the same 15-minute lifetime as the revocation cache.

use std::time::Duration;

use crate::errors::HubResult;
use crate::models::records::{BlacklistType, PerformType};
use crate::services::driver::StorageDriver;
use crate::services::ttl_cache::TtlLruCache;

const ENTRY_TTL: Duration = Duration::from_secs(15 * 60);

pub struct BlacklistCache {
    cache: TtlLruCache<BlacklistType>,
}

impl BlacklistCache {
    pub fn new(capacity: usize) -> Self {
        BlacklistCache {
            cache: TtlLruCache::new(capacity, ENTRY_TTL),
        }
    }

    pub async fn is_blacklisted(
        &self,
        driver: &dyn StorageDriver,
        address: &str,
        perform: PerformType,
    ) -> HubResult<bool> {
        let block_type = match self.cache.get(address) {
            Some(cached) => cached,
            None => {
                let fetched = driver.read_blacklist_type(address).await?;
                self.cache.put(address, fetched);
                fetched
            }
        };
        Ok(block_type.blocks(perform))
    }

    pub fn take_eviction_count(&self) -> u64 {
        self.cache.take_eviction_count()
    }
}
