//! Write-through TTL cache over the per-bucket revocation timestamps.
//!
//! The cached value is the oldest valid `iat` for a bucket address. It must
//! be non-decreasing over the process lifetime: reads merge the driver value
//! with any fresher cached one, and writes never replace a larger cached
//! value with a smaller one.

use std::time::Duration;

use crate::errors::HubResult;
use crate::services::driver::StorageDriver;
use crate::services::ttl_cache::TtlLruCache;

const ENTRY_TTL: Duration = Duration::from_secs(15 * 60);

pub struct AuthTimestampCache {
    cache: TtlLruCache<u64>,
}

impl AuthTimestampCache {
    pub fn new(capacity: usize) -> Self {
        AuthTimestampCache {
            cache: TtlLruCache::new(capacity, ENTRY_TTL),
        }
    }

    /// Largest timestamp seen for `address`, refreshed from cache and driver.
    fn put_max(&self, address: &str, timestamp: u64) -> u64 {
        let merged = match self.cache.get(address) {
            Some(cached) if cached > timestamp => cached,
            _ => timestamp,
        };
        self.cache.put(address, merged);
        merged
    }

    /// Current revocation floor for a bucket, unix seconds (0 when unset).
    pub async fn get_auth_timestamp(
        &self,
        driver: &dyn StorageDriver,
        address: &str,
    ) -> HubResult<u64> {
        if let Some(cached) = self.cache.get(address) {
            return Ok(cached);
        }
        let fetched = driver.read_auth_timestamp(address).await?;
        // a concurrent set may have landed while we were reading; keep the max
        Ok(self.put_max(address, fetched))
    }

    /// Raise the revocation floor for a bucket.
    pub async fn set_auth_timestamp(
        &self,
        driver: &dyn StorageDriver,
        address: &str,
        timestamp: u64,
    ) -> HubResult<()> {
        if let Some(cached) = self.cache.get(address) {
            if cached > timestamp {
                // a fresher floor is already written through
                return Ok(());
            }
        }
        driver.write_auth_timestamp(address, timestamp).await?;
        self.put_max(address, timestamp);
        Ok(())
    }

    pub fn take_eviction_count(&self) -> u64 {
        self.cache.take_eviction_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::driver::test_support::MockDriver;

    #[tokio::test]
    async fn reads_through_and_caches() {
        let driver = MockDriver::default();
        driver.set_auth_timestamp_value("addr", 42);
        let cache = AuthTimestampCache::new(16);

        assert_eq!(cache.get_auth_timestamp(&driver, "addr").await.unwrap(), 42);
        assert_eq!(driver.auth_timestamp_reads(), 1);

        // second read is served from cache
        assert_eq!(cache.get_auth_timestamp(&driver, "addr").await.unwrap(), 42);
        assert_eq!(driver.auth_timestamp_reads(), 1);
    }

    #[tokio::test]
    async fn cached_floor_is_monotone() {
        let driver = MockDriver::default();
        let cache = AuthTimestampCache::new(16);

        cache.set_auth_timestamp(&driver, "addr", 100).await.unwrap();
        cache.set_auth_timestamp(&driver, "addr", 50).await.unwrap();
        assert_eq!(
            cache.get_auth_timestamp(&driver, "addr").await.unwrap(),
            100
        );

        cache.set_auth_timestamp(&driver, "addr", 200).await.unwrap();
        assert_eq!(
            cache.get_auth_timestamp(&driver, "addr").await.unwrap(),
            200
        );
    }

    #[tokio::test]
    async fn stale_driver_value_does_not_lower_cached_floor() {
        let driver = MockDriver::default();
        let cache = AuthTimestampCache::new(16);

        cache.set_auth_timestamp(&driver, "addr", 300).await.unwrap();
        // pretend the driver still reports an older value
        driver.set_auth_timestamp_value("addr", 10);
        assert_eq!(
            cache.get_auth_timestamp(&driver, "addr").await.unwrap(),
            300
        );
    }
}
