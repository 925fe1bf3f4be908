use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::zone::ServerEntry;

/// Key identifying one memoized selection: the client address, the
/// server set consulted and the normalized selection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub(crate) client: String,
    pub(crate) set: String,
    pub(crate) params: String,
}

struct CacheEntry {
    expires_at: Instant,
    servers: Vec<ServerEntry>,
}

/// Short-TTL memoization of geo selection results, so a client asking
/// repeatedly gets a consistent answer without repeated GeoIP work.
#[derive(Default)]
pub(crate) struct GeoCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl GeoCache {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// An entry past its expiry is treated as absent even if the idle
    /// loop has not evicted it yet.
    pub(crate) async fn get(&self, key: &CacheKey) -> Option<Vec<ServerEntry>> {
        let entries = self.entries.lock().await;
        let entry = entries.get(key)?;

        if entry.expires_at <= Instant::now() {
            return None;
        }

        Some(entry.servers.clone())
    }

    pub(crate) async fn insert(&self, key: CacheKey, servers: Vec<ServerEntry>, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            CacheEntry {
                expires_at: Instant::now() + ttl,
                servers,
            },
        );
    }

    pub(crate) async fn evict_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
