use crate::chart::clock::now_unix_ms;
use crate::chart::types::{PersistedPrice, PRICE_CACHE_PREFIX};
use crate::error::AppError;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Minimal string key-value storage the price cache persists into.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), AppError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    unavailable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every operation fails, like storage blocked by the host.
    pub fn unavailable() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            unavailable: true,
        }
    }

    #[cfg(test)]
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable {
            return Err(AppError::Storage("memory store disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        self.check_available()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.check_available()?;
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value_json FROM price_cache WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO price_cache (cache_key, value_json, updated_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(cache_key) DO UPDATE SET value_json=excluded.value_json, updated_at_ms=excluded.updated_at_ms",
        )
        .bind(key)
        .bind(value)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Best-effort last-known price per (topic, symbol). Never fails outward.
#[derive(Clone)]
pub struct PriceCache {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl PriceCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            prefix: PRICE_CACHE_PREFIX.to_string(),
        }
    }

    pub fn key(&self, topic: &str, symbol: &str) -> String {
        format!(
            "{}:{}:{}",
            self.prefix,
            topic.trim().to_ascii_lowercase(),
            symbol.trim().to_ascii_uppercase()
        )
    }

    pub async fn read(&self, topic: &str, symbol: &str) -> Option<PersistedPrice> {
        let key = self.key(topic, symbol);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                debug!(%key, %error, "price cache read failed");
                return None;
            }
        };

        match serde_json::from_str::<PersistedPrice>(&raw) {
            Ok(entry) if entry.price.is_finite() && entry.price > 0.0 => Some(entry),
            Ok(_) => None,
            Err(error) => {
                debug!(%key, %error, "discarding corrupt price cache entry");
                None
            }
        }
    }

    pub async fn write(&self, topic: &str, symbol: &str, price: f64, timestamp_ms: i64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }

        let key = self.key(topic, symbol);
        let entry = PersistedPrice {
            price,
            timestamp: timestamp_ms,
        };
        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(%key, %error, "failed to encode price cache entry");
                return;
            }
        };

        if let Err(error) = self.store.set(&key, &encoded).await {
            warn!(%key, %error, "price cache write skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    fn memory_cache() -> (Arc<MemoryStore>, PriceCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = PriceCache::new(store.clone());
        (store, cache)
    }

    #[tokio::test]
    async fn round_trips_latest_price() {
        let (_, cache) = memory_cache();
        cache.write("crypto_prices", "btcusdt", 42.5, 1_700_000_000_000).await;

        let entry = cache.read("crypto_prices", "btcusdt").await;
        assert_eq!(
            entry,
            Some(PersistedPrice {
                price: 42.5,
                timestamp: 1_700_000_000_000
            })
        );
    }

    #[tokio::test]
    async fn ignores_invalid_prices_and_keeps_previous_value() {
        let (_, cache) = memory_cache();
        cache.write("crypto_prices", "btcusdt", 42.5, 1).await;
        cache.write("crypto_prices", "btcusdt", -3.0, 2).await;
        cache.write("crypto_prices", "btcusdt", f64::NAN, 3).await;

        let entry = cache
            .read("crypto_prices", "btcusdt")
            .await
            .expect("previous entry should survive");
        assert_eq!(entry.price, 42.5);
        assert_eq!(entry.timestamp, 1);
    }

    #[tokio::test]
    async fn key_is_case_normalized() {
        let (_, cache) = memory_cache();
        assert_eq!(
            cache.key("Crypto_Prices", "btcusdt"),
            "chart-feed:last-price:crypto_prices:BTCUSDT"
        );

        cache.write("CRYPTO_PRICES", "BtcUsdt", 10.0, 5).await;
        assert!(cache.read("crypto_prices", "btcusdt").await.is_some());
    }

    #[tokio::test]
    async fn corrupt_entries_read_as_missing() {
        let (store, cache) = memory_cache();
        store.insert_raw(&cache.key("crypto_prices", "ethusdt"), "{not json");
        assert_eq!(cache.read("crypto_prices", "ethusdt").await, None);
    }

    #[tokio::test]
    async fn unavailable_storage_is_swallowed() {
        let cache = PriceCache::new(Arc::new(MemoryStore::unavailable()));
        cache.write("crypto_prices", "btcusdt", 10.0, 5).await;
        assert_eq!(cache.read("crypto_prices", "btcusdt").await, None);
    }

    #[tokio::test]
    async fn sqlite_store_overwrites_single_entry() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should initialize");
        run_migrations(&pool)
            .await
            .expect("migrations should apply");
        let cache = PriceCache::new(Arc::new(SqliteStore::new(pool.clone())));

        cache.write("crypto_prices", "btcusdt", 100.0, 1).await;
        cache.write("crypto_prices", "btcusdt", 101.0, 2).await;

        let entry = cache
            .read("crypto_prices", "btcusdt")
            .await
            .expect("entry should exist");
        assert_eq!(entry.price, 101.0);

        let rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM price_cache")
            .fetch_one(&pool)
            .await
            .expect("price_cache should be queryable");
        assert_eq!(rows, 1);
    }
}
