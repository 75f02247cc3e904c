//! Hash-backed key/value store.

use async_trait::async_trait;
use buildq_core::{KvStore, Result};
use redis::aio::ConnectionManager;

use crate::store_error;

/// `KvStore` over redis hashes (`HGET`/`HSET`/`HDEL`).
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        // HDEL is atomic: only one caller sees the field removed.
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }
}
