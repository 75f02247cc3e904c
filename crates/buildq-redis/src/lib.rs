//! Redis layer for buildq.
//!
//! Provides the `Broker` and `KvStore` implementations used by the worker
//! process. Queue data follows the resque key layout so existing producers
//! and dashboards keep working.

pub mod broker;
pub mod keys;
pub mod store;

pub use broker::RedisBroker;
pub use keys::Keys;
pub use store::RedisKvStore;

use buildq_config::RedisSettings;
use buildq_core::{Error, Result};
use redis::aio::ConnectionManager;
use tracing::info;
use url::Url;

/// Build the connection URL for the configured broker.
pub fn connection_url(settings: &RedisSettings) -> Result<Url> {
    let scheme = if settings.tls { "rediss" } else { "redis" };
    let mut url = Url::parse(&format!(
        "{}://{}:{}/{}",
        scheme, settings.host, settings.port, settings.database
    ))
    .map_err(|e| Error::InvalidInput(format!("invalid redis address: {}", e)))?;

    if let Some(password) = &settings.password {
        url.set_password(Some(password))
            .map_err(|_| Error::InvalidInput("cannot set redis password".to_string()))?;
    }

    Ok(url)
}

/// Open a reconnecting connection to the broker.
pub async fn connect(settings: &RedisSettings) -> Result<ConnectionManager> {
    let url = connection_url(settings)?;
    let client = redis::Client::open(url.as_str()).map_err(broker_error)?;
    let conn = ConnectionManager::new(client).await.map_err(broker_error)?;
    info!(host = %settings.host, port = settings.port, db = settings.database, tls = settings.tls, "Connected to redis");
    Ok(conn)
}

pub(crate) fn broker_error(err: redis::RedisError) -> Error {
    Error::Broker(err.to_string())
}

pub(crate) fn store_error(err: redis::RedisError) -> Error {
    Error::Store(err.to_string())
}
