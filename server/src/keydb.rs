use std::time::Duration;

use log::warn;
use redis::aio::MultiplexedConnection;
use tokio::time::sleep;

use crate::kv::StoreError;

pub const DEFAULT_KEYDB_URL: &str = "redis://127.0.0.1:5556/";

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY_SECS: u64 = 6;

/// Opens a multiplexed connection, retrying while KeyDB is still coming up.
pub async fn connect_with_retry(keydb_url: &str) -> Result<MultiplexedConnection, StoreError> {
    let mut attempt = 0;
    loop {
        let result = match redis::Client::open(keydb_url) {
            Ok(client) => client.get_multiplexed_async_connection().await,
            Err(err) => Err(err),
        };

        match result {
            Ok(con) => return Ok(con),
            Err(err) if attempt < MAX_RETRIES => {
                warn!(
                    "Failed to connect to KeyDB at {} (attempt {}/{}): {}, retrying in {}s",
                    keydb_url,
                    attempt + 1,
                    MAX_RETRIES + 1,
                    err,
                    RETRY_DELAY_SECS
                );
                sleep(Duration::from_secs(RETRY_DELAY_SECS)).await;
                attempt += 1;
            }
            Err(err) => return Err(StoreError::Redis(err)),
        }
    }
}
