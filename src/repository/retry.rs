//! Retry helper for contended SQLite writes.
//!
//! `busy_timeout` covers most lock waits; this catches the remaining
//! `SQLITE_BUSY` results that SQLite returns without invoking the handler.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use super::pool::DieselError;
use super::util::is_busy_error;

const BUSY_MAX_RETRIES: u32 = 8;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

pub async fn retry_on_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T, DieselError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DieselError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_busy_error(&err) || attempt >= BUSY_MAX_RETRIES {
                    return Err(err);
                }

                let delay_ms = BUSY_BASE_DELAY_MS
                    .saturating_mul(1u64 << attempt)
                    .min(BUSY_MAX_DELAY_MS);
                let delay = Duration::from_millis(delay_ms);

                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    BUSY_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
