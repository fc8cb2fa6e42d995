//! Retry-with-backoff wrapper around `SQLITE_BUSY`. Every mutation in this
//! crate routes through [`with_retry`] so the backoff policy lives in one
//! place instead of being re-implemented at each call site.

use std::thread::sleep;
use std::time::Duration;

use rand::Rng;
use rusqlite::ErrorCode;

use crate::error::{StoreError, StoreResult};

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY_MS: u64 = 100;
const JITTER_MS: i64 = 50;

/// Run `f`, retrying up to [`MAX_ATTEMPTS`] times with exponential backoff
/// (base 100 ms, ×2 per attempt) plus ±50 ms jitter whenever `f` fails with
/// `SQLITE_BUSY`. Any other error is returned immediately.
pub fn with_retry<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> StoreResult<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                let backoff_ms = BASE_DELAY_MS * (1u64 << (attempt - 1));
                let jitter = rand::thread_rng().gen_range(-JITTER_MS..=JITTER_MS);
                let delay_ms = (backoff_ms as i64 + jitter).max(0) as u64;
                tracing::debug!(attempt, delay_ms, "sqlite busy, retrying");
                sleep(Duration::from_millis(delay_ms));
            }
            Err(e) if is_busy(&e) => {
                return Err(StoreError::RetriesExhausted {
                    attempts: MAX_ATTEMPTS,
                });
            }
            Err(e) => return Err(StoreError::Database(e)),
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DatabaseBusy
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_immediately_on_ok() {
        let mut calls = 0;
        let result: StoreResult<i32> = with_retry(|| {
            calls += 1;
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn propagates_non_busy_errors_without_retrying() {
        let mut calls = 0;
        let result: StoreResult<()> = with_retry(|| {
            calls += 1;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
