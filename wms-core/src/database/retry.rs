//! Retry helpers for database operations.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const SQLITE_BUSY_MAX_RETRIES: usize = 8;
const SQLITE_BUSY_BASE_DELAY_MS: u64 = 10;
const SQLITE_BUSY_MAX_DELAY_MS: u64 = 1000;

fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    // SQLITE_BUSY (5) and SQLITE_LOCKED (6).
    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Delay before retry number `attempt` (0-based), with up to 25% jitter.
fn backoff_delay(attempt: usize) -> Duration {
    let exp_backoff_ms = SQLITE_BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    let capped_ms = exp_backoff_ms.min(SQLITE_BUSY_MAX_DELAY_MS);
    let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
    Duration::from_millis((capped_ms + jitter_ms).min(SQLITE_BUSY_MAX_DELAY_MS))
}

/// Re-run `op` while it fails with SQLITE_BUSY / SQLITE_LOCKED.
///
/// Only safe for idempotent operations: the deferred task-queue cleanup is the
/// main user.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_sqlite_busy_error(&err) || attempt >= SQLITE_BUSY_MAX_RETRIES {
                    return Err(err);
                }

                let delay = backoff_delay(attempt);
                debug!(
                    op = op_name,
                    ?delay,
                    attempt = attempt + 1,
                    max = SQLITE_BUSY_MAX_RETRIES,
                    "SQLite busy, retrying"
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
