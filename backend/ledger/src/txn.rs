//! Optimistic read-compute-commit runner.
//!
//! Each engine operation is a body that reads the records it needs, computes
//! every write from those reads, and issues version-checked writes on the
//! same connection. The runner wraps the body in one database transaction
//! and commits. When the body or the commit reports a conflict (a stale
//! version, a duplicate key, or SQLite refusing the write lock) the whole
//! attempt is rolled back and re-run from a fresh snapshot, up to
//! [`RetryPolicy::max_attempts`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::errors::{LedgerError, Result};

/// Future returned by a transaction body, borrowing the attempt's connection.
pub type TxnFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Run `body` inside an optimistic transaction, retrying on conflict.
///
/// `body` is called once per attempt and must not carry state between
/// attempts: everything it writes has to be derived from what it reads on
/// the connection it is handed.
pub async fn run<T, F>(
    pool: &SqlitePool,
    policy: &RetryPolicy,
    op: &'static str,
    mut body: F,
) -> Result<T>
where
    T: Send,
    F: for<'c> FnMut(&'c mut SqliteConnection) -> TxnFuture<'c, T> + Send,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        debug!(op, attempt, "Starting transaction attempt");

        match attempt_once(pool, &mut body).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() => {
                if attempt >= policy.max_attempts {
                    warn!(op, attempt, "Giving up after repeated conflicts: {e}");
                    return Err(LedgerError::TransactionConflict { attempts: attempt });
                }
                let delay = policy.backoff(attempt);
                warn!(op, attempt, "Conflict ({e}); retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn attempt_once<T, F>(pool: &SqlitePool, body: &mut F) -> Result<T>
where
    F: for<'c> FnMut(&'c mut SqliteConnection) -> TxnFuture<'c, T>,
{
    let mut tx = pool.begin().await?;
    match body(&mut *tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed: {rollback_err}");
            }
            Err(e)
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::db;
    use crate::testutil;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(5));
        assert_eq!(policy.backoff(2), Duration::from_millis(10));
        assert_eq!(policy.backoff(3), Duration::from_millis(20));
        assert_eq!(policy.backoff(6), Duration::from_millis(100));
        assert_eq!(policy.backoff(60), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn retries_until_body_succeeds() {
        let pool = testutil::pool().await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let value = run(&pool, &fast_policy(5), "flaky", move |_conn| {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(LedgerError::StaleRead("test".into()));
                }
                Ok(42)
            })
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_conflict_after_budget() {
        let pool = testutil::pool().await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let err = run(&pool, &fast_policy(3), "always_stale", move |_conn| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LedgerError::StaleRead("test".into()))
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, LedgerError::TransactionConflict { attempts: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn domain_errors_are_not_retried() {
        let pool = testutil::pool().await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let err = run(&pool, &fast_policy(5), "missing", move |_conn| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LedgerError::CampaignNotFound("nope".into()))
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, LedgerError::CampaignNotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_from_another_connection_forces_a_rerun() {
        let (pool, _dir) = testutil::shared_pool().await;
        testutil::campaign(&pool, "c1", "Clean Water").await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let other = pool.clone();
        let raised = run(&pool, &fast_policy(5), "bump", move |conn| {
            let counter = counter.clone();
            let other = other.clone();
            Box::pin(async move {
                let seen = db::fetch_campaign(conn, "c1")
                    .await?
                    .ok_or_else(|| LedgerError::CampaignNotFound("c1".into()))?;

                // First attempt only: a second connection commits a write
                // after this snapshot was taken.
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    let mut rival = other.acquire().await?;
                    db::write_raised_amount(&mut rival, "c1", seen.version, 100).await?;
                }

                let raised = seen.raised_amount + 5;
                db::write_raised_amount(conn, "c1", seen.version, raised).await?;
                Ok(raised)
            })
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(raised, 105);
        let mut conn = pool.acquire().await.unwrap();
        let campaign = db::fetch_campaign(&mut conn, "c1").await.unwrap().unwrap();
        assert_eq!(campaign.raised_amount, 105);
        assert_eq!(campaign.version, 2);
    }

    #[tokio::test]
    async fn failed_attempt_leaves_no_writes() {
        let pool = testutil::pool().await;

        let err = run(&pool, &fast_policy(2), "write_then_fail", |conn| {
            Box::pin(async move {
                db::insert_campaign(conn, "c-rollback", "Rollback").await?;
                Err::<(), _>(LedgerError::StaleRead("campaigns/c-rollback".into()))
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LedgerError::TransactionConflict { attempts: 2 }));

        let mut conn = pool.acquire().await.unwrap();
        assert!(db::fetch_campaign(&mut conn, "c-rollback")
            .await
            .unwrap()
            .is_none());
    }
}
