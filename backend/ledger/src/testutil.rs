//! Shared fixtures for unit tests.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::db;
use crate::identity::{self, Caller, Profile, Role};
use crate::ledger::Ledger;
use crate::notify::{Notification, NotificationDispatcher};
use crate::registrations::Registrations;
use crate::txn::RetryPolicy;

/// Fresh in-memory database with migrations applied.
///
/// One connection that never expires, so the database lives as long as the
/// pool and concurrent callers queue on it.
pub async fn pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    db::migrate(&pool).await.unwrap();
    pool
}

/// File-backed WAL database with several connections, so transactions on
/// different tasks genuinely overlap and conflict.
///
/// Keep the returned directory alive for as long as the pool is used.
pub async fn shared_pool() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let pool = db::init_pool(path.to_str().unwrap()).await.unwrap();
    (pool, dir)
}

/// Budget for tests that race many writers against one row.
pub fn contended_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 100,
        base_backoff_ms: 1,
        max_backoff_ms: 20,
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        base_backoff_ms: 0,
        max_backoff_ms: 0,
    }
}

pub fn ledger(pool: &SqlitePool) -> (Ledger, UnboundedReceiver<Notification>) {
    let (notifier, rx) = NotificationDispatcher::channel();
    (Ledger::new(pool.clone(), fast_retry(), notifier), rx)
}

pub fn registrations(pool: &SqlitePool) -> (Registrations, UnboundedReceiver<Notification>) {
    let (notifier, rx) = NotificationDispatcher::channel();
    (Registrations::new(pool.clone(), fast_retry(), notifier), rx)
}

pub fn contended_ledger(pool: &SqlitePool) -> (Ledger, UnboundedReceiver<Notification>) {
    let (notifier, rx) = NotificationDispatcher::channel();
    (Ledger::new(pool.clone(), contended_retry(), notifier), rx)
}

pub fn contended_registrations(
    pool: &SqlitePool,
) -> (Registrations, UnboundedReceiver<Notification>) {
    let (notifier, rx) = NotificationDispatcher::channel();
    (Registrations::new(pool.clone(), contended_retry(), notifier), rx)
}

pub async fn campaign(pool: &SqlitePool, id: &str, name: &str) {
    let mut conn = pool.acquire().await.unwrap();
    db::insert_campaign(&mut conn, id, name).await.unwrap();
}

pub async fn event(pool: &SqlitePool, id: &str, title: &str) {
    let mut conn = pool.acquire().await.unwrap();
    db::insert_event(&mut conn, id, title).await.unwrap();
}

pub fn phone_for(user_id: &str) -> String {
    format!("+1555{user_id}")
}

pub async fn member(pool: &SqlitePool, user_id: &str, wallet_balance: i64) {
    let mut profile = Profile::new(user_id, format!("Member {user_id}"));
    profile.phone = Some(phone_for(user_id));
    profile.email = Some(format!("{user_id}@example.org"));
    profile.wallet_balance = wallet_balance;
    identity::upsert_profile(pool, &profile).await.unwrap();
}

pub async fn admin(pool: &SqlitePool, user_id: &str) -> Caller {
    let mut profile = Profile::new(user_id, format!("Admin {user_id}"));
    profile.role = Role::Admin;
    identity::upsert_profile(pool, &profile).await.unwrap();
    Caller::resolve(pool, user_id).await.unwrap()
}
