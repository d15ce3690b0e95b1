//! Identity/role store and the caller capability handed to the engines.
//!
//! Authentication happens upstream. By the time a request reaches this
//! service its user id is trusted; all that is left to decide here is
//! whether that user may run an administrative mutation.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use tracing::info;

use crate::db;
use crate::errors::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

/// The slice of a user profile this service reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub role: Role,
    pub wallet_balance: i64,
    #[serde(skip)]
    pub version: i64,
}

impl Profile {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            phone: None,
            email: None,
            role: Role::Member,
            wallet_balance: 0,
            version: 0,
        }
    }
}

/// Verified caller of an engine operation.
///
/// Resolved once per request so the role lookup is not repeated inside
/// every data-access call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    /// Look up the caller's role. Unknown users are plain members.
    pub async fn resolve(pool: &SqlitePool, user_id: &str) -> Result<Self> {
        let role = if is_admin(pool, user_id).await? {
            Role::Admin
        } else {
            Role::Member
        };
        Ok(Self {
            user_id: user_id.to_string(),
            role,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self, action: &str) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(LedgerError::PermissionDenied(format!(
                "{} may not {action}",
                self.user_id
            )))
        }
    }
}

pub async fn get_profile(pool: &SqlitePool, user_id: &str) -> Result<Option<Profile>> {
    let mut conn = pool.acquire().await?;
    db::fetch_profile(&mut conn, user_id).await
}

pub async fn is_admin(pool: &SqlitePool, user_id: &str) -> Result<bool> {
    Ok(get_profile(pool, user_id)
        .await?
        .is_some_and(|p| p.role == Role::Admin))
}

/// Create or refresh a profile. `wallet_balance` is honoured only when the
/// profile does not exist yet.
pub async fn upsert_profile(pool: &SqlitePool, profile: &Profile) -> Result<()> {
    if profile.wallet_balance < 0 {
        return Err(LedgerError::InvalidAmount(profile.wallet_balance));
    }
    let mut conn = pool.acquire().await?;
    db::upsert_profile(&mut conn, profile).await
}

/// Make sure `user_id` exists and holds the admin role. Used to seed the
/// first administrator at start-up.
pub async fn ensure_admin(pool: &SqlitePool, user_id: &str) -> Result<()> {
    let mut profile = get_profile(pool, user_id)
        .await?
        .unwrap_or_else(|| Profile::new(user_id, user_id));
    if profile.role == Role::Admin {
        return Ok(());
    }
    profile.role = Role::Admin;
    upsert_profile(pool, &profile).await?;
    info!("Granted admin role to {user_id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[tokio::test]
    async fn unknown_user_resolves_to_member() {
        let pool = testutil::pool().await;
        let caller = Caller::resolve(&pool, "ghost").await.unwrap();
        assert_eq!(caller.role, Role::Member);
        assert!(matches!(
            caller.require_admin("delete donations"),
            Err(LedgerError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn admin_role_is_read_from_profile() {
        let pool = testutil::pool().await;
        testutil::admin(&pool, "root").await;

        let caller = Caller::resolve(&pool, "root").await.unwrap();
        assert!(caller.is_admin());
        assert!(caller.require_admin("delete donations").is_ok());
        assert!(is_admin(&pool, "root").await.unwrap());
        assert!(!is_admin(&pool, "nobody").await.unwrap());
    }

    #[tokio::test]
    async fn upsert_keeps_existing_wallet_balance() {
        let pool = testutil::pool().await;
        testutil::member(&pool, "u1", 100).await;

        let mut refreshed = Profile::new("u1", "Renamed");
        refreshed.wallet_balance = 9_999;
        upsert_profile(&pool, &refreshed).await.unwrap();

        let profile = get_profile(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(profile.display_name, "Renamed");
        assert_eq!(profile.wallet_balance, 100);
    }

    #[tokio::test]
    async fn ensure_admin_creates_or_promotes() {
        let pool = testutil::pool().await;
        testutil::member(&pool, "u1", 40).await;

        ensure_admin(&pool, "u1").await.unwrap();
        ensure_admin(&pool, "fresh").await.unwrap();
        ensure_admin(&pool, "fresh").await.unwrap();

        let promoted = get_profile(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(promoted.role, Role::Admin);
        assert_eq!(promoted.wallet_balance, 40);
        assert_eq!(promoted.phone, Some(testutil::phone_for("u1")));
        assert!(is_admin(&pool, "fresh").await.unwrap());
    }

    #[tokio::test]
    async fn negative_opening_balance_rejected() {
        let pool = testutil::pool().await;
        let mut profile = Profile::new("u1", "Neg");
        profile.wallet_balance = -1;
        assert!(matches!(
            upsert_profile(&pool, &profile).await,
            Err(LedgerError::InvalidAmount(-1))
        ));
    }
}
