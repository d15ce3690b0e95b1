//! Reaction toggle engine.
//!
//! A reaction is "on" exactly when its membership row exists. Toggling
//! flips the row and moves the campaign counter in the same transaction, so
//! the counter always equals the number of membership rows of that type.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::db;
use crate::errors::{LedgerError, Result};
use crate::models::{ReactionOutcome, ReactionType};
use crate::txn::{self, RetryPolicy};

#[derive(Debug, Clone)]
pub struct Reactions {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl Reactions {
    pub fn new(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub async fn toggle(
        &self,
        campaign_id: &str,
        user_id: &str,
        kind: ReactionType,
    ) -> Result<ReactionOutcome> {
        if user_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("user id is required".to_string()));
        }

        let outcome = txn::run(&self.pool, &self.retry, "toggle_reaction", |conn| {
            Box::pin(toggle_attempt(
                conn,
                campaign_id.to_string(),
                user_id.to_string(),
                kind,
            ))
        })
        .await?;

        debug!(
            "{user_id} {} {} on {campaign_id}; count now {}",
            if outcome.user_has_reacted { "added" } else { "removed" },
            kind.as_str(),
            outcome.new_count
        );
        Ok(outcome)
    }

    pub async fn has_reacted(
        &self,
        campaign_id: &str,
        user_id: &str,
        kind: ReactionType,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        db::reaction_exists(&mut conn, campaign_id, user_id, kind).await
    }
}

async fn toggle_attempt(
    conn: &mut SqliteConnection,
    campaign_id: String,
    user_id: String,
    kind: ReactionType,
) -> Result<ReactionOutcome> {
    let campaign = db::fetch_campaign(conn, &campaign_id)
        .await?
        .ok_or_else(|| LedgerError::CampaignNotFound(campaign_id.clone()))?;
    let current = match kind {
        ReactionType::Like => campaign.like_count,
        ReactionType::Support => campaign.support_count,
    };

    let outcome = if db::reaction_exists(conn, &campaign_id, &user_id, kind).await? {
        db::delete_reaction(conn, &campaign_id, &user_id, kind).await?;
        ReactionOutcome {
            new_count: (current - 1).max(0),
            user_has_reacted: false,
        }
    } else {
        let now = Utc::now().timestamp();
        db::insert_reaction(conn, &campaign_id, &user_id, kind, now).await?;
        ReactionOutcome {
            new_count: current + 1,
            user_has_reacted: true,
        }
    };

    db::write_reaction_count(conn, &campaign_id, kind, campaign.version, outcome.new_count).await?;
    Ok(outcome)
}
