//! Ledger transaction engine.
//!
//! The only writer of `campaigns.raised_amount` and `profiles.wallet_balance`.
//! Every public mutation is a single optimistic transaction (see
//! [`crate::txn`]) whose writes are computed from values read in that same
//! attempt, so the campaign total always equals the sum of its succeeded
//! transactions once the call returns.
//!
//! | Operation               | Campaign total            | Wallet            |
//! |-------------------------|---------------------------|-------------------|
//! | create (wallet)         | `+ amount`                | `- amount`        |
//! | create (manual)         | unchanged (pending)       | unchanged         |
//! | status → Succeeded      | `+ amount`                | unchanged         |
//! | Succeeded → Refunded    | `- amount` (floored at 0) | `+ amount`        |
//! | delete a Succeeded row  | `- amount` (floored at 0) | unchanged         |

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db;
use crate::errors::{LedgerError, Result};
use crate::identity::{Caller, Profile};
use crate::models::{
    CampaignAudit, CampaignFund, NewDonation, PaymentMethod, PaymentStatus, PaymentTransaction,
    ReactionType, Transition,
};
use crate::notify::{Notification, NotificationDispatcher};
use crate::txn::{self, RetryPolicy};

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
    retry: RetryPolicy,
    notifier: NotificationDispatcher,
}

/// What a committed donation attempt hands back for the notification.
struct CreatedDonation {
    payment: PaymentTransaction,
    donor: Option<Profile>,
}

impl Ledger {
    pub fn new(pool: SqlitePool, retry: RetryPolicy, notifier: NotificationDispatcher) -> Self {
        Self {
            pool,
            retry,
            notifier,
        }
    }

    /// Record a donation and return the new transaction id.
    ///
    /// Wallet donations succeed immediately and move funds in the same
    /// transaction; manual transfers stay pending until an admin confirms them.
    pub async fn create_donation(&self, input: NewDonation) -> Result<String> {
        validate_donation(&input)?;
        let id = Uuid::new_v4().to_string();

        let created = txn::run(&self.pool, &self.retry, "create_donation", |conn| {
            Box::pin(create_donation_attempt(conn, id.clone(), input.clone()))
        })
        .await?;

        let payment = &created.payment;
        info!(
            "Donation {} committed: {} to campaign {} via {} ({})",
            payment.id, payment.amount, payment.campaign_id, payment.method, payment.status
        );

        self.notify_donation(payment, created.donor.as_ref());
        Ok(created.payment.id)
    }

    /// Move a transaction to `status`, applying the funding side effects
    /// implied by the old and new status.
    pub async fn update_donation_status(
        &self,
        caller: &Caller,
        id: &str,
        status: PaymentStatus,
    ) -> Result<()> {
        caller.require_admin("update donation status")?;

        let previous = txn::run(&self.pool, &self.retry, "update_donation_status", |conn| {
            Box::pin(update_status_attempt(conn, id.to_string(), status))
        })
        .await?;

        if previous == status {
            debug!("Donation {id} already {status}; nothing to do");
        } else {
            info!("Donation {id} moved {previous} -> {status} by {}", caller.user_id);
        }
        Ok(())
    }

    /// Delete a transaction, backing it out of the campaign total first if
    /// it had succeeded. Deleting a missing id is a no-op.
    ///
    /// Unlike a refund this does not credit the donor's wallet.
    pub async fn delete_donation(&self, caller: &Caller, id: &str) -> Result<()> {
        caller.require_admin("delete donations")?;

        let deleted = txn::run(&self.pool, &self.retry, "delete_donation", |conn| {
            Box::pin(delete_attempt(conn, id.to_string()))
        })
        .await?;

        match deleted {
            Some(payment) => info!(
                "Donation {id} ({} {}, {}) deleted by {}",
                payment.amount, payment.method, payment.status, caller.user_id
            ),
            None => debug!("Donation {id} already gone"),
        }
        Ok(())
    }

    pub async fn get_donation(&self, id: &str) -> Result<PaymentTransaction> {
        let mut conn = self.pool.acquire().await?;
        db::fetch_payment(&mut conn, id)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))
    }

    pub async fn list_campaign_donations(&self, campaign_id: &str) -> Result<Vec<PaymentTransaction>> {
        let mut conn = self.pool.acquire().await?;
        if db::fetch_campaign(&mut conn, campaign_id).await?.is_none() {
            return Err(LedgerError::CampaignNotFound(campaign_id.to_string()));
        }
        db::payments_for_campaign(&mut conn, campaign_id).await
    }

    pub async fn get_campaign(&self, campaign_id: &str) -> Result<CampaignFund> {
        let mut conn = self.pool.acquire().await?;
        db::fetch_campaign(&mut conn, campaign_id)
            .await?
            .ok_or_else(|| LedgerError::CampaignNotFound(campaign_id.to_string()))
    }

    pub async fn create_campaign(&self, caller: &Caller, id: &str, name: &str) -> Result<CampaignFund> {
        caller.require_admin("create campaigns")?;
        if id.trim().is_empty() || name.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "campaign id and name are required".to_string(),
            ));
        }

        let mut conn = self.pool.acquire().await?;
        if let Err(e) = db::insert_campaign(&mut conn, id, name).await {
            if e.is_unique_violation() {
                return Err(LedgerError::AlreadyExists(format!("campaign {id}")));
            }
            return Err(e);
        }
        info!("Campaign {id} created by {}", caller.user_id);

        db::fetch_campaign(&mut conn, id)
            .await?
            .ok_or_else(|| LedgerError::CampaignNotFound(id.to_string()))
    }

    /// Recompute the campaign's total and reaction counters from the
    /// underlying records and compare, all from one snapshot.
    pub async fn audit_campaign(&self, campaign_id: &str) -> Result<CampaignAudit> {
        let audit = txn::run(&self.pool, &self.retry, "audit_campaign", |conn| {
            Box::pin(audit_attempt(conn, campaign_id.to_string()))
        })
        .await?;

        if !audit.consistent {
            warn!("Campaign {} counters drifted: {audit:?}", audit.campaign_id);
        }
        Ok(audit)
    }

    fn notify_donation(&self, payment: &PaymentTransaction, donor: Option<&Profile>) {
        let Some((phone, name)) =
            donor.and_then(|p| p.phone.clone().map(|phone| (phone, p.display_name.clone())))
        else {
            debug!("No phone on file for {}; skipping donation notification", payment.user_id);
            return;
        };

        self.notifier.dispatch(Notification::Donation {
            phone,
            name,
            amount: payment.amount,
            campaign_name: payment.campaign_name.clone(),
            date: payment.date,
            method: payment.method,
            last_four_digits: payment.last_four_digits.clone(),
            status: payment.status,
        });
    }
}

fn validate_donation(input: &NewDonation) -> Result<()> {
    if input.amount <= 0 {
        return Err(LedgerError::InvalidAmount(input.amount));
    }
    if input.user_id.trim().is_empty() {
        return Err(LedgerError::InvalidInput("user id is required".to_string()));
    }
    if let Some(digits) = &input.attestation.last_four_digits {
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LedgerError::InvalidInput(format!(
                "last four digits must be exactly 4 digits, got {digits:?}"
            )));
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Transaction bodies
// ─────────────────────────────────────────────────────────

async fn create_donation_attempt(
    conn: &mut SqliteConnection,
    id: String,
    input: NewDonation,
) -> Result<CreatedDonation> {
    let campaign = db::fetch_campaign(conn, &input.campaign_id)
        .await?
        .ok_or_else(|| LedgerError::CampaignNotFound(input.campaign_id.clone()))?;
    let donor = db::fetch_profile(conn, &input.user_id).await?;

    // Every precondition is checked before the first write.
    let wallet = match input.method {
        PaymentMethod::WalletDebit => {
            let profile = donor
                .as_ref()
                .ok_or_else(|| LedgerError::UserProfileNotFound(input.user_id.clone()))?;
            if profile.wallet_balance < input.amount {
                return Err(LedgerError::InsufficientFunds {
                    balance: profile.wallet_balance,
                    requested: input.amount,
                });
            }
            Some((profile.version, profile.wallet_balance - input.amount))
        }
        PaymentMethod::BankTransferManual => None,
    };

    let status = match input.method {
        PaymentMethod::WalletDebit => PaymentStatus::Succeeded,
        PaymentMethod::BankTransferManual => PaymentStatus::Pending,
    };
    let raised = if status == PaymentStatus::Succeeded {
        Some(
            campaign
                .raised_amount
                .checked_add(input.amount)
                .ok_or(LedgerError::InvalidAmount(input.amount))?,
        )
    } else {
        None
    };

    let payment = PaymentTransaction {
        id,
        user_email: input
            .user_email
            .clone()
            .or_else(|| donor.as_ref().and_then(|p| p.email.clone())),
        user_id: input.user_id,
        campaign_id: campaign.id.clone(),
        campaign_name: campaign.name.clone(),
        amount: input.amount,
        method: input.method,
        status,
        date: Utc::now().timestamp(),
        last_four_digits: input.attestation.last_four_digits,
        receiver_reference: input.attestation.receiver_reference,
        version: 0,
    };

    db::insert_payment(conn, &payment).await?;
    if let Some(raised) = raised {
        db::write_raised_amount(conn, &campaign.id, campaign.version, raised).await?;
    }
    if let Some((version, balance)) = wallet {
        db::write_wallet_balance(conn, &payment.user_id, version, balance).await?;
    }

    Ok(CreatedDonation { payment, donor })
}

/// Returns the status the transaction had before this attempt.
async fn update_status_attempt(
    conn: &mut SqliteConnection,
    id: String,
    next: PaymentStatus,
) -> Result<PaymentStatus> {
    let payment = db::fetch_payment(conn, &id)
        .await?
        .ok_or_else(|| LedgerError::TransactionNotFound(id.clone()))?;
    let previous = payment.status;

    match previous.transition_to(next) {
        Transition::Unchanged => return Ok(previous),
        Transition::Rejected => {
            return Err(LedgerError::InvalidTransition {
                from: previous,
                to: next,
            })
        }
        Transition::Allowed => {}
    }

    db::write_payment_status(conn, &id, payment.version, next).await?;

    let was_counted = previous == PaymentStatus::Succeeded;
    let now_counted = next == PaymentStatus::Succeeded;
    if was_counted != now_counted {
        match db::fetch_campaign(conn, &payment.campaign_id).await? {
            Some(campaign) => {
                let raised = if now_counted {
                    campaign
                        .raised_amount
                        .checked_add(payment.amount)
                        .ok_or(LedgerError::InvalidAmount(payment.amount))?
                } else {
                    (campaign.raised_amount - payment.amount).max(0)
                };
                db::write_raised_amount(conn, &campaign.id, campaign.version, raised).await?;
            }
            None => warn!(
                "Campaign {} for donation {id} is gone; status updated without adjusting its total",
                payment.campaign_id
            ),
        }
    }

    if was_counted && next == PaymentStatus::Refunded {
        match db::fetch_profile(conn, &payment.user_id).await? {
            Some(profile) => {
                let balance = profile
                    .wallet_balance
                    .checked_add(payment.amount)
                    .ok_or(LedgerError::InvalidAmount(payment.amount))?;
                db::write_wallet_balance(conn, &profile.user_id, profile.version, balance).await?;
            }
            None => warn!(
                "Profile {} for refunded donation {id} is gone; wallet not credited",
                payment.user_id
            ),
        }
    }

    Ok(previous)
}

async fn delete_attempt(
    conn: &mut SqliteConnection,
    id: String,
) -> Result<Option<PaymentTransaction>> {
    let Some(payment) = db::fetch_payment(conn, &id).await? else {
        return Ok(None);
    };

    if payment.status == PaymentStatus::Succeeded {
        match db::fetch_campaign(conn, &payment.campaign_id).await? {
            Some(campaign) => {
                let raised = (campaign.raised_amount - payment.amount).max(0);
                db::write_raised_amount(conn, &campaign.id, campaign.version, raised).await?;
            }
            None => warn!(
                "Campaign {} for donation {id} is gone; deleting without adjusting its total",
                payment.campaign_id
            ),
        }
    }

    db::delete_payment(conn, &id, payment.version).await?;
    Ok(Some(payment))
}

async fn audit_attempt(conn: &mut SqliteConnection, campaign_id: String) -> Result<CampaignAudit> {
    let campaign = db::fetch_campaign(conn, &campaign_id)
        .await?
        .ok_or_else(|| LedgerError::CampaignNotFound(campaign_id.clone()))?;
    let raised_expected = db::sum_succeeded(conn, &campaign_id).await?;
    let likes_expected = db::count_reactions(conn, &campaign_id, ReactionType::Like).await?;
    let supports_expected = db::count_reactions(conn, &campaign_id, ReactionType::Support).await?;

    Ok(CampaignAudit {
        consistent: campaign.raised_amount == raised_expected
            && campaign.like_count == likes_expected
            && campaign.support_count == supports_expected,
        campaign_id,
        raised_recorded: campaign.raised_amount,
        raised_expected,
        likes_recorded: campaign.like_count,
        likes_expected,
        supports_recorded: campaign.support_count,
        supports_expected,
    })
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
