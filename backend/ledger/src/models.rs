//! Record shapes persisted by the ledger engines.
//!
//! Every counter-owning record carries a `version` column. It is bumped on
//! each write and compared on the next one, which is how a stale read is
//! detected at commit time (see [`crate::txn`]).

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a donation was paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Donor transferred money out-of-band; an admin attests it later.
    BankTransferManual,
    /// Debited from the donor's wallet inside the donation transaction.
    WalletDebit,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BankTransferManual => "bank_transfer_manual",
            Self::WalletDebit => "wallet_debit",
        }
    }
}

/// Current status of a payment transaction.
///
/// ```text
/// Pending ──► Succeeded ──► Refunded
///    ├──────────────────────►┘
///    └──► Failed
/// ```
///
/// `Failed` and `Refunded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

/// Result of looking up a status change in the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same status; nothing to write.
    Unchanged,
    Allowed,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Refunded)
    }

    pub fn transition_to(self, next: PaymentStatus) -> Transition {
        use PaymentStatus::*;
        if self == next {
            return Transition::Unchanged;
        }
        if self.is_terminal() {
            return Transition::Rejected;
        }
        match (self, next) {
            (Pending, Succeeded) | (Pending, Failed) | (Pending, Refunded) => Transition::Allowed,
            (Succeeded, Refunded) => Transition::Allowed,
            _ => Transition::Rejected,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One donation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentTransaction {
    pub id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub campaign_id: String,
    pub campaign_name: String,
    pub amount: i64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    /// Unix seconds
    pub date: i64,
    pub last_four_digits: Option<String>,
    pub receiver_reference: Option<String>,
    #[serde(skip)]
    pub version: i64,
}

/// Fields the donor supplies to attest a manual transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub last_four_digits: Option<String>,
    pub receiver_reference: Option<String>,
}

/// Input to [`crate::ledger::Ledger::create_donation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDonation {
    pub user_id: String,
    #[serde(default)]
    pub user_email: Option<String>,
    pub campaign_id: String,
    pub amount: i64,
    pub method: PaymentMethod,
    #[serde(flatten)]
    pub attestation: Attestation,
}

/// The slice of a campaign this service owns: money raised and reaction counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CampaignFund {
    pub id: String,
    pub name: String,
    pub raised_amount: i64,
    pub like_count: i64,
    pub support_count: i64,
    #[serde(skip)]
    pub version: i64,
}

/// Output of a campaign consistency check: each stored counter next to the
/// value recomputed from the records it summarises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignAudit {
    pub campaign_id: String,
    pub raised_recorded: i64,
    /// Sum of succeeded transactions for the campaign.
    pub raised_expected: i64,
    pub likes_recorded: i64,
    pub likes_expected: i64,
    pub supports_recorded: i64,
    pub supports_expected: i64,
    pub consistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventAudit {
    pub event_id: String,
    pub participants_recorded: i64,
    pub participants_expected: i64,
    pub consistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionType {
    Like,
    Support,
}

impl ReactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Support => "support",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "like" => Some(Self::Like),
            "support" => Some(Self::Support),
            _ => None,
        }
    }

    /// Counter on `campaigns` that mirrors the membership rows of this type.
    pub(crate) fn counter_column(&self) -> &'static str {
        match self {
            Self::Like => "like_count",
            Self::Support => "support_count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReactionOutcome {
    pub new_count: i64,
    pub user_has_reacted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub participant_count: i64,
    #[serde(skip)]
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationDetails {
    pub name: String,
    pub mobile_number: String,
    pub ward_no: String,
    #[serde(default)]
    pub user_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRegistration {
    pub event_id: String,
    pub user_id: String,
    pub name: String,
    pub mobile_number: String,
    pub ward_no: String,
    pub user_email: Option<String>,
    /// Unix seconds, taken when the registering transaction attempt started.
    pub registered_at: i64,
}
