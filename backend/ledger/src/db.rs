//! Database layer — pool set-up, migrations, and version-checked record access.
//!
//! Writes to counter-owning rows take the `version` the caller read in the
//! same transaction attempt and fail with [`LedgerError::StaleRead`] when the
//! row moved underneath it.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::errors::{LedgerError, Result};
use crate::identity::Profile;
use crate::models::{
    CampaignFund, Event, EventRegistration, PaymentStatus, PaymentTransaction, ReactionType,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied successfully");
    Ok(())
}

fn ensure_written(rows_affected: u64, record: impl FnOnce() -> String) -> Result<()> {
    if rows_affected == 0 {
        return Err(LedgerError::StaleRead(record()));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

pub async fn insert_campaign(conn: &mut SqliteConnection, id: &str, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO campaigns (id, name) VALUES (?1, ?2)")
        .bind(id)
        .bind(name)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn fetch_campaign(conn: &mut SqliteConnection, id: &str) -> Result<Option<CampaignFund>> {
    let row = sqlx::query_as::<_, CampaignFund>(
        r#"
        SELECT id, name, raised_amount, like_count, support_count, version
        FROM   campaigns
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Overwrite `raised_amount` if the campaign is still at `expected_version`.
pub async fn write_raised_amount(
    conn: &mut SqliteConnection,
    id: &str,
    expected_version: i64,
    raised_amount: i64,
) -> Result<()> {
    let rows = sqlx::query(
        r#"
        UPDATE campaigns
        SET    raised_amount = ?1, version = version + 1
        WHERE  id = ?2 AND version = ?3
        "#,
    )
    .bind(raised_amount)
    .bind(id)
    .bind(expected_version)
    .execute(conn)
    .await?
    .rows_affected();
    ensure_written(rows, || format!("campaigns/{id}"))
}

/// Overwrite the counter for `kind` if the campaign is still at `expected_version`.
pub async fn write_reaction_count(
    conn: &mut SqliteConnection,
    id: &str,
    kind: ReactionType,
    expected_version: i64,
    count: i64,
) -> Result<()> {
    // Column name comes from a closed enum, never from input.
    let sql = format!(
        "UPDATE campaigns SET {col} = ?1, version = version + 1 WHERE id = ?2 AND version = ?3",
        col = kind.counter_column()
    );
    let rows = sqlx::query(&sql)
        .bind(count)
        .bind(id)
        .bind(expected_version)
        .execute(conn)
        .await?
        .rows_affected();
    ensure_written(rows, || format!("campaigns/{id}"))
}

/// Sum of succeeded transaction amounts for a campaign.
pub async fn sum_succeeded(conn: &mut SqliteConnection, campaign_id: &str) -> Result<i64> {
    let (total,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount), 0)
        FROM   payment_transactions
        WHERE  campaign_id = ?1 AND status = ?2
        "#,
    )
    .bind(campaign_id)
    .bind(PaymentStatus::Succeeded)
    .fetch_one(conn)
    .await?;
    Ok(total)
}

// ─────────────────────────────────────────────────────────
// Profiles
// ─────────────────────────────────────────────────────────

pub async fn fetch_profile(conn: &mut SqliteConnection, user_id: &str) -> Result<Option<Profile>> {
    let row = sqlx::query_as::<_, Profile>(
        r#"
        SELECT user_id, display_name, phone, email, role, wallet_balance, version
        FROM   profiles
        WHERE  user_id = ?1
        "#,
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

pub async fn upsert_profile(conn: &mut SqliteConnection, profile: &Profile) -> Result<()> {
    // The wallet balance is only taken on first insert; afterwards the
    // ledger engine is its sole writer.
    sqlx::query(
        r#"
        INSERT INTO profiles (user_id, display_name, phone, email, role, wallet_balance)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT (user_id) DO UPDATE SET
            display_name = excluded.display_name,
            phone        = excluded.phone,
            email        = excluded.email,
            role         = excluded.role,
            version      = profiles.version + 1
        "#,
    )
    .bind(&profile.user_id)
    .bind(&profile.display_name)
    .bind(&profile.phone)
    .bind(&profile.email)
    .bind(profile.role)
    .bind(profile.wallet_balance)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn write_wallet_balance(
    conn: &mut SqliteConnection,
    user_id: &str,
    expected_version: i64,
    balance: i64,
) -> Result<()> {
    let rows = sqlx::query(
        r#"
        UPDATE profiles
        SET    wallet_balance = ?1, version = version + 1
        WHERE  user_id = ?2 AND version = ?3
        "#,
    )
    .bind(balance)
    .bind(user_id)
    .bind(expected_version)
    .execute(conn)
    .await?
    .rows_affected();
    ensure_written(rows, || format!("profiles/{user_id}"))
}

// ─────────────────────────────────────────────────────────
// Payment transactions
// ─────────────────────────────────────────────────────────

const PAYMENT_COLUMNS: &str = "id, user_id, user_email, campaign_id, campaign_name, amount, \
     method, status, date, last_four_digits, receiver_reference, version";

pub async fn insert_payment(conn: &mut SqliteConnection, tx: &PaymentTransaction) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO payment_transactions
            (id, user_id, user_email, campaign_id, campaign_name, amount, method, status,
             date, last_four_digits, receiver_reference)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&tx.id)
    .bind(&tx.user_id)
    .bind(&tx.user_email)
    .bind(&tx.campaign_id)
    .bind(&tx.campaign_name)
    .bind(tx.amount)
    .bind(tx.method)
    .bind(tx.status)
    .bind(tx.date)
    .bind(&tx.last_four_digits)
    .bind(&tx.receiver_reference)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn fetch_payment(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<PaymentTransaction>> {
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE id = ?1");
    let row = sqlx::query_as::<_, PaymentTransaction>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn payments_for_campaign(
    conn: &mut SqliteConnection,
    campaign_id: &str,
) -> Result<Vec<PaymentTransaction>> {
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM payment_transactions \
         WHERE campaign_id = ?1 ORDER BY date ASC, id ASC"
    );
    let rows = sqlx::query_as::<_, PaymentTransaction>(&sql)
        .bind(campaign_id)
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

pub async fn write_payment_status(
    conn: &mut SqliteConnection,
    id: &str,
    expected_version: i64,
    status: PaymentStatus,
) -> Result<()> {
    let rows = sqlx::query(
        r#"
        UPDATE payment_transactions
        SET    status = ?1, version = version + 1
        WHERE  id = ?2 AND version = ?3
        "#,
    )
    .bind(status)
    .bind(id)
    .bind(expected_version)
    .execute(conn)
    .await?
    .rows_affected();
    ensure_written(rows, || format!("payment_transactions/{id}"))
}

pub async fn delete_payment(
    conn: &mut SqliteConnection,
    id: &str,
    expected_version: i64,
) -> Result<()> {
    let rows = sqlx::query("DELETE FROM payment_transactions WHERE id = ?1 AND version = ?2")
        .bind(id)
        .bind(expected_version)
        .execute(conn)
        .await?
        .rows_affected();
    ensure_written(rows, || format!("payment_transactions/{id}"))
}

// ─────────────────────────────────────────────────────────
// Reaction memberships
// ─────────────────────────────────────────────────────────

pub async fn reaction_exists(
    conn: &mut SqliteConnection,
    campaign_id: &str,
    user_id: &str,
    kind: ReactionType,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT 1 FROM campaign_reactions
        WHERE  campaign_id = ?1 AND user_id = ?2 AND reaction_type = ?3
        "#,
    )
    .bind(campaign_id)
    .bind(user_id)
    .bind(kind.as_str())
    .fetch_optional(conn)
    .await?;
    Ok(row.is_some())
}

/// A duplicate key here means another attempt created the membership first;
/// the runner treats the unique violation as a conflict.
pub async fn insert_reaction(
    conn: &mut SqliteConnection,
    campaign_id: &str,
    user_id: &str,
    kind: ReactionType,
    created_at: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO campaign_reactions (campaign_id, user_id, reaction_type, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(campaign_id)
    .bind(user_id)
    .bind(kind.as_str())
    .bind(created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_reaction(
    conn: &mut SqliteConnection,
    campaign_id: &str,
    user_id: &str,
    kind: ReactionType,
) -> Result<()> {
    let rows = sqlx::query(
        r#"
        DELETE FROM campaign_reactions
        WHERE  campaign_id = ?1 AND user_id = ?2 AND reaction_type = ?3
        "#,
    )
    .bind(campaign_id)
    .bind(user_id)
    .bind(kind.as_str())
    .execute(conn)
    .await?
    .rows_affected();
    ensure_written(rows, || {
        format!("campaign_reactions/{campaign_id}/{user_id}/{}", kind.as_str())
    })
}

pub async fn count_reactions(
    conn: &mut SqliteConnection,
    campaign_id: &str,
    kind: ReactionType,
) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM campaign_reactions WHERE campaign_id = ?1 AND reaction_type = ?2",
    )
    .bind(campaign_id)
    .bind(kind.as_str())
    .fetch_one(conn)
    .await?;
    Ok(count)
}

// ─────────────────────────────────────────────────────────
// Events and registrations
// ─────────────────────────────────────────────────────────

pub async fn insert_event(conn: &mut SqliteConnection, id: &str, title: &str) -> Result<()> {
    sqlx::query("INSERT INTO events (id, title) VALUES (?1, ?2)")
        .bind(id)
        .bind(title)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn fetch_event(conn: &mut SqliteConnection, id: &str) -> Result<Option<Event>> {
    let row = sqlx::query_as::<_, Event>(
        "SELECT id, title, participant_count, version FROM events WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

pub async fn write_participant_count(
    conn: &mut SqliteConnection,
    id: &str,
    expected_version: i64,
    count: i64,
) -> Result<()> {
    let rows = sqlx::query(
        r#"
        UPDATE events
        SET    participant_count = ?1, version = version + 1
        WHERE  id = ?2 AND version = ?3
        "#,
    )
    .bind(count)
    .bind(id)
    .bind(expected_version)
    .execute(conn)
    .await?
    .rows_affected();
    ensure_written(rows, || format!("events/{id}"))
}

pub async fn fetch_registration(
    conn: &mut SqliteConnection,
    event_id: &str,
    user_id: &str,
) -> Result<Option<EventRegistration>> {
    let row = sqlx::query_as::<_, EventRegistration>(
        r#"
        SELECT event_id, user_id, name, mobile_number, ward_no, user_email, registered_at
        FROM   event_registrations
        WHERE  event_id = ?1 AND user_id = ?2
        "#,
    )
    .bind(event_id)
    .bind(user_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

pub async fn insert_registration(
    conn: &mut SqliteConnection,
    registration: &EventRegistration,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO event_registrations
            (event_id, user_id, name, mobile_number, ward_no, user_email, registered_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&registration.event_id)
    .bind(&registration.user_id)
    .bind(&registration.name)
    .bind(&registration.mobile_number)
    .bind(&registration.ward_no)
    .bind(&registration.user_email)
    .bind(registration.registered_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn count_registrations(conn: &mut SqliteConnection, event_id: &str) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM event_registrations WHERE event_id = ?1")
            .bind(event_id)
            .fetch_one(conn)
            .await?;
    Ok(count)
}
