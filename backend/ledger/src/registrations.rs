//! Registration counter engine.
//!
//! A user registers for an event at most once. The registration row and the
//! event's participant count are written in one transaction, so a reader
//! never sees one without the other. The confirmation message goes out only
//! after commit and its fate is never reported back to the caller.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::db;
use crate::errors::{LedgerError, Result};
use crate::identity::Caller;
use crate::models::{Event, EventAudit, EventRegistration, RegistrationDetails};
use crate::notify::{Notification, NotificationDispatcher};
use crate::txn::{self, RetryPolicy};

#[derive(Debug, Clone)]
pub struct Registrations {
    pool: SqlitePool,
    retry: RetryPolicy,
    notifier: NotificationDispatcher,
}

impl Registrations {
    pub fn new(pool: SqlitePool, retry: RetryPolicy, notifier: NotificationDispatcher) -> Self {
        Self {
            pool,
            retry,
            notifier,
        }
    }

    pub async fn register(
        &self,
        event_id: &str,
        user_id: &str,
        details: RegistrationDetails,
    ) -> Result<EventRegistration> {
        validate_details(user_id, &details)?;

        let (event, registration) = txn::run(&self.pool, &self.retry, "register", |conn| {
            Box::pin(register_attempt(
                conn,
                event_id.to_string(),
                user_id.to_string(),
                details.clone(),
            ))
        })
        .await?;

        info!(
            "{user_id} registered for event {event_id}; {} participants",
            event.participant_count
        );

        self.notifier.dispatch(Notification::Registration {
            phone: registration.mobile_number.clone(),
            name: registration.name.clone(),
            ward_no: registration.ward_no.clone(),
            event_title: event.title,
            registered_at: registration.registered_at,
        });

        Ok(registration)
    }

    pub async fn is_registered(&self, event_id: &str, user_id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::fetch_registration(&mut conn, event_id, user_id)
            .await?
            .is_some())
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Event> {
        let mut conn = self.pool.acquire().await?;
        db::fetch_event(&mut conn, event_id)
            .await?
            .ok_or_else(|| LedgerError::EventNotFound(event_id.to_string()))
    }

    /// Compare the stored participant count with the registration rows.
    pub async fn audit_event(&self, event_id: &str) -> Result<EventAudit> {
        let audit = txn::run(&self.pool, &self.retry, "audit_event", |conn| {
            Box::pin(audit_attempt(conn, event_id.to_string()))
        })
        .await?;
        if !audit.consistent {
            warn!("Event {event_id} participant count drifted: {audit:?}");
        }
        Ok(audit)
    }

    pub async fn create_event(&self, caller: &Caller, id: &str, title: &str) -> Result<Event> {
        caller.require_admin("create events")?;
        if id.trim().is_empty() || title.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "event id and title are required".to_string(),
            ));
        }

        let mut conn = self.pool.acquire().await?;
        if let Err(e) = db::insert_event(&mut conn, id, title).await {
            if e.is_unique_violation() {
                return Err(LedgerError::AlreadyExists(format!("event {id}")));
            }
            return Err(e);
        }
        info!("Event {id} created by {}", caller.user_id);

        db::fetch_event(&mut conn, id)
            .await?
            .ok_or_else(|| LedgerError::EventNotFound(id.to_string()))
    }
}

fn validate_details(user_id: &str, details: &RegistrationDetails) -> Result<()> {
    let required = [
        ("user id", user_id),
        ("name", details.name.as_str()),
        ("mobile number", details.mobile_number.as_str()),
        ("ward number", details.ward_no.as_str()),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(LedgerError::InvalidInput(format!("{field} is required")));
        }
    }
    Ok(())
}

/// Returns the event as written (with the new count) and the registration.
async fn register_attempt(
    conn: &mut SqliteConnection,
    event_id: String,
    user_id: String,
    details: RegistrationDetails,
) -> Result<(Event, EventRegistration)> {
    let registered_at = Utc::now().timestamp();

    let mut event = db::fetch_event(conn, &event_id)
        .await?
        .ok_or_else(|| LedgerError::EventNotFound(event_id.clone()))?;
    if db::fetch_registration(conn, &event_id, &user_id)
        .await?
        .is_some()
    {
        return Err(LedgerError::AlreadyRegistered { event_id, user_id });
    }

    let registration = EventRegistration {
        event_id,
        user_id,
        name: details.name,
        mobile_number: details.mobile_number,
        ward_no: details.ward_no,
        user_email: details.user_email,
        registered_at,
    };
    db::insert_registration(conn, &registration).await?;

    event.participant_count += 1;
    db::write_participant_count(conn, &event.id, event.version, event.participant_count).await?;

    Ok((event, registration))
}

async fn audit_attempt(conn: &mut SqliteConnection, event_id: String) -> Result<EventAudit> {
    let event = db::fetch_event(conn, &event_id)
        .await?
        .ok_or_else(|| LedgerError::EventNotFound(event_id.clone()))?;
    let expected = db::count_registrations(conn, &event_id).await?;
    Ok(EventAudit {
        event_id,
        participants_recorded: event.participant_count,
        participants_expected: expected,
        consistent: event.participant_count == expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn details(name: &str) -> RegistrationDetails {
        RegistrationDetails {
            name: name.to_string(),
            mobile_number: "+15550123".to_string(),
            ward_no: "12".to_string(),
            user_email: None,
        }
    }

    #[tokio::test]
    async fn registers_once_and_counts_once() {
        let pool = testutil::pool().await;
        let (registrations, mut rx) = testutil::registrations(&pool);
        testutil::event(&pool, "e1", "Town Hall").await;

        let first = registrations
            .register("e1", "u1", details("Asha"))
            .await
            .unwrap();
        assert_eq!(first.ward_no, "12");

        let err = registrations
            .register("e1", "u1", details("Asha"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyRegistered { .. }));

        assert_eq!(registrations.get_event("e1").await.unwrap().participant_count, 1);
        assert!(registrations.is_registered("e1", "u1").await.unwrap());

        // Exactly one confirmation, for the successful registration.
        assert!(matches!(
            rx.try_recv().unwrap(),
            Notification::Registration { ref event_title, .. } if event_title == "Town Hall"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_event() {
        let pool = testutil::pool().await;
        let (registrations, mut rx) = testutil::registrations(&pool);

        assert!(matches!(
            registrations.register("nope", "u1", details("Asha")).await,
            Err(LedgerError::EventNotFound(_))
        ));
        assert!(!registrations.is_registered("nope", "u1").await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_details_rejected() {
        let pool = testutil::pool().await;
        let (registrations, _rx) = testutil::registrations(&pool);
        testutil::event(&pool, "e1", "Town Hall").await;

        let mut incomplete = details("Asha");
        incomplete.ward_no = " ".to_string();
        assert!(matches!(
            registrations.register("e1", "u1", incomplete).await,
            Err(LedgerError::InvalidInput(_))
        ));
        assert_eq!(registrations.get_event("e1").await.unwrap().participant_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_count_exactly() {
        let (pool, _dir) = testutil::shared_pool().await;
        let (registrations, _rx) = testutil::contended_registrations(&pool);
        testutil::event(&pool, "e1", "Town Hall").await;

        let mut handles = Vec::new();
        for i in 0..6 {
            let registrations = registrations.clone();
            handles.push(tokio::spawn(async move {
                // Two attempts per user; only one may land.
                let user = format!("u{}", i % 3);
                registrations.register("e1", &user, details("Someone")).await
            }));
        }

        let mut ok = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(LedgerError::AlreadyRegistered { .. }) => duplicates += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!((ok, duplicates), (3, 3));

        let event = registrations.get_event("e1").await.unwrap();
        assert_eq!(event.participant_count, 3);
        assert!(registrations.audit_event("e1").await.unwrap().consistent);
    }

    #[tokio::test]
    async fn closed_notification_queue_is_ignored() {
        let pool = testutil::pool().await;
        let (registrations, rx) = testutil::registrations(&pool);
        drop(rx);
        testutil::event(&pool, "e1", "Town Hall").await;

        registrations
            .register("e1", "u1", details("Asha"))
            .await
            .unwrap();
        assert_eq!(registrations.get_event("e1").await.unwrap().participant_count, 1);
    }

    #[tokio::test]
    async fn create_event_is_admin_only() {
        let pool = testutil::pool().await;
        let (registrations, _rx) = testutil::registrations(&pool);
        let admin = testutil::admin(&pool, "root").await;
        testutil::member(&pool, "u1", 0).await;
        let member = Caller::resolve(&pool, "u1").await.unwrap();

        assert!(matches!(
            registrations.create_event(&member, "e2", "Cleanup").await,
            Err(LedgerError::PermissionDenied(_))
        ));
        let event = registrations.create_event(&admin, "e2", "Cleanup").await.unwrap();
        assert_eq!(event.participant_count, 0);
        assert!(matches!(
            registrations.create_event(&admin, "e2", "Cleanup").await,
            Err(LedgerError::AlreadyExists(_))
        ));
    }
}
