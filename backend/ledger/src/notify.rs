//! Outbound confirmation messages.
//!
//! Engines hand a [`Notification`] to the [`NotificationDispatcher`] only
//! after their transaction has committed. The handoff is a channel send, so
//! the engine never waits on delivery and a delivery failure can never touch
//! committed state. A single background worker drains the queue.
//!
//! ## Delivery
//!
//! * With a webhook configured every message is POSTed as JSON.
//! * Without one the rendered text is logged, which is what local runs use.
//! * Failures are logged and dropped. There is no retry.

use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::models::{PaymentMethod, PaymentStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Donation {
        phone: String,
        name: String,
        amount: i64,
        campaign_name: String,
        date: i64,
        method: PaymentMethod,
        last_four_digits: Option<String>,
        status: PaymentStatus,
    },
    Registration {
        phone: String,
        name: String,
        ward_no: String,
        event_title: String,
        registered_at: i64,
    },
}

impl Notification {
    pub fn phone(&self) -> &str {
        match self {
            Self::Donation { phone, .. } | Self::Registration { phone, .. } => phone,
        }
    }

    /// Human-readable message body.
    pub fn render(&self) -> String {
        match self {
            Self::Donation {
                name,
                amount,
                campaign_name,
                date,
                method,
                last_four_digits,
                status,
                ..
            } => {
                let via = match (method, last_four_digits) {
                    (PaymentMethod::WalletDebit, _) => "wallet".to_string(),
                    (PaymentMethod::BankTransferManual, Some(digits)) => {
                        format!("bank transfer (account ending {digits})")
                    }
                    (PaymentMethod::BankTransferManual, None) => "bank transfer".to_string(),
                };
                format!(
                    "Dear {name}, your donation of {amount} to {campaign_name} via {via} on {} is {status}.",
                    format_date(*date)
                )
            }
            Self::Registration {
                name,
                ward_no,
                event_title,
                registered_at,
                ..
            } => format!(
                "Dear {name} (ward {ward_no}), you are registered for {event_title} as of {}.",
                format_date(*registered_at)
            ),
        }
    }
}

fn format_date(unix: i64) -> String {
    Utc.timestamp_opt(unix, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| unix.to_string())
}

/// Cloneable, non-blocking handle onto the notification queue.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message. Never blocks and never fails the caller.
    pub fn dispatch(&self, notification: Notification) {
        debug!("Queueing notification for {}", notification.phone());
        if let Err(e) = self.tx.send(notification) {
            warn!("Notification queue closed, dropping message for {}", e.0.phone());
        }
    }
}

/// Where the worker sends messages.
#[derive(Debug, Clone)]
pub enum Sink {
    Webhook { client: Client, url: String },
    Log,
}

/// Drain the queue until every dispatcher handle is dropped.
pub async fn run(mut rx: mpsc::UnboundedReceiver<Notification>, sink: Sink) {
    match &sink {
        Sink::Webhook { url, .. } => info!("Notification worker delivering to {url}"),
        Sink::Log => info!("Notification worker logging messages (no webhook configured)"),
    }

    while let Some(notification) = rx.recv().await {
        if let Err(e) = deliver(&sink, &notification).await {
            error!(
                "Notification delivery to {} failed: {e}",
                notification.phone()
            );
        }
    }

    info!("Notification queue closed; worker exiting");
}

async fn deliver(sink: &Sink, notification: &Notification) -> Result<()> {
    match sink {
        Sink::Webhook { client, url } => {
            client
                .post(url)
                .json(&json!({
                    "to": notification.phone(),
                    "message": notification.render(),
                    "notification": notification,
                }))
                .send()
                .await?
                .error_for_status()?;
            debug!("Delivered notification to {}", notification.phone());
        }
        Sink::Log => {
            info!(to = notification.phone(), "{}", notification.render());
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
