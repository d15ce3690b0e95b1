//! Campaign ledger service — entry point.
//!
//! Hosts the three transactional engines (donation ledger, reaction toggles,
//! event registrations) behind a small Axum REST API, with a background
//! worker that delivers confirmation messages after commits.

mod api;
mod config;
mod db;
mod errors;
mod identity;
mod ledger;
mod models;
mod notify;
mod reactions;
mod registrations;
mod txn;

#[cfg(test)]
mod testutil;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use notify::{NotificationDispatcher, Sink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(
        "Optimistic transactions: {} attempts, {}..{}ms back-off",
        config.retry.max_attempts, config.retry.base_backoff_ms, config.retry.max_backoff_ms
    );

    let pool = db::init_pool(&config.database_url).await?;

    if let Some(admin) = &config.bootstrap_admin {
        identity::ensure_admin(&pool, admin).await?;
    }

    // ─── Notification worker ──────────────────────────────
    let sink = match &config.notify_webhook_url {
        Some(url) => Sink::Webhook {
            client: Client::builder()
                .timeout(Duration::from_secs(config.notify_timeout_secs))
                .build()?,
            url: url.clone(),
        },
        None => Sink::Log,
    };
    let (notifier, queue) = NotificationDispatcher::channel();
    tokio::spawn(notify::run(queue, sink));

    // ─── REST API ─────────────────────────────────────────
    let state = Arc::new(api::ApiState {
        pool: pool.clone(),
        ledger: ledger::Ledger::new(pool.clone(), config.retry, notifier.clone()),
        reactions: reactions::Reactions::new(pool.clone(), config.retry),
        registrations: registrations::Registrations::new(pool, config.retry, notifier),
    });

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
