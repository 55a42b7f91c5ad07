//! Sendloop daemon - campaign scheduler, dispatcher, and tracking server.
//!
//! Runs two long-lived tasks over one shared store:
//! - the scheduler loop, which materializes due sends and dispatches them
//!   through the mail provider
//! - the tracking web server, which serves the open pixel and click
//!   redirects and records engagement

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sendloop::contacts::StaticDirectory;
use sendloop::model::{Contact, EmailCampaign, EmailTemplate};
use sendloop::transport::HttpApiTransport;
use sendloop::web::{router, AppState};
use sendloop::{
    CampaignStore, Config, DispatchExecutor, EventRecorder, MemoryStore, Scheduler, SystemClock,
};

/// Initial data loaded into the in-memory store at startup.
#[derive(Debug, Default, Deserialize)]
struct SeedData {
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    templates: Vec<EmailTemplate>,
    #[serde(default)]
    campaigns: Vec<EmailCampaign>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("sendloop_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        port = config.port,
        poll_interval_secs = config.poll_interval_secs,
        batch_limit = config.batch_limit,
        dispatch_concurrency = config.dispatch_concurrency,
        provider_api_url = %config.provider_api_url,
        provider_api_key_set = config.provider_api_key.is_some(),
        base_tracking_url = %config.base_tracking_url,
        seed_file = ?config.seed_file,
        "config_loaded"
    );

    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new());

    let seed = load_seed(config.seed_file.as_deref())?;
    let directory = Arc::new(StaticDirectory::new(seed.contacts.clone()));
    apply_seed(store.as_ref(), seed).await?;

    let transport = Arc::new(
        HttpApiTransport::new(
            config.provider_api_url.clone(),
            config.provider_api_key.clone(),
            Duration::from_millis(config.transport_timeout_ms),
        )
        .context("Failed to build mail transport")?,
    );

    let executor = DispatchExecutor::new(
        store.clone(),
        directory.clone(),
        transport,
        clock.clone(),
        config.base_tracking_url.clone(),
        config.site_base_url.clone(),
        config.dispatch_concurrency,
    );

    let scheduler = Scheduler::new(
        store.clone(),
        directory,
        executor,
        clock.clone(),
        Duration::from_secs(config.poll_interval_secs),
        config.batch_limit,
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_signal()));

    // Tracking web server
    let recorder = Arc::new(EventRecorder::new(store.clone(), clock));
    let app = router(AppState::new(recorder, config.fallback_redirect_url.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "tracking_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    scheduler_handle
        .await
        .context("Scheduler task panicked")?;

    info!("sendloop_shutdown_complete");

    Ok(())
}

/// Read the optional JSON seed file.
fn load_seed(path: Option<&str>) -> Result<SeedData> {
    let Some(path) = path else {
        return Ok(SeedData::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {path}"))?;
    let seed: SeedData =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse seed file {path}"))?;
    Ok(seed)
}

/// Insert seed rows, validating campaigns before they enter the store.
async fn apply_seed(store: &MemoryStore, seed: SeedData) -> Result<()> {
    let counts = (seed.contacts.len(), seed.templates.len(), seed.campaigns.len());

    for template in seed.templates {
        store.insert_template(template).await?;
    }
    for campaign in seed.campaigns {
        campaign
            .validate()
            .with_context(|| format!("Invalid seed campaign {}", campaign.id))?;
        store.insert_campaign(campaign).await?;
    }

    info!(
        contacts = counts.0,
        templates = counts.1,
        campaigns = counts.2,
        "seed_loaded"
    );
    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("sendloop_shutting_down");
}
