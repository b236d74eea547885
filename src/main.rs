//! FleetPulse — real-time fleet telemetry backend.
//!
//! Boot order matters: store → cache → bus → consumers → listener. All
//! process-lifetime services live in `AppState` and are handed to the
//! handlers; nothing ambient.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tokio::time::interval;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetpulse_backend::{
    api,
    auth::JwtHandler,
    broker::{Broker, ROOM_SWEEP_INTERVAL},
    bus::EventBus,
    cache,
    middleware::{logging::request_logging, IpRateLimiter, RateLimitConfig},
    models::{now_millis, Config},
    state::AppState,
    store::{HistoryStore, HISTORY_RETENTION_MS},
    workers,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!(port = config.port, "fleetpulse backend starting");

    let store = Arc::new(HistoryStore::new(&config.db_path)?);
    let cache = cache::connect(&config).await;

    let bus = Arc::new(EventBus::new(config.event_bus_enabled));
    if !config.event_bus_enabled {
        warn!("event bus disabled, ingress will use the direct-write path");
    }

    let broker = Arc::new(Broker::new());
    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let sos_limiter = IpRateLimiter::new(RateLimitConfig::sos());

    let state = AppState::new(
        config.clone(),
        store.clone(),
        cache,
        bus,
        broker.clone(),
        jwt,
        sos_limiter.clone(),
    );

    workers::spawn_all(&state);

    tokio::spawn(retention_sweeper(store));

    {
        let broker = broker.clone();
        tokio::spawn(async move {
            let mut ticker = interval(ROOM_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let reclaimed = broker.sweep_empty_rooms();
                if reclaimed > 0 {
                    info!(reclaimed, "empty rooms reclaimed");
                }
            }
        });
    }

    {
        let limiter = sos_limiter.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                limiter.cleanup();
            }
        });
    }

    let cors = match &config.client_url {
        Some(url) => match url.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(e) => {
                warn!(url = %url, error = %e, "invalid CLIENT_URL, allowing any origin");
                CorsLayer::permissive()
            }
        },
        None => CorsLayer::permissive(),
    };

    let app = api::router(state)
        .layer(cors)
        .layer(axum::middleware::from_fn(request_logging));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "api server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}

/// Reclaim aged rows: positions past the 30-day window, hazard reports
/// past their expiry, SOS events past the retention window.
async fn retention_sweeper(store: Arc<HistoryStore>) {
    let sweep_secs = std::env::var("RETENTION_SWEEP_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(3600);

    let mut ticker = interval(Duration::from_secs(sweep_secs));
    loop {
        ticker.tick().await;
        let now = now_millis();
        let cutoff = now - HISTORY_RETENTION_MS;

        let mut reclaimed = 0usize;
        match store.prune_positions_before(cutoff) {
            Ok(n) => reclaimed += n,
            Err(e) => warn!(error = %e, "position pruning failed"),
        }
        match store.prune_expired_reports(now) {
            Ok(n) => reclaimed += n,
            Err(e) => warn!(error = %e, "report pruning failed"),
        }
        match store.prune_sos_before(cutoff) {
            Ok(n) => reclaimed += n,
            Err(e) => warn!(error = %e, "sos pruning failed"),
        }

        if reclaimed > 0 {
            info!(reclaimed, "retention sweep done");
            let _ = store.optimize();
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetpulse_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
