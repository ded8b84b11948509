//! Lighter OI prediction game server.
//!
//! Restores the round database snapshot, warms the OI cache, starts the round
//! scheduler and serves the `/api` surface until Ctrl-C.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::middleware;
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lighter_oi_backend::{
    api::{self, AppState},
    config::AppConfig,
    middleware::{request_logging, SubmissionCooldown},
    oi::{HttpTransport, MetricSource, OiCache, OiSourceClient},
    rounds::{spawn_scheduler, PredictionDesk, RoundEngine},
    store::{RoundStore, SnapshotWriter, SqliteRoundStore},
};

#[derive(Parser, Debug)]
#[command(name = "lighter-oi")]
#[command(about = "Lighter OI prediction game - rounds, scoring and HTTP API")]
struct Args {
    /// HTTP listen port
    #[arg(long, env = "PORT", default_value = "3001")]
    port: u16,

    /// Snapshot file for the round database (relative paths resolve against the crate dir)
    #[arg(long, env = "DB_PATH")]
    db_path: Option<String>,

    /// Run a single lifecycle tick, flush and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();
    let args = Args::parse();
    let cfg = AppConfig::from_env();

    println!("🎲 Lighter OI prediction game");

    let db_path = resolve_data_path(args.db_path.clone(), "lighter_oi.db");
    let store = Arc::new(
        SqliteRoundStore::restore_from(Path::new(&db_path))
            .with_context(|| format!("Failed to open round database {}", db_path))?,
    );
    let writer = SnapshotWriter::spawn(&store, &db_path, cfg.flush_policy);

    let cache = Arc::new(OiCache::new());
    let client = Arc::new(OiSourceClient::new(
        Arc::new(HttpTransport::new(cfg.oi_fetch_timeout)),
        cfg.oi_hosts.clone(),
        cfg.oi_target_protocol.clone(),
        cfg.oi_fetch_timeout,
        cache.clone(),
    ));
    info!(
        hosts = ?client.hosts(),
        protocol = %cfg.oi_target_protocol,
        close_hour_utc = cfg.close_hour_utc,
        "OI source configured"
    );

    let engine = Arc::new(RoundEngine::new(
        store.clone(),
        client.clone(),
        cache.clone(),
        cfg.close_hour_utc,
        cfg.resolve_policy,
    ));

    if args.once {
        let report = engine.tick(Utc::now()).await;
        info!(
            created = report.created.is_some(),
            scored = report.resolution.scored.len(),
            deferred = report.resolution.deferred.len(),
            "single tick complete"
        );
        let flushed = writer.shutdown().await.context("Final snapshot flush failed")?;
        info!(flushed, "exiting");
        return Ok(());
    }

    client.warmup(cfg.live_policy).await;

    let scheduler = spawn_scheduler(engine.clone(), cfg.tick_interval);

    let store_dyn: Arc<dyn RoundStore> = store.clone();
    let desk = Arc::new(PredictionDesk::new(
        store_dyn.clone(),
        SubmissionCooldown::new(cfg.submit_cooldown),
    ));
    spawn_cooldown_cleanup(desk.cooldown().clone());

    let source: Arc<dyn MetricSource> = client.clone();
    let state = Arc::new(AppState {
        engine,
        store: store_dyn,
        source,
        cache,
        desk,
        live_policy: cfg.live_policy,
        prefetch_policy: cfg.prefetch_policy,
        admin_token: cfg.admin_token.clone(),
    });
    if cfg.admin_token.is_none() {
        warn!("ADMIN_TOKEN not set, admin routes are open");
    }

    let app = api::router(state)
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    scheduler.stop().await;
    let flushed = writer.shutdown().await.context("Final snapshot flush failed")?;
    info!(flushed, "shutdown complete");

    Ok(())
}

fn spawn_cooldown_cleanup(cooldown: SubmissionCooldown) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(300));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            cooldown.cleanup();
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("🛑 Shutdown requested");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lighter_oi_backend=debug,lighter_oi=debug,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_data_path(filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

fn resolve_data_path(value: Option<String>, default_filename: &str) -> String {
    let Some(raw) = value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw.trim());
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join(p)
        .to_string_lossy()
        .to_string()
}

fn load_env() {
    // cwd and parents
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
