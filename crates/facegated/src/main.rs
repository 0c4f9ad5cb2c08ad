use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod authenticator;
mod config;
mod dbus_interface;
mod engine;
mod models;
mod store;

use authenticator::{AuthSettings, Authenticator};
use config::Config;
use dbus_interface::{GateService, BUS_NAME, OBJECT_PATH};
use facegate_core::ScrfdDetector;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        variant = %config.model_variant,
        db = %config.db_path.display(),
        location = %config.device_location,
        audit_unknown = config.audit_unknown_person,
        "facegated starting"
    );

    // Load the detector and open the database up front (fail-fast).
    let detector = ScrfdDetector::load(&config.model_dir, config.model_variant)
        .context("loading face detector")?;
    let engine = engine::spawn_engine(detector)?;
    let store = Store::open(&config.db_path)
        .await
        .context("opening database")?;

    let rng = match config.simulate_seed {
        Some(seed) => {
            tracing::info!(seed, "simulation randomness seeded");
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_entropy(),
    };

    let auth = Arc::new(Authenticator::new(
        engine,
        store.clone(),
        AuthSettings::from(&config),
        rng,
    ));
    let service = GateService::new(auth, store, config.model_variant.to_string());

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
