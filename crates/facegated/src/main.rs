use anyhow::{Context, Result};
use facegate_store::UserStore;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{FacegateService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::load()?;

    let store = UserStore::open(&config.db_path)
        .with_context(|| format!("opening user store {}", config.db_path.display()))?;
    let snapshot = store.list_enrolled_users()?;
    tracing::info!(
        path = %config.db_path.display(),
        users = snapshot.len(),
        "user store opened"
    );

    let engine = engine::spawn_engine(&config)?;

    let bus = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let service = FacegateService::new(engine, store, snapshot, config);
    let _conn = bus
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus_name = BUS_NAME, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
