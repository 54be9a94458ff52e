use anyhow::Result;
use rollcall_core::CourseCatalog;
use rollcall_store::Database;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod provider;

use config::{Bus, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::MatchEngine;
use provider::PrecomputedProvider;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    config.validate()?;

    let catalog = match &config.courses_path {
        Some(path) => CourseCatalog::load(path)?,
        None => CourseCatalog::builtin()?,
    };
    let db = Database::open(&config.db_path)?;
    let provider = Arc::new(PrecomputedProvider::new(
        config.embedding_dim,
        config.model_version.clone(),
    ));
    let engine = Arc::new(MatchEngine::new(
        catalog,
        provider,
        &db,
        config.engine_settings()?,
    )?);

    // Indices are never persisted; the identity store is the source of truth.
    let students = engine.rebuild_all().await?;
    tracing::info!(
        students,
        threshold = config.similarity_threshold,
        model_version = %config.model_version,
        "course indices ready"
    );

    let builder = match config.bus()? {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine))?
        .build()
        .await?;

    tracing::info!(bus = %config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
