use anyhow::{Context, Result};
use attend_core::{GalleryCache, StationWindows};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod dbus_interface;
mod engine;
mod store;

use attendance::AttendanceManager;
use dbus_interface::{AttendService, ServiceSettings, BUS_NAME, OBJECT_PATH};
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendd starting");

    let config = config::Config::load().context("loading configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        similarity = config.similarity_threshold,
        distance = config.distance_threshold,
        scope = ?config.window_scope,
        "configuration loaded"
    );

    let store = Arc::new(Store::open(&config.db_path).context("opening store")?);
    let gallery = Arc::new(GalleryCache::new());

    // An unbuilt gallery is served as "unavailable" until a reload succeeds.
    let initial = {
        let (store, gallery) = (Arc::clone(&store), Arc::clone(&gallery));
        tokio::task::spawn_blocking(move || gallery.rebuild(store.as_ref())).await?
    };
    if let Err(e) = initial {
        tracing::warn!(error = %e, "initial gallery build failed");
    }

    let windows = Arc::new(StationWindows::new(config.window_scope, config.debounce()));
    if config.window_scope == attend_core::WindowScope::Shared {
        tracing::info!("all stations share one recognition window");
    }

    let engine = engine::spawn_engine(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        config.thresholds(),
        Arc::clone(&gallery),
        Arc::clone(&windows),
    )
    .context("starting recognition engine")?;

    let attendance = Arc::new(AttendanceManager::new(
        Arc::clone(&store),
        windows,
        config.confirm_timeout_secs,
    ));

    let service = AttendService::new(
        engine,
        store,
        gallery,
        attendance,
        ServiceSettings {
            thresholds: config.thresholds(),
            window_scope: config.window_scope,
            confirm_timeout_secs: config.confirm_timeout_secs,
            max_enroll_images: config.max_enroll_images,
        },
    );

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "attendd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendd shutting down");

    Ok(())
}
