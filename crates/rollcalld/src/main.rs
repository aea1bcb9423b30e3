use anyhow::{Context, Result};
use rollcall_core::{AuditLog, GalleryCache, LabelFont, Session, Store};
use rollcall_hw::Camera;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod encoder;
mod engine;

use config::Config;
use dbus_interface::RollcallService;
use encoder::CommandEncoder;
use engine::CameraSource;

const BUS_NAME: &str = "org.freedesktop.Rollcall1";
const OBJECT_PATH: &str = "/org/freedesktop/Rollcall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    // Storage is fatal at startup: there is no degraded mode without it.
    let store = Arc::new(
        Store::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?
            .with_audit(AuditLog::new(&config.audit_path)),
    );
    let gallery = Arc::new(GalleryCache::new());
    let enrolled = gallery.reload(&store)?;
    tracing::info!(enrolled, "gallery loaded");

    let camera = Camera::open(&config.camera_device)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let encoder = CommandEncoder::new(
        &config.encoder_command,
        Duration::from_millis(config.encoder_timeout_ms),
    )?;

    let mut session = Session::new(store, gallery, encoder).with_tolerance(config.tolerance);
    if let Some(path) = &config.label_font {
        match LabelFont::from_file(path) {
            Ok(font) => session = session.with_label_font(font),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "label font unavailable; face labels drawn without text"
            ),
        }
    }

    let engine = engine::spawn_engine(
        session,
        CameraSource::new(camera, config.warmup_frames),
        Duration::from_millis(config.tick_interval_ms),
        config.preview_path.clone(),
    )
    .context("failed to spawn engine thread")?;

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallService::new(engine))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
