// src/main.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};

use gsrstick::monitor::{poll_until_done, PollOutcome};
use gsrstick::store::{PersistenceGateway, SqliteGateway};
use gsrstick::{DeviceSession, SessionConfig};

fn main() -> Result<()> {
    env_logger::init();
    let config = SessionConfig::load().context("loading configuration")?;

    // SIGINT and SIGTERM only raise the flag; the poll loop sees it and the
    // session is stopped and released below.
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing termination handler")?;

    let store: Arc<dyn PersistenceGateway> = Arc::new(
        SqliteGateway::open(&config.database_path).with_context(|| {
            format!("opening database {}", config.database_path.display())
        })?,
    );
    let mut session = DeviceSession::connect(
        &config.port,
        config.allow_simulated_fallback,
        store,
        &config,
    )
    .with_context(|| format!("connecting to sensor on {}", config.port))?;

    if config.close_stale_sessions {
        session
            .close_stale_session()
            .context("closing stale session")?;
    }
    session
        .start_streaming(config.subject_id, &config.label)
        .context("starting stream")?;

    // Headless consumer: polls the live buffer the way a dashboard would.
    let outcome = poll_until_done(&config, &shutdown, || {
        let data = session.get_live_data();
        match data.last() {
            Some(latest) => info!(
                "{} samples, latest gsr 0x{:04X} ppg {} conductance {}",
                data.len(),
                latest.raw_gsr,
                latest.raw_ppg,
                latest
                    .conductance
                    .map(|c| format!("{c:.3} uS"))
                    .unwrap_or_else(|| "n/a".into())
            ),
            None => info!("waiting for samples"),
        }
        data.len()
    });
    if outcome == PollOutcome::Interrupted {
        warn!("interrupted, shutting down");
    }

    if let Err(err) = session.stop_streaming(true, true) {
        error!("stop failed: {err}");
    }
    session.safe_shutdown().context("releasing session")?;
    Ok(())
}
