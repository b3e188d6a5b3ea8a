use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;

use lib_eddn::{
    ClientEvent, Endian, FrameClock, IngestionClient, RegionMap, Router, TickFrameClock,
};

mod monitor_logic;
use monitor_logic::{config, display, logger};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    logger::setup_logging(
        config.log_dir.as_deref().unwrap_or("./logs".as_ref()),
        config.log_level.as_deref().unwrap_or("info"),
    )?;

    let region_map = Arc::new(RegionMap::new());
    if let Some(path) = &config.region_map_path {
        match region_map.load_path(path, Endian::host()).await {
            Ok(()) => log::info!("Region map loaded from {}", path.display()),
            Err(e) => log::warn!("Region map unavailable ({e}); regions will show as unknown"),
        }
    }

    let client = IngestionClient::new(config.client_options(), Arc::clone(&region_map));
    client.events().on(|ev: &ClientEvent| match ev {
        ClientEvent::Open => log::info!("Gateway link open"),
        ClientEvent::Close {
            code,
            reason,
            was_clean,
        } => log::info!("Gateway link closed ({code}, clean={was_clean}): {reason}"),
        ClientEvent::Error(detail) => log::warn!("Gateway error: {detail}"),
        ClientEvent::ParseError { kind, detail } => {
            log::debug!("Rejected frame ({kind:?}): {detail}")
        }
        ClientEvent::Message(_) => {}
    });

    let router = Router::attach(client.events());
    let clock: Arc<dyn FrameClock> = Arc::new(TickFrameClock::new(Duration::from_millis(250)));

    let journal_topics = config.journal_topics.clone().unwrap_or_default();
    let _journal = display::journal_panel(
        &router,
        Arc::clone(&clock),
        config.render_options(),
        &journal_topics,
    );
    let _events = display::all_events_panel(&router, Arc::clone(&clock), config.render_options());

    client.connect()?;
    log::info!("Connected pipeline to {}", client.url());

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Could not install SIGTERM handler: {e}");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    router.detach();
    client.close();

    log::info!("Shutdown complete.");
    Ok(())
}
