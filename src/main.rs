// Main entry point - runs the relay until Ctrl-C
use carrier_relay::{selftest, RelayController, Settings, StatusObserver};
use std::sync::Arc;
use std::time::Duration;

struct LogObserver;

impl StatusObserver for LogObserver {
    fn on_status_changed(&self, running: bool, message: &str) {
        if running {
            tracing::info!("Relay running: {}", message);
        } else {
            tracing::info!("Relay stopped: {}", message);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = Settings::load().unwrap_or_default();
    settings.apply_env()?;

    // Log file next to the other local app data
    let log_file_path = {
        let app_data = dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let relay_dir = app_data.join("carrier-relay");
        let _ = std::fs::create_dir_all(&relay_dir);
        relay_dir.join("carrier-relay.log")
    };

    let file_appender = tracing_appender::rolling::never(
        log_file_path.parent().unwrap_or_else(|| std::path::Path::new(".")),
        log_file_path.file_name().unwrap_or_default(),
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .init();

    tracing::info!("Starting carrier-relay");
    tracing::info!("Log file: {:?}", log_file_path);

    let config = settings.proxy_config()?;
    let mut controller = RelayController::new(settings.relay_options());
    controller.set_observer(Arc::new(LogObserver));
    controller.start(config).await?;

    if !settings.proxy_test_url.is_empty() {
        if let Some(http_addr) = controller.status().http_addr {
            let timeout = Duration::from_secs(settings.connect_timeout.max(1) * 3);
            match selftest::check_through_proxy(http_addr, &settings.proxy_test_url, timeout).await {
                Ok(status) => tracing::info!(
                    "Connection test OK: HTTP {} for {}",
                    status,
                    settings.proxy_test_url
                ),
                Err(e) => tracing::warn!("Connection test failed: {}", e),
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    let status = controller.status();
    tracing::info!("{} active connections at shutdown", status.active_connections);
    controller.stop().await;

    Ok(())
}
