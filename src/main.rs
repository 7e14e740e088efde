use anyhow::{Context, Result};
use field_agent::config::load_agent_config;
use field_agent::device::Device;
use field_agent::ledger::{Ledger, LedgerMode, MemoryLedger, NatsLedger};
use field_agent::sensor::{Sensor, StaticSensorMock};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "field_agent=info".into()),
        )
        .init();

    info!("Field agent starting...");

    let config = load_agent_config().context("Failed to load configuration")?;
    info!(
        device_id = %config.device.id,
        ledger_mode = ?config.ledger.mode,
        debug_env = config.mocks.debug_env,
        "Configuration loaded"
    );

    let ledger: Arc<dyn Ledger> = match config.ledger.mode {
        LedgerMode::Nats => Arc::new(
            NatsLedger::connect(config.ledger.clone())
                .await
                .context("Failed to connect to ledger")?,
        ),
        LedgerMode::Memory => Arc::new(MemoryLedger::new()),
    };

    let debug_env = config.mocks.debug_env;
    let jitter = config.mocks.jitter;
    let device = Device::new(config, Arc::clone(&ledger));

    if debug_env {
        info!("Debug environment, registering static mock sensor");
        device
            .register_static_sensors(vec![
                Arc::new(StaticSensorMock::debug(jitter)) as Arc<dyn Sensor>
            ])
            .await;
    }

    device.init().await.context("Failed to initialize device")?;

    let operating = {
        let device = Arc::clone(&device);
        tokio::spawn(async move {
            if let Err(e) = device.operate().await {
                error!(error = %e, "Device stopped operating");
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    device.close().await;
    let _ = operating.await;

    ledger.close().await.context("Failed to close ledger")?;

    info!("Field agent stopped");
    Ok(())
}
