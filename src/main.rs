use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

use blebridge::domain::settings::SettingsService;
use blebridge::infrastructure::logging;
use blebridge::infrastructure::mock::MockAdapter;
use blebridge::protocol::{ClientChannel, PROTOCOL_VERSION};
use blebridge::service::BridgeService;

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _logging_guard = logging::init_logger(&settings.log_settings)?;
    info!("blebridged starting");

    let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
    let adapter = Box::new(MockAdapter::new(adapter_tx));

    // The IPC transport is provided by the embedder; until one attaches,
    // outbound traffic is drained to the debug log.
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let client = ClientChannel::new(server_tx, PROTOCOL_VERSION);
    tokio::spawn(async move {
        while let Some(message) = server_rx.recv().await {
            debug!(?message, "outbound client message");
        }
    });

    let (service, handle, command_rx) = BridgeService::new(adapter, client, &settings);
    let service_task = tokio::spawn(service.run(client_rx, adapter_rx, command_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    handle.shutdown();
    drop(client_tx);
    service_task.await?;
    Ok(())
}
