//! Wires the pieces into the three entry points the binary exposes.
//!
//! [`run`] is the daemon proper: single-instance guard, hub connection,
//! setting-change listener, sync engine, Ctrl-C. [`run_once`] does one
//! read-and-apply pass and exits. [`list_devices`] prints the hub's device
//! table and works on every platform.

use accentsync_core::prelude::*;
use accentsync_openrgb::client::{ClientOptions, OpenRgbClient};

use crate::config::Settings;

#[cfg(windows)]
use accentsync_openrgb::client::Device;

#[cfg(windows)]
use crate::accent::DwmAccentStore;
#[cfg(windows)]
use crate::engine::SyncEngine;
#[cfg(windows)]
use crate::instance::InstanceLock;
#[cfg(windows)]
use crate::listener::SettingChangeListener;

/// Connect to the hub with the configured options.
async fn connect(settings: &Settings) -> Result<OpenRgbClient> {
    let options = ClientOptions {
        client_name: settings.connection.client_name.clone(),
        request_timeout: settings.connection.request_timeout(),
        reconnect: settings.sync.reconnect,
    };
    let addr = settings.connection.addr();
    debug!("Connecting to {} as '{}'", addr, options.client_name);
    let client = OpenRgbClient::connect(&addr, options).await?;
    info!(
        "Connected to {} (SDK protocol {})",
        addr,
        client.protocol_version()
    );
    Ok(client)
}

#[cfg(windows)]
fn log_device_table(devices: &[Device]) {
    info!("Managing {} device(s)", devices.len());
    for device in devices {
        info!(
            "  [{}] {} ({} LEDs, mode: {})",
            device.index,
            device.name,
            device.led_count,
            device.active_mode_name().unwrap_or("?")
        );
    }
}

/// Resolve when the OS asks the process to stop.
#[cfg(windows)]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Run the daemon until Ctrl-C or a fatal error.
///
/// Startup failures (lock held, hub unreachable, listener window) abort;
/// once the engine is running, recoverable trouble is logged and ridden out.
#[cfg(windows)]
pub async fn run(settings: Settings) -> Result<()> {
    let lock = InstanceLock::acquire()?;
    debug!("Instance lock held at {}", lock.path().display());

    let client = connect(&settings).await?;
    let devices = client.refresh_devices().await?;
    log_device_table(&devices);
    if settings.sync.set_static_mode {
        let switched = client.prepare_devices().await?;
        if switched > 0 {
            info!("Switched {} device(s) to a static-family mode", switched);
        }
    }

    let (handle, event_rx) = client.into_parts();
    let signal_rx = SettingChangeListener::new().start().await?;

    let mut engine = SyncEngine::new(
        DwmAccentStore,
        handle,
        signal_rx,
        event_rx,
        settings.sync.set_static_mode,
    );

    if settings.sync.apply_on_start {
        match engine.sync_once().await {
            Ok(true) => info!("Applied the current accent color at startup"),
            Ok(false) => info!("No accent color set, waiting for changes"),
            Err(err) if err.is_recoverable() => {
                warn!("Startup sync failed, continuing: {}", err)
            }
            Err(err) => return Err(err),
        }
    }

    info!("Watching for accent color changes");
    tokio::select! {
        result = engine.run() => result,
        result = wait_for_shutdown() => {
            result?;
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

#[cfg(not(windows))]
pub async fn run(_settings: Settings) -> Result<()> {
    Err(Error::Unsupported)
}

/// One read-and-apply pass, then exit. No instance lock: a running daemon
/// picks the change up again on its next notification anyway.
#[cfg(windows)]
pub async fn run_once(settings: Settings) -> Result<()> {
    use crate::accent::AccentSource;

    let client = connect(&settings).await?;
    let devices = client.refresh_devices().await?;
    log_device_table(&devices);
    if settings.sync.set_static_mode {
        client.prepare_devices().await?;
    }

    match DwmAccentStore.read()? {
        Some(color) => {
            let written = client.apply_to_all(color).await?;
            println!("Applied {} to {} device(s)", color, written);
        }
        None => println!("No accent color set, nothing to apply"),
    }

    client.disconnect().await;
    Ok(())
}

#[cfg(not(windows))]
pub async fn run_once(_settings: Settings) -> Result<()> {
    Err(Error::Unsupported)
}

/// Print the hub's device table. Works anywhere the hub is reachable.
pub async fn list_devices(settings: Settings) -> Result<()> {
    let client = connect(&settings).await?;
    let devices = client.refresh_devices().await?;

    if devices.is_empty() {
        println!("No devices reported by {}", settings.connection.addr());
    } else {
        println!(
            "{} device(s) at {} (SDK protocol {}):",
            devices.len(),
            settings.connection.addr(),
            client.protocol_version()
        );
        for device in &devices {
            println!(
                "  [{}] {} ({} LEDs, mode: {})",
                device.index,
                device.name,
                device.led_count,
                device.active_mode_name().unwrap_or("?")
            );
        }
    }

    client.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use accentsync_openrgb::test_utils::{FakeController, FakeHub};

    #[tokio::test]
    async fn test_list_devices_announces_the_configured_name() {
        let hub = FakeHub::start(vec![FakeController::new("Strip", 4)]).await;
        let mut settings = Settings::default();
        settings.set_server(&hub.addr()).unwrap();
        settings.connection.client_name = "lister".to_string();

        list_devices(settings).await.unwrap();

        hub.wait_for_client_name().await;
        assert_eq!(hub.client_names(), vec!["lister".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_as_connection_error() {
        let mut settings = Settings::default();
        settings.set_server("127.0.0.1:1").unwrap();
        settings.sync.reconnect = false;

        let err = list_devices(settings).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_run_is_unsupported_off_windows() {
        assert!(matches!(
            run(Settings::default()).await,
            Err(Error::Unsupported)
        ));
        assert!(matches!(
            run_once(Settings::default()).await,
            Err(Error::Unsupported)
        ));
    }
}
