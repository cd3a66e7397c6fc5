//! End-to-end sync loop tests against a fake OpenRGB server.
//!
//! The real engine, propagator, and TCP client run over real sockets and
//! channels; only the OS-facing pieces (registry read, broadcast pump) are
//! scripted. The fake hub records every frame it receives.

use std::collections::VecDeque;
use std::sync::Mutex;

use accentsync_app::accent::AccentSource;
use accentsync_app::engine::SyncEngine;
use accentsync_app::listener::ThemeSignal;
use accentsync_core::{Color, Result};
use accentsync_openrgb::client::{ClientOptions, OpenRgbClient};
use accentsync_openrgb::test_utils::{FakeController, FakeHub};
use tokio::sync::mpsc;

const INITIAL: Color = Color::new(10, 20, 30);
const CHANGED: Color = Color::new(200, 0, 0);

/// Accent store that hands out a fixed script of readings, then `None`.
struct ScriptedSource {
    readings: Mutex<VecDeque<Option<Color>>>,
}

impl ScriptedSource {
    fn new(script: Vec<Option<Color>>) -> Self {
        Self {
            readings: Mutex::new(script.into()),
        }
    }
}

impl AccentSource for ScriptedSource {
    fn read(&self) -> Result<Option<Color>> {
        Ok(self.readings.lock().unwrap().pop_front().flatten())
    }
}

async fn connect(hub: &FakeHub) -> OpenRgbClient {
    OpenRgbClient::connect(&hub.addr(), ClientOptions::default())
        .await
        .expect("connect to fake hub")
}

#[tokio::test]
async fn test_startup_sync_then_signal_driven_changes() {
    let hub = FakeHub::start(vec![
        FakeController::new("DRAM A", 8).with_modes(&["Rainbow", "Direct"], 0),
        FakeController::new("Desk Strip", 12).with_modes(&["Direct", "Breathing"], 0),
    ])
    .await;

    let client = connect(&hub).await;
    let devices = client.refresh_devices().await.unwrap();
    assert_eq!(devices.len(), 2);

    // Only the controller sitting in an animated mode needs a switch.
    client.prepare_devices().await.unwrap();
    assert_eq!(hub.wait_for_custom_mode(1).await, vec![0]);

    let (handle, event_rx) = client.into_parts();
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let source = ScriptedSource::new(vec![Some(INITIAL), Some(INITIAL), Some(CHANGED)]);
    let mut engine = SyncEngine::new(source, handle, signal_rx, event_rx, true);

    // Startup pass paints both devices with the first reading.
    assert!(engine.sync_once().await.unwrap());
    let frames = hub.wait_for_update_leds(2).await;
    assert_eq!(frames[0].device_index, 0);
    assert_eq!(frames[0].colors, vec![INITIAL; 8]);
    assert_eq!(frames[1].device_index, 1);
    assert_eq!(frames[1].colors, vec![INITIAL; 12]);

    let task = tokio::spawn(engine.run());

    // First notification re-reads the same color: no frames. The second
    // sees the change and repaints everything.
    signal_tx.send(ThemeSignal).await.unwrap();
    signal_tx.send(ThemeSignal).await.unwrap();
    hub.wait_for_update_leds(4).await;

    drop(signal_tx);
    task.await.unwrap().unwrap();

    let frames = hub.update_leds_frames();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[2].colors, vec![CHANGED; 8]);
    assert_eq!(frames[3].colors, vec![CHANGED; 12]);
}

#[tokio::test]
async fn test_reconnect_reapplies_the_recorded_color() {
    let hub = FakeHub::start(vec![
        FakeController::new("Strip", 4).with_modes(&["Direct"], 0)
    ])
    .await;

    let client = connect(&hub).await;
    client.refresh_devices().await.unwrap();
    let (handle, event_rx) = client.into_parts();
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let source = ScriptedSource::new(vec![Some(INITIAL)]);
    let mut engine = SyncEngine::new(source, handle, signal_rx, event_rx, true);

    engine.sync_once().await.unwrap();
    hub.wait_for_update_leds(1).await;

    let task = tokio::spawn(engine.run());
    hub.drop_connections();

    // The client reconnects on its own; the engine then re-learns the
    // devices and re-sends the recorded color without a new notification.
    let frames = hub.wait_for_update_leds(2).await;
    assert_eq!(frames[1].colors, vec![INITIAL; 4]);

    drop(signal_tx);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_hotplugged_device_gets_painted() {
    let hub = FakeHub::start(vec![
        FakeController::new("DRAM", 8).with_modes(&["Direct"], 0)
    ])
    .await;

    let client = connect(&hub).await;
    assert_eq!(client.refresh_devices().await.unwrap().len(), 1);
    let (handle, event_rx) = client.into_parts();
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let source = ScriptedSource::new(vec![Some(CHANGED)]);
    let mut engine = SyncEngine::new(source, handle, signal_rx, event_rx, true);

    engine.sync_once().await.unwrap();
    hub.wait_for_update_leds(1).await;

    let task = tokio::spawn(engine.run());

    // A second controller appears and the hub announces the change.
    hub.set_controllers(vec![
        FakeController::new("DRAM", 8).with_modes(&["Direct"], 0),
        FakeController::new("GPU", 16).with_modes(&["Rainbow", "Direct"], 0),
    ]);
    hub.notify_device_list_changed();

    // Resync switches the new animated controller and paints both.
    assert_eq!(hub.wait_for_custom_mode(1).await, vec![1]);
    let frames = hub.wait_for_update_leds(3).await;
    assert_eq!(frames[1].colors, vec![CHANGED; 8]);
    assert_eq!(frames[2].device_index, 1);
    assert_eq!(frames[2].colors, vec![CHANGED; 16]);

    drop(signal_tx);
    task.await.unwrap().unwrap();
}
