//! The sync engine: the single consumer task behind the whole daemon.
//!
//! One engine owns the propagator state and both inbound channels, so
//! cycles never interleave: each setting-change signal is fully handled
//! (read the store, propose the color) before the next one is looked at,
//! which is what keeps per-notification ordering and the idempotence guard
//! trivially correct without locks.

use accentsync_core::prelude::*;
use accentsync_core::Color;
use accentsync_openrgb::client::{ClientEvent, ClientHandle};
use tokio::sync::mpsc;

use crate::accent::AccentSource;
use crate::listener::ThemeSignal;
use crate::propagator::{ColorPropagator, DeviceControl};

/// The client handle is the production device writer. `refresh_devices`
/// collapses to a count here; the handle's cache keeps the details.
impl DeviceControl for ClientHandle {
    async fn apply_to_all(&self, color: Color) -> Result<usize> {
        ClientHandle::apply_to_all(self, color).await
    }

    async fn refresh_devices(&self) -> Result<usize> {
        let devices = ClientHandle::refresh_devices(self).await?;
        Ok(devices.len())
    }

    async fn prepare_devices(&self) -> Result<usize> {
        ClientHandle::prepare_devices(self).await
    }
}

/// Drives read → propose cycles from setting-change signals and reacts to
/// client events (device list changes, reconnects).
pub struct SyncEngine<S, W> {
    source: S,
    propagator: ColorPropagator<W>,
    signal_rx: mpsc::Receiver<ThemeSignal>,
    event_rx: mpsc::Receiver<ClientEvent>,
    /// Whether resyncs may switch devices into a static-family mode
    /// (`[sync] set_static_mode`).
    set_static_mode: bool,
}

impl<S, W> SyncEngine<S, W>
where
    S: AccentSource,
    W: DeviceControl,
{
    pub fn new(
        source: S,
        writer: W,
        signal_rx: mpsc::Receiver<ThemeSignal>,
        event_rx: mpsc::Receiver<ClientEvent>,
        set_static_mode: bool,
    ) -> Self {
        Self {
            source,
            propagator: ColorPropagator::new(writer),
            signal_rx,
            event_rx,
            set_static_mode,
        }
    }

    /// One full cycle: read the accent store, propose the reading.
    ///
    /// Returns `Ok(true)` when devices were painted. Used directly for the
    /// startup sync and the `--once` pass; the run loop wraps it with the
    /// skip-on-recoverable-failure policy.
    pub async fn sync_once(&mut self) -> Result<bool> {
        let reading = self.source.read()?;
        self.propagator.propose(reading).await
    }

    /// Consume signals and client events until the signal channel closes
    /// (clean stop) or the client is gone for good (error).
    pub async fn run(mut self) -> Result<()> {
        let mut events_open = true;

        loop {
            tokio::select! {
                maybe_signal = self.signal_rx.recv() => match maybe_signal {
                    Some(ThemeSignal) => self.run_cycle().await?,
                    None => {
                        info!("Setting-change channel closed, stopping the engine");
                        return Ok(());
                    }
                },
                maybe_event = self.event_rx.recv(), if events_open => match maybe_event {
                    Some(event) => self.handle_event(event).await?,
                    None => {
                        debug!("Client event channel closed");
                        events_open = false;
                    }
                },
            }
        }
    }

    /// A failed cycle is logged and skipped; the next notification gets a
    /// fresh attempt against the store and the devices.
    async fn run_cycle(&mut self) -> Result<()> {
        match self.sync_once().await {
            Ok(_) => Ok(()),
            Err(err) if err.is_recoverable() => {
                warn!("Sync cycle failed, waiting for the next notification: {}", err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_event(&mut self, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::DeviceListUpdated => {
                info!("Hub device list changed, resyncing");
                self.resync_devices().await
            }
            ClientEvent::Reconnecting { attempt, max_attempts } => {
                info!(
                    "Hub connection lost, reconnect attempt {}/{}",
                    attempt, max_attempts
                );
                Ok(())
            }
            ClientEvent::Reconnected => {
                info!("Hub connection restored, resyncing");
                self.resync_devices().await
            }
            ClientEvent::PermanentlyDisconnected => Err(Error::connection(
                "hub connection lost and reconnection exhausted",
            )),
        }
    }

    /// Re-learn the device set and put the recorded color back on it.
    ///
    /// New or re-enumerated devices come up in whatever mode they were left
    /// in and without our color, so: refresh the cache, fix the modes,
    /// re-send the last applied color.
    async fn resync_devices(&mut self) -> Result<()> {
        let set_static_mode = self.set_static_mode;
        let outcome: Result<bool> = async {
            let refreshed = self.propagator.writer().refresh_devices().await?;
            let switched = if set_static_mode {
                self.propagator.writer().prepare_devices().await?
            } else {
                0
            };
            debug!(
                "Refreshed {} device(s), switched {} to a static-family mode",
                refreshed, switched
            );
            self.propagator.reapply().await
        }
        .await;

        match outcome {
            Ok(true) => info!("Re-applied the recorded accent color after a device change"),
            Ok(false) => debug!("No recorded color to re-apply"),
            Err(Error::ChannelClosed) => return Err(Error::ChannelClosed),
            // Anything else is transient here: the client's reconnect
            // machinery emits another event once the hub is reachable again.
            Err(err) => warn!("Device resync failed: {}", err),
        }
        Ok(())
    }

    /// The last color successfully applied, if any.
    pub fn last_applied(&self) -> Option<Color> {
        self.propagator.last_applied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const TEAL: Color = Color::new(0, 128, 128);
    const RED: Color = Color::new(200, 0, 0);

    /// Returns scripted readings in order; `Ok(None)` once the script runs
    /// out.
    struct ScriptedSource {
        readings: Mutex<VecDeque<Result<Option<Color>>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Option<Color>>>) -> Self {
            Self {
                readings: Mutex::new(script.into()),
            }
        }
    }

    impl AccentSource for ScriptedSource {
        fn read(&self) -> Result<Option<Color>> {
            self.readings.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    /// Counts every device operation; individual operations can be told to
    /// fail once.
    #[derive(Clone, Default)]
    struct RecordingControl {
        applied: Arc<Mutex<Vec<Color>>>,
        refreshes: Arc<AtomicUsize>,
        prepares: Arc<AtomicUsize>,
        fail_next_apply: Arc<AtomicBool>,
        fail_next_refresh: Arc<AtomicBool>,
    }

    impl RecordingControl {
        fn applied(&self) -> Vec<Color> {
            self.applied.lock().unwrap().clone()
        }

        fn refreshes(&self) -> usize {
            self.refreshes.load(Ordering::SeqCst)
        }

        fn prepares(&self) -> usize {
            self.prepares.load(Ordering::SeqCst)
        }
    }

    impl DeviceControl for RecordingControl {
        async fn apply_to_all(&self, color: Color) -> Result<usize> {
            if self.fail_next_apply.swap(false, Ordering::SeqCst) {
                return Err(Error::device_write("injected apply failure"));
            }
            self.applied.lock().unwrap().push(color);
            Ok(1)
        }

        async fn refresh_devices(&self) -> Result<usize> {
            if self.fail_next_refresh.swap(false, Ordering::SeqCst) {
                return Err(Error::protocol("injected refresh failure"));
            }
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }

        async fn prepare_devices(&self) -> Result<usize> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn engine_with(
        script: Vec<Result<Option<Color>>>,
        control: RecordingControl,
    ) -> (
        SyncEngine<ScriptedSource, RecordingControl>,
        mpsc::Sender<ThemeSignal>,
        mpsc::Sender<ClientEvent>,
    ) {
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let engine = SyncEngine::new(
            ScriptedSource::new(script),
            control,
            signal_rx,
            event_rx,
            true,
        );
        (engine, signal_tx, event_tx)
    }

    /// Poll `condition` until it holds or two seconds pass.
    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_sync_once_applies_initial_reading() {
        let control = RecordingControl::default();
        let (mut engine, _signal_tx, _event_tx) =
            engine_with(vec![Ok(Some(TEAL))], control.clone());

        assert!(engine.sync_once().await.unwrap());
        assert_eq!(control.applied(), vec![TEAL]);
        assert_eq!(engine.last_applied(), Some(TEAL));
    }

    #[tokio::test]
    async fn test_sync_once_with_absent_reading_is_noop() {
        let control = RecordingControl::default();
        let (mut engine, _signal_tx, _event_tx) = engine_with(vec![Ok(None)], control.clone());

        assert!(!engine.sync_once().await.unwrap());
        assert!(control.applied().is_empty());
        assert_eq!(engine.last_applied(), None);
    }

    #[tokio::test]
    async fn test_signals_drive_cycles_in_order() {
        let control = RecordingControl::default();
        let (mut engine, signal_tx, _event_tx) = engine_with(
            vec![Ok(Some(TEAL)), Ok(Some(TEAL)), Ok(Some(RED))],
            control.clone(),
        );

        // Startup sync consumes the first reading.
        engine.sync_once().await.unwrap();
        let task = tokio::spawn(engine.run());

        // A duplicate notification, then an actual change.
        signal_tx.send(ThemeSignal).await.unwrap();
        signal_tx.send(ThemeSignal).await.unwrap();
        drop(signal_tx);

        task.await.unwrap().unwrap();
        assert_eq!(control.applied(), vec![TEAL, RED]);
    }

    #[tokio::test]
    async fn test_read_failure_skips_the_cycle() {
        let control = RecordingControl::default();
        let (engine, signal_tx, _event_tx) = engine_with(
            vec![Err(Error::accent_store("registry busy")), Ok(Some(TEAL))],
            control.clone(),
        );
        let task = tokio::spawn(engine.run());

        signal_tx.send(ThemeSignal).await.unwrap();
        signal_tx.send(ThemeSignal).await.unwrap();
        drop(signal_tx);

        task.await.unwrap().unwrap();
        assert_eq!(control.applied(), vec![TEAL]);
    }

    #[tokio::test]
    async fn test_write_failure_skips_the_cycle_and_retries() {
        let control = RecordingControl::default();
        control.fail_next_apply.store(true, Ordering::SeqCst);
        let (engine, signal_tx, _event_tx) = engine_with(
            vec![Ok(Some(TEAL)), Ok(Some(TEAL))],
            control.clone(),
        );
        let task = tokio::spawn(engine.run());

        // First cycle fails the write; the second sees the same color as
        // still-unapplied and retries it.
        signal_tx.send(ThemeSignal).await.unwrap();
        signal_tx.send(ThemeSignal).await.unwrap();
        drop(signal_tx);

        task.await.unwrap().unwrap();
        assert_eq!(control.applied(), vec![TEAL]);
    }

    #[tokio::test]
    async fn test_device_list_event_triggers_resync() {
        let control = RecordingControl::default();
        let (mut engine, signal_tx, event_tx) =
            engine_with(vec![Ok(Some(TEAL))], control.clone());

        engine.sync_once().await.unwrap();
        let task = tokio::spawn(engine.run());

        event_tx.send(ClientEvent::DeviceListUpdated).await.unwrap();

        let probe = control.clone();
        wait_until(move || {
            probe.refreshes() == 1 && probe.prepares() == 1 && probe.applied().len() == 2
        })
        .await;
        // The re-applied color is the recorded one, unchanged.
        assert_eq!(control.applied(), vec![TEAL, TEAL]);

        drop(signal_tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnected_event_triggers_resync() {
        let control = RecordingControl::default();
        let (mut engine, signal_tx, event_tx) =
            engine_with(vec![Ok(Some(RED))], control.clone());

        engine.sync_once().await.unwrap();
        let task = tokio::spawn(engine.run());

        event_tx
            .send(ClientEvent::Reconnecting {
                attempt: 1,
                max_attempts: 10,
            })
            .await
            .unwrap();
        event_tx.send(ClientEvent::Reconnected).await.unwrap();

        let probe = control.clone();
        wait_until(move || probe.refreshes() == 1 && probe.applied().len() == 2).await;

        drop(signal_tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resync_leaves_modes_alone_when_static_mode_is_off() {
        let control = RecordingControl::default();
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let mut engine = SyncEngine::new(
            ScriptedSource::new(vec![Ok(Some(TEAL))]),
            control.clone(),
            signal_rx,
            event_rx,
            false,
        );

        engine.sync_once().await.unwrap();
        let task = tokio::spawn(engine.run());

        event_tx.send(ClientEvent::DeviceListUpdated).await.unwrap();

        let probe = control.clone();
        wait_until(move || probe.refreshes() == 1 && probe.applied().len() == 2).await;
        assert_eq!(control.prepares(), 0);

        drop(signal_tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resync_without_recorded_color_sends_nothing() {
        let control = RecordingControl::default();
        let (engine, signal_tx, event_tx) = engine_with(vec![], control.clone());
        let task = tokio::spawn(engine.run());

        event_tx.send(ClientEvent::DeviceListUpdated).await.unwrap();

        let probe = control.clone();
        wait_until(move || probe.refreshes() == 1 && probe.prepares() == 1).await;
        assert!(control.applied().is_empty());

        drop(signal_tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resync_failure_keeps_the_engine_alive() {
        let control = RecordingControl::default();
        control.fail_next_refresh.store(true, Ordering::SeqCst);
        let (engine, signal_tx, event_tx) =
            engine_with(vec![Ok(Some(TEAL))], control.clone());
        let task = tokio::spawn(engine.run());

        event_tx.send(ClientEvent::DeviceListUpdated).await.unwrap();

        // The failed resync is tolerated; a later signal still syncs.
        signal_tx.send(ThemeSignal).await.unwrap();
        drop(signal_tx);

        task.await.unwrap().unwrap();
        assert_eq!(control.applied(), vec![TEAL]);
        assert_eq!(control.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_permanent_disconnect_stops_the_engine() {
        let control = RecordingControl::default();
        let (engine, _signal_tx, event_tx) = engine_with(vec![], control);
        let task = tokio::spawn(engine.run());

        event_tx
            .send(ClientEvent::PermanentlyDisconnected)
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_event_channel_close_is_tolerated() {
        let control = RecordingControl::default();
        let (engine, signal_tx, event_tx) =
            engine_with(vec![Ok(Some(TEAL))], control.clone());
        let task = tokio::spawn(engine.run());

        // The client going quiet doesn't stop signal handling.
        drop(event_tx);
        signal_tx.send(ThemeSignal).await.unwrap();
        drop(signal_tx);

        task.await.unwrap().unwrap();
        assert_eq!(control.applied(), vec![TEAL]);
    }
}
