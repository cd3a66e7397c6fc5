//! Decides which accent colors actually reach the devices.

use accentsync_core::prelude::*;
use accentsync_core::Color;

/// The device-side surface the sync engine writes through.
///
/// `apply_to_all` paints every managed device, `refresh_devices` re-reads
/// the hub's controller list, `prepare_devices` moves animated devices into
/// a direct-color mode. Implemented by the OpenRGB client handle; tests use
/// recording fakes.
#[trait_variant::make(DeviceControl: Send)]
pub trait LocalDeviceControl {
    async fn apply_to_all(&self, color: Color) -> Result<usize>;
    async fn refresh_devices(&self) -> Result<usize>;
    async fn prepare_devices(&self) -> Result<usize>;
}

/// Forwards a color to the devices only when it is new.
///
/// Owns the engine's one piece of state: the last color successfully
/// applied, `None` until the first write goes through.
pub struct ColorPropagator<W> {
    writer: W,
    last_applied: Option<Color>,
}

impl<W: DeviceControl> ColorPropagator<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            last_applied: None,
        }
    }

    /// Decide whether `reading` warrants a device write, and perform it.
    ///
    /// Returns `Ok(true)` when devices were painted, `Ok(false)` when the
    /// reading was absent or unchanged. A failed write leaves the recorded
    /// color untouched, so the next proposal retries the write.
    pub async fn propose(&mut self, reading: Option<Color>) -> Result<bool> {
        let Some(color) = reading else {
            debug!("No accent color set; nothing to apply");
            return Ok(false);
        };
        if self.last_applied == Some(color) {
            debug!("Accent color unchanged ({}), skipping device write", color);
            return Ok(false);
        }

        let written = self.writer.apply_to_all(color).await?;
        info!("Accent color {} applied to {} device(s)", color, written);
        self.last_applied = Some(color);
        Ok(true)
    }

    /// Re-send the recorded color, e.g. after the device set changed.
    ///
    /// Never changes the recorded color; a re-applied write is not a new
    /// value. `Ok(false)` when nothing has been applied yet.
    pub async fn reapply(&mut self) -> Result<bool> {
        let Some(color) = self.last_applied else {
            return Ok(false);
        };
        let written = self.writer.apply_to_all(color).await?;
        info!("Accent color {} re-applied to {} device(s)", color, written);
        Ok(true)
    }

    /// The last color successfully applied, if any.
    pub fn last_applied(&self) -> Option<Color> {
        self.last_applied
    }

    /// Borrow the underlying writer, e.g. to refresh the device list.
    pub fn writer(&self) -> &W {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every applied color; can be told to fail the next write.
    #[derive(Clone, Default)]
    struct RecordingWriter {
        writes: Arc<Mutex<Vec<Color>>>,
        fail_next: Arc<AtomicBool>,
    }

    impl RecordingWriter {
        fn writes(&self) -> Vec<Color> {
            self.writes.lock().unwrap().clone()
        }

        fn fail_next_write(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    impl DeviceControl for RecordingWriter {
        async fn apply_to_all(&self, color: Color) -> Result<usize> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::device_write("injected failure"));
            }
            self.writes.lock().unwrap().push(color);
            Ok(1)
        }

        async fn refresh_devices(&self) -> Result<usize> {
            Ok(1)
        }

        async fn prepare_devices(&self) -> Result<usize> {
            Ok(0)
        }
    }

    const TEAL: Color = Color::new(0, 128, 128);
    const RED: Color = Color::new(200, 0, 0);

    #[tokio::test]
    async fn test_first_proposal_writes() {
        let writer = RecordingWriter::default();
        let mut propagator = ColorPropagator::new(writer.clone());

        assert!(propagator.propose(Some(TEAL)).await.unwrap());
        assert_eq!(writer.writes(), vec![TEAL]);
        assert_eq!(propagator.last_applied(), Some(TEAL));
    }

    #[tokio::test]
    async fn test_unchanged_color_is_skipped() {
        let writer = RecordingWriter::default();
        let mut propagator = ColorPropagator::new(writer.clone());

        assert!(propagator.propose(Some(TEAL)).await.unwrap());
        assert!(!propagator.propose(Some(TEAL)).await.unwrap());
        assert!(!propagator.propose(Some(TEAL)).await.unwrap());

        // Only the first proposal reached the devices.
        assert_eq!(writer.writes(), vec![TEAL]);
        assert_eq!(propagator.last_applied(), Some(TEAL));
    }

    #[tokio::test]
    async fn test_changed_color_writes_again() {
        let writer = RecordingWriter::default();
        let mut propagator = ColorPropagator::new(writer.clone());

        assert!(propagator.propose(Some(TEAL)).await.unwrap());
        assert!(propagator.propose(Some(RED)).await.unwrap());

        assert_eq!(writer.writes(), vec![TEAL, RED]);
        assert_eq!(propagator.last_applied(), Some(RED));
    }

    #[tokio::test]
    async fn test_absent_reading_never_writes() {
        let writer = RecordingWriter::default();
        let mut propagator = ColorPropagator::new(writer.clone());

        // Absent before anything was applied.
        assert!(!propagator.propose(None).await.unwrap());
        assert_eq!(propagator.last_applied(), None);

        // Absent after a write leaves the recorded color alone.
        propagator.propose(Some(TEAL)).await.unwrap();
        assert!(!propagator.propose(None).await.unwrap());
        assert_eq!(propagator.last_applied(), Some(TEAL));
        assert_eq!(writer.writes(), vec![TEAL]);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_state_and_retries() {
        let writer = RecordingWriter::default();
        let mut propagator = ColorPropagator::new(writer.clone());
        propagator.propose(Some(TEAL)).await.unwrap();

        writer.fail_next_write();
        let err = propagator.propose(Some(RED)).await.unwrap_err();
        assert!(matches!(err, Error::DeviceWrite { .. }));
        // State still reflects the last successful write, so the same color
        // is treated as new on the next cycle.
        assert_eq!(propagator.last_applied(), Some(TEAL));

        assert!(propagator.propose(Some(RED)).await.unwrap());
        assert_eq!(writer.writes(), vec![TEAL, RED]);
        assert_eq!(propagator.last_applied(), Some(RED));
    }

    #[tokio::test]
    async fn test_reapply_resends_without_state_change() {
        let writer = RecordingWriter::default();
        let mut propagator = ColorPropagator::new(writer.clone());
        propagator.propose(Some(TEAL)).await.unwrap();

        assert!(propagator.reapply().await.unwrap());
        assert_eq!(writer.writes(), vec![TEAL, TEAL]);
        assert_eq!(propagator.last_applied(), Some(TEAL));

        // A duplicate proposal right after is still a duplicate.
        assert!(!propagator.propose(Some(TEAL)).await.unwrap());
    }

    #[tokio::test]
    async fn test_reapply_before_first_write_is_noop() {
        let writer = RecordingWriter::default();
        let mut propagator = ColorPropagator::new(writer.clone());

        assert!(!propagator.reapply().await.unwrap());
        assert!(writer.writes().is_empty());
    }
}
