//! Setting-change notifications.
//!
//! Windows announces theme changes by broadcasting `WM_SETTINGCHANGE` to
//! every top-level window, naming the changed setting in lparam. The
//! listener runs a hidden window and message pump on a dedicated thread,
//! filters the broadcasts down to accent color changes, and forwards one
//! [`ThemeSignal`] per match over a bounded channel.
//!
//! The signal itself carries no color. Windows batches several broadcasts
//! around one theme change, and the values race each other; re-reading the
//! store on receipt is the only way to get the settled color.

use accentsync_core::prelude::*;
use tokio::sync::mpsc;

#[cfg(windows)]
mod win32;

/// Setting name Windows broadcasts when immersive color settings (the
/// accent color among them) change.
pub const IMMERSIVE_COLOR_SET: &str = "ImmersiveColorSet";

/// How many signals the channel buffers before the pump blocks. A slow
/// consumer delays delivery; it never loses a notification.
const SIGNAL_CHANNEL_CAPACITY: usize = 16;

/// Payload-free "re-read the accent color now" trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThemeSignal;

/// `true` for the one setting name that indicates an accent color change.
///
/// Pure so it can be tested anywhere; the pump applies it to every
/// `WM_SETTINGCHANGE` it receives.
pub fn is_accent_setting(setting: &str) -> bool {
    setting == IMMERSIVE_COLOR_SET
}

/// Two-phase wrapper around the OS subscription.
///
/// Construction has no side effects; [`start`](SettingChangeListener::start)
/// performs the window registration and spawns the pump thread, returning
/// only once registration verifiably succeeded or failed.
#[derive(Debug, Default)]
pub struct SettingChangeListener;

impl SettingChangeListener {
    pub fn new() -> Self {
        Self
    }

    /// Register with the OS and start delivering signals.
    ///
    /// # Errors
    ///
    /// [`Error::Listener`] when the window class registration or window
    /// creation fails. Callers treat this as fatal: without the window there
    /// will never be a notification.
    #[cfg(windows)]
    pub async fn start(self) -> Result<mpsc::Receiver<ThemeSignal>> {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        std::thread::Builder::new()
            .name("settings-pump".into())
            .spawn(move || win32::run_message_pump(signal_tx, ready_tx))
            .map_err(|err| Error::listener(format!("failed to spawn pump thread: {err}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("Setting-change listener registered");
                Ok(signal_rx)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::listener(
                "pump thread exited before reporting its registration",
            )),
        }
    }

    /// The broadcast mechanism only exists on Windows.
    #[cfg(not(windows))]
    pub async fn start(self) -> Result<mpsc::Receiver<ThemeSignal>> {
        Err(Error::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_immersive_color_set() {
        assert!(is_accent_setting("ImmersiveColorSet"));
    }

    #[test]
    fn test_filter_rejects_other_settings() {
        for name in ["Policy", "Environment", "WindowsThemeElement", "intl", ""] {
            assert!(!is_accent_setting(name), "{name:?} must not signal");
        }
    }

    #[test]
    fn test_filter_is_case_sensitive() {
        // The broadcast uses this exact casing; anything else is a
        // different setting.
        assert!(!is_accent_setting("immersivecolorset"));
        assert!(!is_accent_setting("IMMERSIVECOLORSET"));
    }

    #[tokio::test]
    async fn test_only_matching_broadcasts_become_signals() {
        // What the pump does with each broadcast, minus the window plumbing:
        // filter, then send.
        let (tx, mut rx) = mpsc::channel(16);
        let broadcasts = [
            "ImmersiveColorSet",
            "Environment",
            "ImmersiveColorSet",
            "Policy",
            "ImmersiveColorSet",
        ];
        for name in broadcasts {
            if is_accent_setting(name) {
                tx.try_send(ThemeSignal).unwrap();
            }
        }
        drop(tx);

        let mut delivered = 0;
        while rx.recv().await.is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, 3);
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_start_is_unsupported_off_windows() {
        let result = SettingChangeListener::new().start().await;
        assert!(matches!(result, Err(Error::Unsupported)));
    }
}
