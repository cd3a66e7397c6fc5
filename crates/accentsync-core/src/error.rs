//! Application error types with rich context

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────
    // Platform Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to read the accent color: {message}")]
    AccentStore { message: String },

    #[error("Setting-change listener error: {message}")]
    Listener { message: String },

    #[error("Accent color synchronization is only supported on Windows")]
    Unsupported,

    // ─────────────────────────────────────────────────────────────
    // Device Hub Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device hub connection error: {message}")]
    Connection { message: String },

    #[error("Device protocol error: {message}")]
    Protocol { message: String },

    #[error("Device write failed: {message}")]
    DeviceWrite { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Another instance is already running (lock file: {})", path.display())]
    AlreadyRunning { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel send error: {message}")]
    ChannelSend { message: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn accent_store(message: impl Into<String>) -> Self {
        Self::AccentStore {
            message: message.into(),
        }
    }

    pub fn listener(message: impl Into<String>) -> Self {
        Self::Listener {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn device_write(message: impl Into<String>) -> Self {
        Self::DeviceWrite {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn already_running(path: impl Into<PathBuf>) -> Self {
        Self::AlreadyRunning { path: path.into() }
    }

    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors abort the current sync cycle but leave the process
    /// running; the next notification gets a fresh attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::AccentStore { .. }
                | Error::Protocol { .. }
                | Error::DeviceWrite { .. }
                | Error::ChannelSend { .. }
        )
    }

    /// Check if this error should trigger process exit
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Listener { .. }
                | Error::Connection { .. }
                | Error::AlreadyRunning { .. }
                | Error::Unsupported
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions (for use with color-eyre)
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::accent_store("registry status 5");
        assert_eq!(
            err.to_string(),
            "Failed to read the accent color: registry status 5"
        );

        let err = Error::Unsupported;
        assert!(err.to_string().contains("only supported on Windows"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::listener("RegisterClassW failed").is_fatal());
        assert!(Error::connection("refused").is_fatal());
        assert!(Error::already_running("/tmp/accent-sync.lock").is_fatal());
        assert!(Error::Unsupported.is_fatal());
        assert!(!Error::device_write("socket closed").is_fatal());
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::accent_store("status 5").is_recoverable());
        assert!(Error::protocol("truncated blob").is_recoverable());
        assert!(Error::device_write("socket closed").is_recoverable());
        assert!(!Error::Unsupported.is_recoverable());
        assert!(!Error::connection("refused").is_recoverable());
    }

    #[test]
    fn test_error_constructors() {
        let _ = Error::accent_store("test");
        let _ = Error::listener("test");
        let _ = Error::connection("test");
        let _ = Error::protocol("test");
        let _ = Error::device_write("test");
        let _ = Error::config("test");
        let _ = Error::channel_send("test");
    }

    #[test]
    fn test_already_running_shows_lock_path() {
        let err = Error::already_running("/data/accent-sync.lock");
        assert!(err.to_string().contains("/data/accent-sync.lock"));
        assert!(err.is_fatal());
    }
}
