//! # accentsync-app - Daemon Orchestration
//!
//! Everything between the OS and the hub: the accent color source, the
//! setting-change listener, the propagator with its idempotence guard, the
//! sync engine that serializes cycles, and the runner that wires it all up.
//!
//! ## Public API
//!
//! ### Sync pipeline
//! - [`AccentSource`] - where the OS accent color is read from
//! - [`ThemeSignal`] / [`SettingChangeListener`] - change notifications
//! - [`ColorPropagator`] / [`DeviceControl`] - dedup and fan-out of writes
//! - [`SyncEngine`] - the single consumer task driving cycles
//!
//! ### Process plumbing
//! - [`Settings`] - TOML config with `[connection]` and `[sync]` sections
//! - [`InstanceLock`] - single-instance file lock
//! - [`runner`] - `run` / `run_once` / `list_devices` entry points

pub mod accent;
pub mod config;
pub mod engine;
pub mod instance;
pub mod listener;
pub mod propagator;
pub mod runner;

pub use accent::AccentSource;
#[cfg(windows)]
pub use accent::DwmAccentStore;
pub use config::{ConnectionConfig, Settings, SyncConfig};
pub use engine::SyncEngine;
pub use instance::InstanceLock;
pub use listener::{is_accent_setting, SettingChangeListener, ThemeSignal};
pub use propagator::{ColorPropagator, DeviceControl};
