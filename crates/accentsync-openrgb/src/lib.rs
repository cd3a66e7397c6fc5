//! # accentsync-openrgb - OpenRGB SDK Client
//!
//! Async TCP client for the OpenRGB SDK server: packet framing, controller
//! data parsing, and a background task that owns the connection and
//! reconnects with exponential backoff.
//!
//! ## Public API
//!
//! ### Client
//! - [`OpenRgbClient`] - connect, enumerate, and paint controllers
//! - [`ClientHandle`] - clonable handle sharing one connection
//! - [`ClientOptions`] - name, timeout, and reconnection settings
//! - [`ClientEvent`] - unsolicited happenings (device list changes,
//!   reconnection progress)
//! - [`ConnectionState`] - where the connection currently stands
//! - [`Device`] - cached summary of one controller
//!
//! ### Protocol
//! - [`protocol`] - wire framing, request builders, and the controller
//!   data blob parser

pub mod client;
pub mod protocol;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use client::{
    ClientEvent, ClientHandle, ClientOptions, ConnectionState, Device, OpenRgbClient,
    DEFAULT_REQUEST_TIMEOUT, STATIC_MODE_NAMES,
};
pub use protocol::{Controller, Led, Mode, Zone, CLIENT_PROTOCOL_VERSION};
