//! # accentsync-core - Core Domain Types
//!
//! Foundation crate for accent-sync. Provides the color value type, the error
//! taxonomy, and the logging bootstrap shared by every other crate in the
//! workspace.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (thiserror, tracing, dirs).
//!
//! ## Public API
//!
//! ### Colors (`color`)
//! - [`Color`] - An RGB triple with structural equality
//! - [`Color::from_accent_dword()`] - Decode the Windows accent-color DWORD
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Logging (`logging`)
//! - [`logging::init()`] - File logging under the local data directory,
//!   filtered by the `ACCENTSYNC_LOG` environment variable
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use accentsync_core::prelude::*;
//! ```

pub mod color;
pub mod error;
pub mod logging;

/// Prelude for common imports used throughout all accent-sync crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use color::Color;
pub use error::{Error, Result, ResultExt};
