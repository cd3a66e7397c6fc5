//! Accent color retrieval.
//!
//! [`AccentSource`] is the seam between the sync engine and the OS theme
//! store. The Windows implementation reads the DWM registry value; tests
//! substitute scripted sources.

use accentsync_core::prelude::*;
use accentsync_core::Color;

/// Where the current accent color comes from.
///
/// `Ok(None)` means the setting is absent, which is normal (a fresh profile,
/// or a high-contrast theme). Errors are reserved for the store being
/// unreadable.
pub trait AccentSource: Send {
    fn read(&self) -> Result<Option<Color>>;
}

#[cfg(windows)]
pub use win32::DwmAccentStore;

#[cfg(windows)]
mod win32 {
    use super::*;

    use windows::core::w;
    use windows::Win32::Foundation::ERROR_FILE_NOT_FOUND;
    use windows::Win32::System::Registry::{RegGetValueW, HKEY_CURRENT_USER, RRF_RT_REG_DWORD};

    /// Reads the accent color from the DWM registry value
    /// `HKEY_CURRENT_USER\Software\Microsoft\Windows\DWM\AccentColor`,
    /// a DWORD laid out `0xAABBGGRR`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct DwmAccentStore;

    impl AccentSource for DwmAccentStore {
        fn read(&self) -> Result<Option<Color>> {
            let mut raw: u32 = 0;
            let mut size = std::mem::size_of::<u32>() as u32;

            let status = unsafe {
                RegGetValueW(
                    HKEY_CURRENT_USER,
                    w!(r"Software\Microsoft\Windows\DWM"),
                    w!("AccentColor"),
                    RRF_RT_REG_DWORD,
                    None,
                    Some(&mut raw as *mut u32 as *mut _),
                    Some(&mut size),
                )
            };

            if status == ERROR_FILE_NOT_FOUND {
                debug!("AccentColor value not present");
                return Ok(None);
            }
            if status.is_err() {
                return Err(Error::accent_store(format!(
                    "RegGetValueW returned status {}",
                    status.0
                )));
            }

            Ok(Some(Color::from_accent_dword(raw)))
        }
    }
}
