//! Virtual beacon advertising backends and platform selection

pub mod fallback;
#[cfg(target_os = "linux")]
pub mod linux;

use crate::platform::PlatformAdvertiser;

/// Advertiser for the current platform
///
/// BlueZ is used on Linux; other platforms get an advertiser that reports
/// advertising as unsupported.
pub fn default_advertiser() -> Box<dyn PlatformAdvertiser> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            Box::new(linux::LinuxAdvertiser::new())
        } else {
            Box::new(fallback::FallbackAdvertiser::new())
        }
    }
}
