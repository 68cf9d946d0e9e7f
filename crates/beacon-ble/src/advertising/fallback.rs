//! Advertiser for platforms without a broadcasting backend

use async_trait::async_trait;
use tracing::warn;

use beacon_core::{TxPower, VirtualBeacon};

use crate::error::PlatformError;
use crate::platform::{PlatformAdvertiser, PlatformResult};

#[derive(Debug, Default)]
pub struct FallbackAdvertiser;

impl FallbackAdvertiser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PlatformAdvertiser for FallbackAdvertiser {
    async fn start_advertising(
        &mut self,
        beacon: &VirtualBeacon,
        _tx_power: TxPower,
    ) -> PlatformResult<()> {
        warn!(
            "Beacon advertising not supported on this platform; '{}' will not be broadcast",
            beacon.identifier
        );
        Err(PlatformError::Unsupported(
            "beacon advertising".to_string(),
        ))
    }

    async fn stop_advertising(&mut self) -> PlatformResult<()> {
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_reports_unsupported() {
        let mut advertiser = FallbackAdvertiser::new();
        let result = advertiser
            .start_advertising(&VirtualBeacon::new("me", 1, 2), TxPower::Zero)
            .await;
        assert!(matches!(result, Err(PlatformError::Unsupported(_))));
        assert!(!advertiser.is_advertising());
        assert!(advertiser.stop_advertising().await.is_ok());
    }
}
