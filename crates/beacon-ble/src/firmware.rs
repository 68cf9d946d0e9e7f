//! Firmware update
//!
//! A firmware update runs as one exclusive transaction on the connection queue.
//! Progress is reported on its own channel; the completion carries the single
//! terminal result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info};

use beacon_core::codec::{Attribute, AttributeValue, FIRMWARE_TRANSFER_CHARACTERISTIC_UUID};
use beacon_core::{BeaconError, BeaconResult, FirmwareUpdateError};

use crate::transaction::{Pending, TransactionContext};

// ----------------------------------------------------------------------------
// Firmware Source
// ----------------------------------------------------------------------------

/// A firmware image available for a hardware revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRelease {
    pub version: String,
    /// SHA-256 digest of the image
    pub sha256: [u8; 32],
}

/// Where firmware images come from
#[async_trait]
pub trait FirmwareSource: Send + Sync {
    /// Newest release for the hardware, or `None` when `firmware_version` is current
    async fn check_for_update(
        &self,
        hardware_version: &str,
        firmware_version: &str,
    ) -> Result<Option<FirmwareRelease>, FirmwareUpdateError>;

    async fn fetch(&self, release: &FirmwareRelease) -> Result<Vec<u8>, FirmwareUpdateError>;
}

// ----------------------------------------------------------------------------
// Progress and Outcome
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareStage {
    ReadingVersion,
    CheckingForUpdate,
    Downloading,
    Verifying,
    Transferring,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareProgress {
    pub stage: FirmwareStage,
    /// Overall completion, 0 to 100
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareOutcome {
    UpToDate { firmware_version: String },
    Updated { previous: String, version: String },
}

/// Firmware status of a beacon as last determined by an update check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FirmwareState {
    #[default]
    Unknown,
    UpToDate,
    UpdateAvailable,
}

/// A firmware update in progress
pub struct FirmwareUpdate {
    /// Stage reports; closes when the update ends
    pub progress: mpsc::UnboundedReceiver<FirmwareProgress>,
    /// Terminal result, delivered once
    pub completion: Pending<FirmwareOutcome>,
}

// ----------------------------------------------------------------------------
// Update Flow
// ----------------------------------------------------------------------------

pub(crate) async fn run(
    ctx: &TransactionContext,
    source: Arc<dyn FirmwareSource>,
    progress: mpsc::UnboundedSender<FirmwareProgress>,
    chunk_size: usize,
    download_timeout: Duration,
) -> BeaconResult<FirmwareOutcome> {
    let report = |stage: FirmwareStage, percent: u8| {
        debug!("Firmware update on {}: {:?} {}%", ctx.address, stage, percent);
        let _ = progress.send(FirmwareProgress { stage, percent });
    };

    report(FirmwareStage::ReadingVersion, 0);
    let hardware_version = read_version(ctx, Attribute::HardwareVersion).await?;
    let firmware_version = read_version(ctx, Attribute::FirmwareVersion).await?;

    report(FirmwareStage::CheckingForUpdate, 0);
    let release = bounded(
        download_timeout,
        source.check_for_update(&hardware_version, &firmware_version),
    )
    .await?;
    let Some(release) = release else {
        info!(
            "Beacon {} firmware {} is up to date",
            ctx.address, firmware_version
        );
        ctx.settings
            .send_modify(|settings| settings.firmware_state = FirmwareState::UpToDate);
        report(FirmwareStage::Completed, 100);
        return Ok(FirmwareOutcome::UpToDate { firmware_version });
    };

    ctx.settings
        .send_modify(|settings| settings.firmware_state = FirmwareState::UpdateAvailable);
    info!(
        "Updating beacon {} firmware {} -> {}",
        ctx.address, firmware_version, release.version
    );

    report(FirmwareStage::Downloading, 0);
    let image = bounded(download_timeout, source.fetch(&release)).await?;

    report(FirmwareStage::Verifying, 0);
    // an empty image would "transfer" without writing anything
    if image.is_empty() {
        return Err(FirmwareUpdateError::Verification {
            expected: hex::encode(release.sha256),
            actual: "empty image".to_string(),
        }
        .into());
    }
    let digest: [u8; 32] = Sha256::digest(&image).into();
    if digest != release.sha256 {
        return Err(FirmwareUpdateError::Verification {
            expected: hex::encode(release.sha256),
            actual: hex::encode(digest),
        }
        .into());
    }

    report(FirmwareStage::Transferring, 0);
    let chunks = image.len().div_ceil(chunk_size.max(1));
    for (index, chunk) in image.chunks(chunk_size.max(1)).enumerate() {
        ctx.step(ctx.platform.write_characteristic(
            ctx.address,
            FIRMWARE_TRANSFER_CHARACTERISTIC_UUID,
            chunk,
        ))
        .await
        .map_err(|e| match e {
            e if e.is_connection_loss() => e,
            e => FirmwareUpdateError::Write {
                reason: e.to_string(),
            }
            .into(),
        })?;
        report(
            FirmwareStage::Transferring,
            ((index + 1) * 100 / chunks) as u8,
        );
    }

    let version = release.version;
    ctx.settings.send_modify(|settings| {
        settings.firmware_version = Some(version.clone());
        settings.firmware_state = FirmwareState::UpToDate;
    });
    report(FirmwareStage::Completed, 100);
    info!("Beacon {} firmware updated to {}", ctx.address, version);

    Ok(FirmwareOutcome::Updated {
        previous: firmware_version,
        version,
    })
}

async fn read_version(ctx: &TransactionContext, attribute: Attribute) -> BeaconResult<String> {
    match ctx.read(attribute).await {
        Ok(AttributeValue::HardwareVersion(version))
        | Ok(AttributeValue::FirmwareVersion(version)) => Ok(version),
        Ok(other) => Err(BeaconError::anomaly(format!(
            "{} read returned {:?}",
            attribute, other
        ))),
        Err(e) if e.is_connection_loss() => Err(e),
        Err(e) => Err(FirmwareUpdateError::VersionCheck {
            reason: e.to_string(),
        }
        .into()),
    }
}

/// Bound a firmware source request; expiry counts as a network failure
async fn bounded<T>(
    limit: Duration,
    request: impl Future<Output = Result<T, FirmwareUpdateError>>,
) -> BeaconResult<T> {
    match tokio::time::timeout(limit, request).await {
        Ok(result) => result.map_err(BeaconError::from),
        Err(_) => Err(FirmwareUpdateError::Network {
            reason: format!("no response within {:?}", limit),
        }
        .into()),
    }
}

