//! Configuration transactions
//!
//! A transaction is one queued characteristic operation. The engine splits each
//! request into a [`Responder`] it keeps and a boxed future it drives, so a
//! disconnect can fail the caller without waiting for the platform.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use beacon_core::codec::{self, Attribute, AttributeValue};
use beacon_core::{BeaconError, BeaconResult, HardwareAddress};

use crate::beacon::BeaconSettings;
use crate::config::{ConnectionConfig, WritePolicy};
use crate::firmware::{self, FirmwareOutcome, FirmwareProgress, FirmwareSource};
use crate::platform::{PlatformConnection, PlatformResult};

pub(crate) type Reply<T> = oneshot::Sender<BeaconResult<T>>;

// ----------------------------------------------------------------------------
// Results
// ----------------------------------------------------------------------------

/// Acknowledgement of a completed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub attribute: Attribute,
    /// Whether a read-back confirmed the written value
    pub verified: bool,
}

/// Result of a submitted transaction
///
/// Resolves to [`BeaconError::ConnectionLost`] if the engine goes away before
/// answering.
#[must_use = "a transaction result does nothing unless awaited"]
pub struct Pending<T> {
    rx: oneshot::Receiver<BeaconResult<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn new(rx: oneshot::Receiver<BeaconResult<T>>) -> Self {
        Self { rx }
    }

    /// A result that is already known
    pub(crate) fn ready(result: BeaconResult<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl<T> Future for Pending<T> {
    type Output = BeaconResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(BeaconError::ConnectionLost)))
    }
}

// ----------------------------------------------------------------------------
// Transactions
// ----------------------------------------------------------------------------

/// What a transaction does, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Read(Attribute),
    Write(Attribute),
    FirmwareUpdate,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Read(attribute) => write!(f, "read {}", attribute),
            TransactionKind::Write(attribute) => write!(f, "write {}", attribute),
            TransactionKind::FirmwareUpdate => f.write_str("firmware update"),
        }
    }
}

pub(crate) enum Request {
    Read {
        attribute: Attribute,
        reply: Reply<AttributeValue>,
    },
    Write {
        value: AttributeValue,
        reply: Reply<WriteAck>,
    },
    FirmwareUpdate {
        source: Arc<dyn FirmwareSource>,
        progress: mpsc::UnboundedSender<FirmwareProgress>,
        reply: Reply<FirmwareOutcome>,
    },
}

pub(crate) struct Transaction {
    pub id: u64,
    pub request: Request,
    pub enqueued_at: tokio::time::Instant,
}

impl Transaction {
    pub fn kind(&self) -> TransactionKind {
        match &self.request {
            Request::Read { attribute, .. } => TransactionKind::Read(*attribute),
            Request::Write { value, .. } => TransactionKind::Write(value.attribute()),
            Request::FirmwareUpdate { .. } => TransactionKind::FirmwareUpdate,
        }
    }

    pub fn fail(self, error: BeaconError) {
        self.into_responder().fail(error);
    }

    fn into_responder(self) -> Responder {
        match self.request {
            Request::Read { reply, .. } => Responder::Read(reply),
            Request::Write { reply, .. } => Responder::Write(reply),
            Request::FirmwareUpdate { reply, .. } => Responder::Firmware(reply),
        }
    }

    /// Split into the caller's responder and the work to drive
    pub fn start(
        self,
        ctx: &TransactionContext,
        config: &ConnectionConfig,
    ) -> (Responder, BoxFuture<'static, Outcome>) {
        let ctx = ctx.clone();
        match self.request {
            Request::Read { attribute, reply } => (
                Responder::Read(reply),
                async move { Outcome::Read(ctx.read(attribute).await) }.boxed(),
            ),
            Request::Write { value, reply } => {
                let attribute = value.attribute();
                match config.write_policies.for_attribute(attribute) {
                    Some(policy) => (
                        Responder::Write(reply),
                        async move { Outcome::Write(ctx.write(value, policy).await) }.boxed(),
                    ),
                    None => (
                        Responder::Write(reply),
                        futures::future::ready(Outcome::Write(Err(BeaconError::unsupported(
                            attribute.name(),
                            value,
                        ))))
                        .boxed(),
                    ),
                }
            }
            Request::FirmwareUpdate {
                source,
                progress,
                reply,
            } => {
                let chunk_size = config.firmware_chunk_size;
                let download_timeout = config.download_timeout;
                (
                    Responder::Firmware(reply),
                    async move {
                        Outcome::Firmware(
                            firmware::run(&ctx, source, progress, chunk_size, download_timeout)
                                .await,
                        )
                    }
                    .boxed(),
                )
            }
        }
    }
}

pub(crate) enum Responder {
    Read(Reply<AttributeValue>),
    Write(Reply<WriteAck>),
    Firmware(Reply<FirmwareOutcome>),
}

pub(crate) enum Outcome {
    Read(BeaconResult<AttributeValue>),
    Write(BeaconResult<WriteAck>),
    Firmware(BeaconResult<FirmwareOutcome>),
}

impl Outcome {
    pub fn error(&self) -> Option<&BeaconError> {
        match self {
            Outcome::Read(result) => result.as_ref().err(),
            Outcome::Write(result) => result.as_ref().err(),
            Outcome::Firmware(result) => result.as_ref().err(),
        }
    }
}

impl Responder {
    pub fn fail(self, error: BeaconError) {
        // the caller may have stopped waiting
        match self {
            Responder::Read(reply) => {
                let _ = reply.send(Err(error));
            }
            Responder::Write(reply) => {
                let _ = reply.send(Err(error));
            }
            Responder::Firmware(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }

    pub fn complete(self, outcome: Outcome) {
        match (self, outcome) {
            (Responder::Read(reply), Outcome::Read(result)) => {
                let _ = reply.send(result);
            }
            (Responder::Write(reply), Outcome::Write(result)) => {
                let _ = reply.send(result);
            }
            (Responder::Firmware(reply), Outcome::Firmware(result)) => {
                let _ = reply.send(result);
            }
            (responder, _) => {
                warn!("Completion does not match the pending transaction");
                responder.fail(BeaconError::anomaly("mismatched transaction completion"));
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Execution
// ----------------------------------------------------------------------------

/// Everything a transaction needs to talk to one connected beacon
#[derive(Clone)]
pub(crate) struct TransactionContext {
    pub platform: Arc<dyn PlatformConnection>,
    pub address: HardwareAddress,
    pub timeout: Duration,
    pub settings: Arc<watch::Sender<BeaconSettings>>,
}

impl TransactionContext {
    /// Run one platform operation under the transaction timeout
    pub async fn step<T>(
        &self,
        operation: impl Future<Output = PlatformResult<T>>,
    ) -> BeaconResult<T> {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result.map_err(BeaconError::from),
            Err(_) => {
                warn!(
                    "Operation on {} timed out after {:?}",
                    self.address, self.timeout
                );
                Err(BeaconError::Timeout {
                    duration_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn read(&self, attribute: Attribute) -> BeaconResult<AttributeValue> {
        let payload = self
            .step(
                self.platform
                    .read_characteristic(self.address, attribute.characteristic()),
            )
            .await?;
        let value = codec::decode(attribute, &payload)?;
        debug!("Read {} = {} from {}", attribute, value, self.address);
        self.settings.send_modify(|settings| settings.apply(&value));
        Ok(value)
    }

    pub async fn write(&self, value: AttributeValue, policy: WritePolicy) -> BeaconResult<WriteAck> {
        let attribute = value.attribute();
        let payload = codec::encode(&value)?;
        self.step(self.platform.write_characteristic(
            self.address,
            attribute.characteristic(),
            &payload,
        ))
        .await?;

        if policy == WritePolicy::FireAndForget {
            debug!("Wrote {} = {} to {} unverified", attribute, value, self.address);
            return Ok(WriteAck {
                attribute,
                verified: false,
            });
        }

        let echoed = self
            .step(
                self.platform
                    .read_characteristic(self.address, attribute.characteristic()),
            )
            .await?;
        let readback = codec::decode(attribute, &echoed)?;
        if readback != value {
            return Err(BeaconError::VerificationMismatch {
                context: attribute.name().to_string(),
                expected: value.to_string(),
                actual: readback.to_string(),
            });
        }

        debug!("Wrote {} = {} to {} verified", attribute, value, self.address);
        self.settings.send_modify(|settings| settings.apply(&value));
        Ok(WriteAck {
            attribute,
            verified: true,
        })
    }
}
