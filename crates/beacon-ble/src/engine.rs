//! Connection transaction engine
//!
//! One engine task per beacon. It owns the connection state, the FIFO transaction
//! queue and the single in-flight transaction, and is the only place that talks to
//! the platform connection for its beacon.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use beacon_core::{BeaconError, BeaconResult, FirmwareUpdateError};

use crate::beacon::ConnectionState;
use crate::config::ConnectionConfig;
use crate::error::{connection_error, PlatformError};
use crate::events::ConnectionEvent;
use crate::platform::LinkEvent;
use crate::transaction::{
    Outcome, Request, Responder, Transaction, TransactionContext, TransactionKind,
};

pub(crate) enum EngineCommand {
    Connect {
        reply: oneshot::Sender<BeaconResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<BeaconResult<()>>,
    },
    Submit(Request),
}

type LinkStream = BoxStream<'static, LinkEvent>;

struct InFlight {
    id: u64,
    kind: TransactionKind,
    responder: Responder,
    future: BoxFuture<'static, Outcome>,
}

pub(crate) struct ConnectionEngine {
    ctx: TransactionContext,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    queue: VecDeque<Transaction>,
    in_flight: Option<InFlight>,
    connecting: Option<BoxFuture<'static, BeaconResult<LinkStream>>>,
    connect_waiters: Vec<oneshot::Sender<BeaconResult<()>>>,
    link: Option<LinkStream>,
    /// A firmware update is queued or running
    firmware_pending: bool,
    pending: Arc<AtomicUsize>,
    next_id: u64,
}

impl ConnectionEngine {
    pub fn new(
        ctx: TransactionContext,
        config: ConnectionConfig,
        state: watch::Sender<ConnectionState>,
        events: broadcast::Sender<ConnectionEvent>,
        pending: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            ctx,
            config,
            state,
            events,
            queue: VecDeque::new(),
            in_flight: None,
            connecting: None,
            connect_waiters: Vec::new(),
            link: None,
            firmware_pending: false,
            pending,
            next_id: 0,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        debug!("Connection engine for {} started", self.ctx.address);

        loop {
            self.dispatch_next();

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }

                outcome = next_outcome(&mut self.in_flight) => {
                    self.complete(outcome);
                }

                result = next_connect_result(&mut self.connecting) => {
                    self.connecting = None;
                    self.finish_connect(result);
                }

                event = next_link_event(&mut self.link) => {
                    let error = match event {
                        Some(LinkEvent::Disconnected { error }) => error,
                        None => None,
                    };
                    self.on_link_lost(error);
                }
            }
        }

        debug!("All handles for {} dropped, tearing down", self.ctx.address);
        if self.current_state() != ConnectionState::Disconnected {
            if let Err(e) = self.close_link().await {
                warn!("Failed to disconnect {}: {}", self.ctx.address, e);
            }
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn publish(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Connect { reply } => self.connect(reply),
            EngineCommand::Disconnect { reply } => {
                let result = match self.current_state() {
                    ConnectionState::Disconnected => Ok(()),
                    _ => {
                        let result = self.close_link().await;
                        self.publish(ConnectionEvent::Disconnected(None));
                        result
                    }
                };
                let _ = reply.send(result);
            }
            EngineCommand::Submit(request) => self.submit(request),
        }
    }

    fn connect(&mut self, reply: oneshot::Sender<BeaconResult<()>>) {
        match self.current_state() {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => self.connect_waiters.push(reply),
            ConnectionState::Disconnected => {
                info!("Connecting to beacon {}", self.ctx.address);
                self.set_state(ConnectionState::Connecting);
                self.connect_waiters.push(reply);

                let platform = self.ctx.platform.clone();
                let address = self.ctx.address;
                let limit = self.config.connection_timeout;
                self.connecting = Some(
                    async move {
                        let establish = async {
                            // subscribe before connecting so an early drop is not missed
                            let link = platform.link_events(address).await?;
                            platform.connect(address).await?;
                            Ok::<_, PlatformError>(link)
                        };
                        match tokio::time::timeout(limit, establish).await {
                            Ok(result) => result.map_err(connection_error),
                            Err(_) => Err(BeaconError::Timeout {
                                duration_ms: limit.as_millis() as u64,
                            }),
                        }
                    }
                    .boxed(),
                );
            }
        }
    }

    fn finish_connect(&mut self, result: BeaconResult<LinkStream>) {
        // the peripheral may drop the link before the connect call returns
        let result = result.and_then(|mut link| match link.next().now_or_never() {
            Some(Some(LinkEvent::Disconnected { error })) => {
                warn!(
                    "Link to {} dropped while connecting: {:?}",
                    self.ctx.address, error
                );
                Err(BeaconError::ConnectionLost)
            }
            Some(None) => Err(BeaconError::ConnectionLost),
            None => Ok(link),
        });

        let outcome = match result {
            Ok(link) => {
                info!("Connected to beacon {}", self.ctx.address);
                self.link = Some(link);
                self.set_state(ConnectionState::Connected);
                self.publish(ConnectionEvent::Connected);
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", self.ctx.address, e);
                self.set_state(ConnectionState::Disconnected);
                self.publish(ConnectionEvent::ConnectionFailed(e.clone()));
                Err(e)
            }
        };
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn submit(&mut self, request: Request) {
        let transaction = Transaction {
            id: self.next_id,
            request,
            enqueued_at: tokio::time::Instant::now(),
        };
        self.next_id += 1;

        if self.current_state() != ConnectionState::Connected {
            debug!("Rejecting {} on {}: not connected", transaction.kind(), self.ctx.address);
            transaction.fail(BeaconError::NotConnected);
            return;
        }

        if transaction.kind() == TransactionKind::FirmwareUpdate {
            if self.firmware_pending {
                transaction.fail(FirmwareUpdateError::AlreadyInProgress.into());
                return;
            }
            self.firmware_pending = true;
        }

        debug!(
            "Queued transaction #{} ({}) for {}, {} ahead",
            transaction.id,
            transaction.kind(),
            self.ctx.address,
            self.queue.len() + usize::from(self.in_flight.is_some())
        );
        self.queue.push_back(transaction);
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Start the next queued transaction if nothing is in flight
    fn dispatch_next(&mut self) {
        if self.in_flight.is_some() || self.current_state() != ConnectionState::Connected {
            return;
        }
        let Some(transaction) = self.queue.pop_front() else {
            return;
        };

        let id = transaction.id;
        let kind = transaction.kind();
        debug!(
            "Dispatching transaction #{} ({}) on {} after {:?} queued",
            id,
            kind,
            self.ctx.address,
            transaction.enqueued_at.elapsed()
        );
        let (responder, future) = transaction.start(&self.ctx, &self.config);
        self.in_flight = Some(InFlight {
            id,
            kind,
            responder,
            future,
        });
    }

    fn complete(&mut self, outcome: Outcome) {
        let Some(in_flight) = self.in_flight.take() else {
            warn!("Completion on {} with no pending transaction", self.ctx.address);
            return;
        };

        match outcome.error() {
            Some(e) => debug!(
                "Transaction #{} ({}) on {} failed: {}",
                in_flight.id, in_flight.kind, self.ctx.address, e
            ),
            None => debug!(
                "Transaction #{} ({}) on {} completed",
                in_flight.id, in_flight.kind, self.ctx.address
            ),
        }

        if in_flight.kind == TransactionKind::FirmwareUpdate {
            self.firmware_pending = false;
        }
        in_flight.responder.complete(outcome);
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Disconnection
    // ------------------------------------------------------------------------

    fn on_link_lost(&mut self, error: Option<PlatformError>) {
        match &error {
            Some(e) => warn!("Beacon {} disconnected: {}", self.ctx.address, e),
            None => info!("Beacon {} disconnected", self.ctx.address),
        }
        self.link = None;
        self.fail_all();
        self.set_state(ConnectionState::Disconnected);
        let reason = error.map(BeaconError::from).unwrap_or(BeaconError::ConnectionLost);
        self.publish(ConnectionEvent::Disconnected(Some(reason)));
    }

    /// Tear down a requested disconnect
    async fn close_link(&mut self) -> BeaconResult<()> {
        info!("Disconnecting from beacon {}", self.ctx.address);
        self.connecting = None;
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(BeaconError::ConnectionLost));
        }
        self.link = None;
        self.fail_all();
        self.set_state(ConnectionState::Disconnected);

        self.ctx
            .step(self.ctx.platform.disconnect(self.ctx.address))
            .await
    }

    /// Fail the in-flight and every queued transaction with `ConnectionLost`
    fn fail_all(&mut self) {
        let mut failed = 0;
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.responder.fail(BeaconError::ConnectionLost);
            failed += 1;
        }
        for transaction in self.queue.drain(..) {
            transaction.fail(BeaconError::ConnectionLost);
            failed += 1;
        }
        if failed > 0 {
            warn!(
                "Failed {} pending transaction(s) on {}: connection lost",
                failed, self.ctx.address
            );
        }
        self.firmware_pending = false;
        self.pending.store(0, Ordering::SeqCst);
    }
}

async fn next_outcome(in_flight: &mut Option<InFlight>) -> Outcome {
    match in_flight {
        Some(in_flight) => (&mut in_flight.future).await,
        None => future::pending().await,
    }
}

async fn next_connect_result(
    connecting: &mut Option<BoxFuture<'static, BeaconResult<LinkStream>>>,
) -> BeaconResult<LinkStream> {
    match connecting {
        Some(connecting) => connecting.await,
        None => future::pending().await,
    }
}

async fn next_link_event(link: &mut Option<LinkStream>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.next().await,
        None => future::pending().await,
    }
}
