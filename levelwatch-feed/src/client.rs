use crate::{
    BrokerCredentials,
    backoff::{ReconnectionBackoffPolicy, ReconnectionState},
    codec::{BrokerRequest, BrokerResponse, decode_frame},
    error::FeedError,
    ledger::{Ledger, TickTx},
    metrics::{FeedMetrics, FeedMetricsSnapshot},
};
use async_trait::async_trait;
use fnv::FnvHashSet;
use futures::{Sink, SinkExt, Stream, StreamExt};
use levelwatch_instrument::instrument::MarketId;
use levelwatch_integration::{
    error::SocketError,
    protocol::websocket::{self, WsError, WsMessage},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt::Debug,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, timeout},
};
use tracing::{debug, info, warn};
use url::Url;

/// Operator-facing feed client configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Liveness cut for the broker socket.
    pub read_deadline: Duration,
    /// Reconnect curve between failed connection attempts.
    pub backoff: ReconnectionBackoffPolicy,
    /// Coalescing window for subscription deltas.
    pub batch_window: Duration,
    /// How long the connection lingers once the ledger is empty.
    pub empty_linger: Duration,
    /// Consecutive frame decode failures tolerated before reconnecting.
    pub decode_error_threshold: u32,
    /// Deadline for the broker's authenticated-ack.
    pub auth_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            read_deadline: Duration::from_secs(40),
            backoff: ReconnectionBackoffPolicy::default(),
            batch_window: Duration::from_millis(100),
            empty_linger: Duration::from_secs(30),
            decode_error_threshold: 5,
            auth_timeout: Duration::from_secs(10),
        }
    }
}

/// Upstream connection lifecycle, observable through [`FeedHandle::state`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Live,
    Draining,
}

/// Duplex message transport to the broker.
pub trait BrokerTransport:
    Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Send + Unpin
{
}

impl<T> BrokerTransport for T where
    T: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Send + Unpin
{
}

/// Establishes transports to the broker's streaming endpoint.
///
/// The production implementation dials a websocket; tests inject an in-memory
/// duplex transport.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Transport: BrokerTransport;

    async fn connect(&self) -> Result<Self::Transport, SocketError>;
}

/// [`BrokerConnector`] dialling the broker's websocket streaming endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    pub url: Url,
}

#[async_trait]
impl BrokerConnector for WebSocketConnector {
    type Transport = websocket::WebSocket;

    async fn connect(&self) -> Result<Self::Transport, SocketError> {
        websocket::connect(self.url.clone()).await
    }
}

/// Cloneable handle through which sessions drive the feed client.
///
/// All methods are non-blocking: they mutate the shared ledger / delta buffer
/// under a short-lived mutex and nudge the supervisor task.
#[derive(Debug)]
pub struct FeedHandle<Id> {
    shared: Arc<Shared<Id>>,
}

impl<Id> Clone for FeedHandle<Id> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[derive(Debug)]
struct Shared<Id> {
    config: FeedConfig,
    ledger: Mutex<Ledger<Id>>,
    pending: Mutex<DeltaBuffer>,
    credentials: Mutex<VecDeque<BrokerCredentials>>,
    metrics: FeedMetrics,
    wake: Notify,
    shutdown: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
}

/// Coalescing buffer for subscription deltas awaiting the batch window.
///
/// A subscribe followed by an unsubscribe for the same market (or vice versa)
/// inside one window cancels out instead of reaching the broker.
#[derive(Debug, Default)]
struct DeltaBuffer {
    subscribe: FnvHashSet<MarketId>,
    unsubscribe: FnvHashSet<MarketId>,
}

impl DeltaBuffer {
    fn add_subscribe(&mut self, markets: impl IntoIterator<Item = MarketId>) {
        for market in markets {
            if !self.unsubscribe.remove(&market) {
                self.subscribe.insert(market);
            }
        }
    }

    fn add_unsubscribe(&mut self, markets: impl IntoIterator<Item = MarketId>) {
        for market in markets {
            if !self.subscribe.remove(&market) {
                self.unsubscribe.insert(market);
            }
        }
    }

    fn drain(&mut self) -> Option<(Vec<MarketId>, Vec<MarketId>)> {
        if self.subscribe.is_empty() && self.unsubscribe.is_empty() {
            return None;
        }
        Some((
            self.subscribe.drain().collect(),
            self.unsubscribe.drain().collect(),
        ))
    }

    fn clear(&mut self) {
        self.subscribe.clear();
        self.unsubscribe.clear();
    }
}

impl<Id> FeedHandle<Id>
where
    Id: Copy + Eq + Hash + Debug + Send + 'static,
{
    /// Register a session and the mailbox its ticks are delivered into.
    pub fn register(&self, id: Id, mailbox: TickTx) {
        self.shared.ledger.lock().register(id, mailbox);
    }

    /// Remove a session and release any markets it alone kept live.
    pub fn deregister(&self, id: Id) {
        let removed = self.shared.ledger.lock().deregister(id);
        if !removed.is_empty() {
            self.shared.pending.lock().add_unsubscribe(removed);
        }
        self.shared.wake.notify_one();
    }

    /// Subscribe `id` to `markets`, emitting an upstream delta if the effective
    /// set grew.
    pub fn subscribe(&self, id: Id, markets: &[MarketId]) {
        let added = self.shared.ledger.lock().subscribe(id, markets);
        if !added.is_empty() {
            self.shared.pending.lock().add_subscribe(added);
        }
        self.shared.wake.notify_one();
    }

    /// Unsubscribe `id` from `markets`, emitting an upstream delta if the
    /// effective set shrank.
    pub fn unsubscribe(&self, id: Id, markets: &[MarketId]) {
        let removed = self.shared.ledger.lock().unsubscribe(id, markets);
        if !removed.is_empty() {
            self.shared.pending.lock().add_unsubscribe(removed);
        }
        self.shared.wake.notify_one();
    }

    /// Delegate broker credentials from a freshly logged-in session.
    pub fn add_credentials(&self, credentials: BrokerCredentials) {
        let mut pool = self.shared.credentials.lock();
        if !pool.contains(&credentials) {
            pool.push_back(credentials);
        }
        drop(pool);
        self.shared.wake.notify_one();
    }

    pub fn metrics(&self) -> FeedMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether `id` currently appears in the ledger under `market`.
    pub fn is_subscribed(&self, id: Id, market: MarketId) -> bool {
        self.shared.ledger.lock().is_subscribed(id, market)
    }

    /// Signal the supervisor to drain and stop.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

/// Outcome of one `LIVE` stint on the connection.
enum LiveExit {
    /// Ledger stayed empty past the linger window, or shutdown was requested.
    Drained,
    Shutdown,
    Failed(FeedError),
}

/// Supervisor owning the single upstream broker connection.
#[derive(Debug)]
pub struct FeedClient<Id, Connector> {
    shared: Arc<Shared<Id>>,
    connector: Connector,
}

impl<Id, Connector> FeedClient<Id, Connector>
where
    Id: Copy + Eq + Hash + Debug + Send + Sync + 'static,
    Connector: BrokerConnector,
{
    /// Spawn the supervisor task, returning the handle sessions drive it with.
    pub fn spawn(config: FeedConfig, connector: Connector) -> (FeedHandle<Id>, JoinHandle<()>) {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            config,
            ledger: Mutex::new(Ledger::default()),
            pending: Mutex::new(DeltaBuffer::default()),
            credentials: Mutex::new(VecDeque::new()),
            metrics: FeedMetrics::default(),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            state_tx,
        });

        let handle = FeedHandle {
            shared: Arc::clone(&shared),
        };
        let client = FeedClient { shared, connector };
        let task = tokio::spawn(client.run());

        (handle, task)
    }

    async fn run(self) {
        let mut reconnection = ReconnectionState::from(self.shared.config.backoff);

        loop {
            if self.shutdown_requested() {
                break;
            }

            if self.shared.ledger.lock().is_empty() {
                self.set_state(ConnectionState::Disconnected);
                self.shared.wake.notified().await;
                continue;
            }

            self.set_state(ConnectionState::Connecting);
            let mut transport = match self.connector.connect().await {
                Ok(transport) => transport,
                Err(error) => {
                    let sleep = reconnection.next_backoff();
                    warn!(%error, ?sleep, "failed to connect upstream feed");
                    tokio::time::sleep(sleep).await;
                    continue;
                }
            };

            self.set_state(ConnectionState::Authenticating);
            if let Err(error) = self.authenticate(&mut transport).await {
                let sleep = reconnection.next_backoff();
                warn!(%error, ?sleep, "upstream feed authentication failed");
                tokio::time::sleep(sleep).await;
                continue;
            }

            reconnection.reset_backoff();
            let generation = self.shared.metrics.next_generation();
            self.set_state(ConnectionState::Live);

            // Full resubscribe supersedes any deltas buffered while offline
            self.shared.pending.lock().clear();
            let effective = self.shared.ledger.lock().effective();
            info!(generation, markets = effective.len(), "upstream feed live");
            if !effective.is_empty()
                && let Err(error) = send_request(&mut transport, &BrokerRequest::subscribe(effective)).await
            {
                warn!(%error, "failed to resubscribe ledger after reconnect");
                continue;
            }

            match self.run_live(&mut transport).await {
                LiveExit::Shutdown => {
                    self.drain(&mut transport).await;
                    break;
                }
                LiveExit::Drained => {
                    self.drain(&mut transport).await;
                }
                LiveExit::Failed(error) => {
                    let sleep = reconnection.next_backoff();
                    warn!(%error, ?sleep, "upstream feed connection lost");
                    tokio::time::sleep(sleep).await;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("upstream feed client stopped");
    }

    async fn authenticate(
        &self,
        transport: &mut Connector::Transport,
    ) -> Result<(), FeedError> {
        let attempts = self.shared.credentials.lock().len();
        if attempts == 0 {
            return Err(FeedError::CredentialsUnavailable);
        }

        let mut last_reason = String::new();
        for _ in 0..attempts {
            let Some(credentials) = self.shared.credentials.lock().front().cloned() else {
                return Err(FeedError::CredentialsUnavailable);
            };

            send_request(transport, &BrokerRequest::auth(&credentials)).await?;

            match timeout(self.shared.config.auth_timeout, read_auth_ack(transport)).await {
                Err(_elapsed) => return Err(FeedError::ReadDeadline),
                Ok(Err(error)) => return Err(error),
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(reason))) => {
                    warn!(%reason, "broker rejected credentials, rotating pool");
                    last_reason = reason;
                    let mut pool = self.shared.credentials.lock();
                    if let Some(rejected) = pool.pop_front() {
                        pool.push_back(rejected);
                    }
                }
            }
        }

        Err(FeedError::AuthRejected(last_reason))
    }

    async fn run_live(&self, transport: &mut Connector::Transport) -> LiveExit {
        let config = &self.shared.config;
        let mut batch = tokio::time::interval(config.batch_window);
        batch.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut decode_error_run = 0u32;
        let mut empty_since: Option<Instant> = None;

        loop {
            tokio::select! {
                frame = timeout(config.read_deadline, transport.next()) => {
                    match frame {
                        Err(_elapsed) => return LiveExit::Failed(FeedError::ReadDeadline),
                        Ok(None) => return LiveExit::Failed(FeedError::TransportClosed),
                        Ok(Some(Err(error))) => {
                            return LiveExit::Failed(FeedError::Socket(SocketError::WebSocket(
                                Box::new(error),
                            )));
                        }
                        Ok(Some(Ok(message))) => {
                            if let Err(exit) = self.process_message(message, &mut decode_error_run) {
                                return exit;
                            }
                        }
                    }
                }
                _ = batch.tick() => {
                    // Take the buffered delta before awaiting anything
                    let drained = self.shared.pending.lock().drain();
                    if let Some((subscribe, unsubscribe)) = drained {
                        if !subscribe.is_empty()
                            && let Err(error) = send_request(transport, &BrokerRequest::subscribe(subscribe)).await
                        {
                            return LiveExit::Failed(error);
                        }
                        if !unsubscribe.is_empty()
                            && let Err(error) = send_request(transport, &BrokerRequest::unsubscribe(unsubscribe)).await
                        {
                            return LiveExit::Failed(error);
                        }
                    }

                    if self.shared.ledger.lock().is_empty() {
                        let since = empty_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= config.empty_linger {
                            return LiveExit::Drained;
                        }
                    } else {
                        empty_since = None;
                    }
                }
                _ = self.shared.wake.notified() => {
                    if self.shutdown_requested() {
                        return LiveExit::Shutdown;
                    }
                }
            }
        }
    }

    /// Handle one inbound frame while `LIVE`. Returns the exit reason if the
    /// frame tears the connection down.
    fn process_message(
        &self,
        message: WsMessage,
        decode_error_run: &mut u32,
    ) -> Result<(), LiveExit> {
        match message {
            WsMessage::Binary(payload) => {
                self.shared.metrics.frame_received();
                match decode_frame(&payload) {
                    Ok(ticks) => {
                        *decode_error_run = 0;
                        self.shared.metrics.ticks_decoded(ticks.len() as u64);
                        let ledger = self.shared.ledger.lock();
                        for tick in ticks {
                            ledger.dispatch(tick);
                        }
                    }
                    Err(error) => {
                        self.shared.metrics.decode_error();
                        *decode_error_run += 1;
                        warn!(%error, run = *decode_error_run, "dropped undecodable frame");
                        if *decode_error_run >= self.shared.config.decode_error_threshold {
                            return Err(LiveExit::Failed(FeedError::DecodeErrorRun(
                                *decode_error_run,
                            )));
                        }
                    }
                }
            }
            WsMessage::Text(payload) => match serde_json::from_str::<BrokerResponse>(&payload) {
                Ok(BrokerResponse::Error { reason }) => {
                    warn!(%reason, "broker reported an error")
                }
                Ok(BrokerResponse::AuthAck { .. }) => {
                    debug!("ignoring duplicate auth ack")
                }
                Err(error) => debug!(%error, %payload, "unrecognised broker text frame"),
            },
            WsMessage::Close(frame) => {
                return Err(LiveExit::Failed(FeedError::Socket(SocketError::Terminated(
                    format!("{frame:?}"),
                ))));
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
        Ok(())
    }

    async fn drain(&self, transport: &mut Connector::Transport) {
        self.set_state(ConnectionState::Draining);
        info!("draining upstream feed connection");
        let _ = transport.send(WsMessage::Close(None)).await;
        let _ = transport.close().await;
    }

    fn shutdown_requested(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.state_tx.send_replace(state);
    }
}

async fn send_request<T>(transport: &mut T, request: &BrokerRequest) -> Result<(), FeedError>
where
    T: BrokerTransport,
{
    let payload = serde_json::to_string(request).map_err(SocketError::Serialise)?;
    transport
        .send(WsMessage::text(payload))
        .await
        .map_err(|error| FeedError::Socket(SocketError::WebSocket(Box::new(error))))
}

/// Read frames until the broker's auth ack. `Ok(None)` means accepted;
/// `Ok(Some(reason))` means rejected.
async fn read_auth_ack<T>(transport: &mut T) -> Result<Option<String>, FeedError>
where
    T: BrokerTransport,
{
    loop {
        match transport.next().await {
            None => return Err(FeedError::TransportClosed),
            Some(Err(error)) => {
                return Err(FeedError::Socket(SocketError::WebSocket(Box::new(error))));
            }
            Some(Ok(WsMessage::Text(payload))) => {
                match serde_json::from_str::<BrokerResponse>(&payload) {
                    Ok(BrokerResponse::AuthAck { ok: true, .. }) => return Ok(None),
                    Ok(BrokerResponse::AuthAck { ok: false, reason }) => {
                        return Ok(Some(reason.unwrap_or_default()));
                    }
                    Ok(BrokerResponse::Error { reason }) => return Ok(Some(reason)),
                    Err(error) => debug!(%error, %payload, "unrecognised frame during auth"),
                }
            }
            // Binary quotes before the ack are stale; drop them
            Some(Ok(_)) => {}
        }
    }
}
