//! Resilient websocket client for the upstream push feed

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::auth::SignedTarget;
use super::backoff::Backoff;
use super::gate::SampleGate;
use super::messages::{SubscribeRequest, UpstreamMessage};
use crate::config::UpstreamConfig;
use crate::ingest::SharedIngest;
use crate::types::now_ms;
use crate::{IngestError, Result};

/// Opens websocket connections to a signed target.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, target: &SignedTarget) -> Result<WebSocketStream<Self::Io>>;
}

/// Dials over TCP, upgrading to TLS for `wss://` targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsDialer;

#[async_trait::async_trait]
impl Dialer for WsDialer {
    type Io = MaybeTlsStream<TcpStream>;

    async fn dial(&self, target: &SignedTarget) -> Result<WebSocketStream<Self::Io>> {
        let (ws, response) = tokio_tungstenite::connect_async(target.request()?).await?;
        debug!(status = %response.status(), "Upstream handshake complete");
        Ok(ws)
    }
}

/// Snapshot of client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamStats {
    pub connects: u64,
    pub connect_failures: u64,
    pub messages: u64,
    pub rate_limited: u64,
    pub decode_errors: u64,
    pub ingest_failures: u64,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    messages: AtomicU64,
    rate_limited: AtomicU64,
    decode_errors: AtomicU64,
    ingest_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Registered subscriptions in registration order.
#[derive(Default)]
struct SubscriptionSet {
    order: Vec<SubscribeRequest>,
    members: HashSet<SubscribeRequest>,
}

impl SubscriptionSet {
    fn insert(&mut self, request: SubscribeRequest) -> bool {
        if self.members.insert(request.clone()) {
            self.order.push(request);
            true
        } else {
            false
        }
    }
}

type PendingTable = HashMap<String, Vec<oneshot::Sender<UpstreamMessage>>>;

struct ClientShared {
    subscriptions: Mutex<SubscriptionSet>,
    subscriptions_changed: Notify,
    pending: Mutex<PendingTable>,
    queries: mpsc::Sender<SubscribeRequest>,
    connected: AtomicBool,
    counters: Counters,
}

impl ClientShared {
    /// Hand a response to every caller waiting on its vehicle id.
    fn resolve_pending(&self, message: &UpstreamMessage) -> usize {
        let Some(vehicle_id) = message.vehicle_id() else { return 0 };
        let Some(waiters) = self.pending.lock().remove(vehicle_id) else { return 0 };
        waiters.into_iter().map(|tx| tx.send(message.clone()).is_ok()).filter(|sent| *sent).count()
    }

    fn prune_pending(&self, vehicle_id: &str) {
        let mut pending = self.pending.lock();
        if let Some(waiters) = pending.get_mut(vehicle_id) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                pending.remove(vehicle_id);
            }
        }
    }
}

/// Cloneable control handle for a running client.
#[derive(Clone)]
pub struct UpstreamHandle {
    shared: Arc<ClientShared>,
    query_timeout: Duration,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl fmt::Debug for UpstreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamHandle")
            .field("connected", &self.is_connected())
            .field("query_timeout", &self.query_timeout)
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl UpstreamHandle {
    /// Register a vehicle subscription, sent now if connected and after every reconnect.
    pub fn subscribe_vehicle(&self, vehicle_id: impl Into<String>) {
        self.subscribe(SubscribeRequest::vehicle(vehicle_id));
    }

    /// Register a category subscription, sent now if connected and after every reconnect.
    pub fn subscribe_category(&self, category_code: i32) {
        self.subscribe(SubscribeRequest::category(category_code));
    }

    pub fn subscribe(&self, request: SubscribeRequest) {
        if self.shared.subscriptions.lock().insert(request) {
            self.shared.subscriptions_changed.notify_one();
        }
    }

    pub fn subscriptions(&self) -> Vec<SubscribeRequest> {
        self.shared.subscriptions.lock().order.clone()
    }

    /// Request the current state of one vehicle, waiting up to `query_timeout_ms`.
    pub async fn query(&self, vehicle_id: &str) -> Result<UpstreamMessage> {
        self.query_with_timeout(vehicle_id, self.query_timeout).await
    }

    /// Request the current state of one vehicle and wait for the matching reply.
    pub async fn query_with_timeout(
        &self,
        vehicle_id: &str,
        timeout: Duration,
    ) -> Result<UpstreamMessage> {
        if !self.is_connected() {
            return Err(IngestError::connection_failed("upstream not connected"));
        }

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().entry(vehicle_id.to_string()).or_default().push(tx);

        if self.shared.queries.try_send(SubscribeRequest::vehicle(vehicle_id)).is_err() {
            self.shared.prune_pending(vehicle_id);
            return Err(IngestError::Backpressure { waited: Duration::ZERO });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(IngestError::channel_closed("upstream query")),
            Err(_) => {
                self.shared.prune_pending(vehicle_id);
                Err(IngestError::Timeout { duration: timeout })
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> UpstreamStats {
        let c = &self.shared.counters;
        UpstreamStats {
            connects: c.connects.load(Ordering::Relaxed),
            connect_failures: c.connect_failures.load(Ordering::Relaxed),
            messages: c.messages.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            ingest_failures: c.ingest_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop reconnecting, close the active connection and wait for the loop to end.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.finished.cancelled().await;
    }
}

enum ConnectionExit {
    Cancelled,
    Lost(String),
}

/// Background connection loop.
pub struct UpstreamClient<D: Dialer> {
    config: UpstreamConfig,
    dialer: D,
    ingest: SharedIngest,
    gate: Arc<SampleGate>,
    shared: Arc<ClientShared>,
}

impl<D: Dialer> UpstreamClient<D> {
    /// Spawn the connection loop. Subscriptions from the config are registered first.
    pub fn spawn(
        config: UpstreamConfig,
        dialer: D,
        ingest: SharedIngest,
        gate: Arc<SampleGate>,
        cancel: CancellationToken,
    ) -> UpstreamHandle {
        let (queries, query_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let shared = Arc::new(ClientShared {
            subscriptions: Mutex::new(SubscriptionSet::default()),
            subscriptions_changed: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            queries,
            connected: AtomicBool::new(false),
            counters: Counters::default(),
        });
        {
            let mut set = shared.subscriptions.lock();
            for id in &config.subscriptions.vehicle_ids {
                set.insert(SubscribeRequest::vehicle(id.clone()));
            }
            for code in &config.subscriptions.category_codes {
                set.insert(SubscribeRequest::category(*code));
            }
        }

        let finished = CancellationToken::new();
        let handle = UpstreamHandle {
            shared: Arc::clone(&shared),
            query_timeout: config.query_timeout(),
            cancel: cancel.clone(),
            finished: finished.clone(),
        };
        let client = Self { config, dialer, ingest, gate, shared };
        tokio::spawn(async move {
            client.run(query_rx, cancel).await;
            finished.cancel();
        });
        handle
    }

    async fn run(self, mut query_rx: mpsc::Receiver<SubscribeRequest>, cancel: CancellationToken) {
        info!(url = %self.config.url, "Upstream client started");
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );
        let handshake_timeout = self.config.handshake_timeout();

        loop {
            let target = SignedTarget::build(
                &self.config.url,
                &self.config.app_id,
                &self.config.app_secret,
                now_ms(),
            );
            let dialed = tokio::select! {
                _ = cancel.cancelled() => break,
                dialed = tokio::time::timeout(handshake_timeout, self.dialer.dial(&target)) => dialed,
            };

            match dialed {
                Ok(Ok(ws)) => {
                    backoff.reset();
                    bump(&self.shared.counters.connects);
                    self.shared.connected.store(true, Ordering::Release);
                    info!("Upstream connected");
                    let exit = self.run_connection(ws, &mut query_rx, &cancel).await;
                    self.shared.connected.store(false, Ordering::Release);
                    match exit {
                        ConnectionExit::Cancelled => break,
                        ConnectionExit::Lost(reason) => warn!(%reason, "Upstream connection lost"),
                    }
                }
                Ok(Err(e)) => {
                    bump(&self.shared.counters.connect_failures);
                    warn!(error = %e, attempt = backoff.attempts() + 1, "Upstream connect failed");
                }
                Err(_) => {
                    bump(&self.shared.counters.connect_failures);
                    warn!(timeout = ?handshake_timeout, attempt = backoff.attempts() + 1, "Upstream handshake timed out");
                }
            }

            let delay = backoff.next_delay();
            debug!(?delay, "Reconnecting after delay");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Upstream client stopped");
    }

    async fn run_connection(
        &self,
        ws: WebSocketStream<D::Io>,
        query_rx: &mut mpsc::Receiver<SubscribeRequest>,
        cancel: &CancellationToken,
    ) -> ConnectionExit {
        let (mut write, mut read) = ws.split();
        let mut sent = HashSet::new();
        if let Err(e) = self.send_new_subscriptions(&mut write, &mut sent).await {
            return ConnectionExit::Lost(format!("subscribe failed: {e}"));
        }

        let heartbeat = self.config.heartbeat_interval();
        let read_deadline = self.config.read_deadline();
        let mut ping = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        let mut deadline = Instant::now() + read_deadline;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return ConnectionExit::Cancelled;
                }
                _ = self.shared.subscriptions_changed.notified() => {
                    if let Err(e) = self.send_new_subscriptions(&mut write, &mut sent).await {
                        return ConnectionExit::Lost(format!("subscribe failed: {e}"));
                    }
                }
                query = query_rx.recv() => {
                    let Some(query) = query else { continue };
                    if let Err(e) = send_json(&mut write, &query).await {
                        return ConnectionExit::Lost(format!("query failed: {e}"));
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Default::default())).await {
                        return ConnectionExit::Lost(format!("ping failed: {e}"));
                    }
                    trace!("Upstream ping sent");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return ConnectionExit::Lost(format!("no inbound traffic for {read_deadline:?}"));
                }
                inbound = read.next() => {
                    deadline = Instant::now() + read_deadline;
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(text.as_bytes()).await,
                        Some(Ok(Message::Binary(bytes))) => self.handle_inbound(&bytes).await,
                        Some(Ok(Message::Close(frame))) => {
                            return ConnectionExit::Lost(format!("closed by peer: {frame:?}"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return ConnectionExit::Lost(e.to_string()),
                        None => return ConnectionExit::Lost("stream ended".to_string()),
                    }
                }
            }
        }
    }

    /// Send every registered subscription not yet sent on this connection.
    async fn send_new_subscriptions<S>(
        &self,
        write: &mut SplitSink<WebSocketStream<S>, Message>,
        sent: &mut HashSet<SubscribeRequest>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let unsent: Vec<SubscribeRequest> = self
            .shared
            .subscriptions
            .lock()
            .order
            .iter()
            .filter(|request| !sent.contains(*request))
            .cloned()
            .collect();

        for request in unsent {
            send_json(write, &request).await?;
            debug!(?request, "Subscription sent");
            sent.insert(request);
        }
        Ok(())
    }

    async fn handle_inbound(&self, bytes: &[u8]) {
        bump(&self.shared.counters.messages);
        let message: UpstreamMessage = match serde_json::from_slice(bytes) {
            Ok(message) => message,
            Err(e) => {
                bump(&self.shared.counters.decode_errors);
                debug!(error = %e, "Undecodable upstream message");
                return;
            }
        };

        let resolved = self.shared.resolve_pending(&message);
        if resolved > 0 {
            trace!(resolved, "Pending queries resolved");
        }

        if !message.is_success() {
            debug!(code = message.code, message = %message.message, "Upstream reported an error");
            return;
        }
        let Some(data) = message.data else { return };
        if !self.gate.admit(&data.vehicle_id) {
            bump(&self.shared.counters.rate_limited);
            return;
        }
        let Some(record) = data.into_record() else { return };
        let vehicle_id = record.vehicle_id.clone();
        if let Err(e) = self.ingest.ingest(record).await {
            bump(&self.shared.counters.ingest_failures);
            debug!(vehicle_id = %vehicle_id, error = %e, "Upstream record dropped");
        }
    }
}

async fn send_json<S>(
    write: &mut SplitSink<WebSocketStream<S>, Message>,
    request: &SubscribeRequest,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(request)
        .map_err(|e| IngestError::Json { context: "subscribe request".to_string(), source: e })?;
    write.send(Message::text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingIngest;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    type ServerSide = WebSocketStream<DuplexStream>;

    /// Fails a fixed number of dials, then hands out in-memory connections.
    struct ScriptedDialer {
        failures_left: AtomicUsize,
        attempts: Mutex<Vec<Instant>>,
        servers: mpsc::UnboundedSender<ServerSide>,
    }

    #[async_trait::async_trait]
    impl Dialer for ScriptedDialer {
        type Io = DuplexStream;

        async fn dial(&self, target: &SignedTarget) -> Result<WebSocketStream<DuplexStream>> {
            assert!(target.url.contains("sign="));
            self.attempts.lock().push(Instant::now());
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(IngestError::connection_failed("refused"));
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
            let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
            let _ = self.servers.send(server);
            Ok(client)
        }
    }

    struct Harness {
        handle: UpstreamHandle,
        ingest: Arc<RecordingIngest>,
        servers: mpsc::UnboundedReceiver<ServerSide>,
        dialer_attempts: Arc<ScriptedDialer>,
    }

    #[async_trait::async_trait]
    impl Dialer for Arc<ScriptedDialer> {
        type Io = DuplexStream;

        async fn dial(&self, target: &SignedTarget) -> Result<WebSocketStream<DuplexStream>> {
            self.as_ref().dial(target).await
        }
    }

    fn config() -> UpstreamConfig {
        UpstreamConfig {
            enabled: true,
            url: "ws://feed.test/push".to_string(),
            app_id: "fleet".to_string(),
            app_secret: "secret".to_string(),
            heartbeat_interval_ms: 10_000,
            backoff_base_ms: 100,
            backoff_max_ms: 400,
            min_sample_interval_ms: 0,
            ..UpstreamConfig::default()
        }
    }

    fn start(config: UpstreamConfig, failures: usize, gate: SampleGate) -> Harness {
        let (tx, servers) = mpsc::unbounded_channel();
        let dialer = Arc::new(ScriptedDialer {
            failures_left: AtomicUsize::new(failures),
            attempts: Mutex::new(Vec::new()),
            servers: tx,
        });
        let ingest = Arc::new(RecordingIngest::default());
        let handle = UpstreamClient::spawn(
            config,
            Arc::clone(&dialer),
            ingest.clone(),
            Arc::new(gate),
            CancellationToken::new(),
        );
        Harness { handle, ingest, servers, dialer_attempts: dialer }
    }

    /// Collect text frames until the peer goes quiet for `quiet`.
    async fn read_texts(server: &mut ServerSide, quiet: Duration) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(Some(Ok(message))) = tokio::time::timeout(quiet, server.next()).await {
            if let Message::Text(text) = message {
                texts.push(text.as_str().to_string());
            }
        }
        texts
    }

    fn subscription_set(texts: &[String]) -> HashSet<SubscribeRequest> {
        texts.iter().map(|t| serde_json::from_str(t).unwrap()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_then_subscriptions_resend_once_per_connection() {
        let mut config = config();
        config.subscriptions.vehicle_ids = vec!["V001".to_string()];
        let mut harness = start(config, 4, SampleGate::disabled());
        harness.handle.subscribe_category(3);

        let mut server = harness.servers.recv().await.unwrap();
        let texts = read_texts(&mut server, Duration::from_millis(50)).await;
        assert_eq!(texts.len(), 2);
        let expected: HashSet<_> =
            [SubscribeRequest::vehicle("V001"), SubscribeRequest::category(3)].into_iter().collect();
        assert_eq!(subscription_set(&texts), expected);

        let attempts = harness.dialer_attempts.attempts.lock().clone();
        assert_eq!(attempts.len(), 5);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "backoff shrank: {gaps:?}");
        }
        assert!(gaps.iter().all(|gap| *gap <= Duration::from_millis(400) + Duration::from_millis(5)));

        // Drop the connection; the client reconnects and resends each subscription once.
        drop(server);
        let mut server = harness.servers.recv().await.unwrap();
        let texts = read_texts(&mut server, Duration::from_millis(50)).await;
        assert_eq!(texts.len(), 2);
        assert_eq!(subscription_set(&texts), expected);

        let stats = harness.handle.stats();
        assert_eq!(stats.connect_failures, 4);
        assert_eq!(stats.connects, 2);
        harness.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscription_is_sent_on_live_connection() {
        let mut harness = start(config(), 0, SampleGate::disabled());
        let mut server = harness.servers.recv().await.unwrap();
        assert!(read_texts(&mut server, Duration::from_millis(20)).await.is_empty());

        harness.handle.subscribe_vehicle("V777");
        harness.handle.subscribe_vehicle("V777");
        let texts = read_texts(&mut server, Duration::from_millis(50)).await;
        assert_eq!(texts, vec![r#"{"vehicleId":"V777"}"#.to_string()]);
        harness.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_records_are_shaped_and_ingested() {
        let gate = SampleGate::new(Duration::from_millis(1_000));
        let mut harness = start(config(), 0, gate);
        let mut server = harness.servers.recv().await.unwrap();

        for ts in [1u64, 2, 3] {
            let text = format!(
                r#"{{"code":0,"data":{{"vehicleId":"V001","timestamp":{ts},"lon":116.4,"lat":39.9}}}}"#
            );
            server.send(Message::text(text)).await.unwrap();
        }
        server.send(Message::text("not json")).await.unwrap();
        harness.ingest.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = harness.ingest.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_ms, 1);
        let stats = harness.handle.stats();
        assert_eq!(stats.rate_limited, 2);
        assert_eq!(stats.decode_errors, 1);
        harness.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn query_resolves_through_pending_table() {
        let mut harness = start(config(), 0, SampleGate::disabled());
        let mut server = harness.servers.recv().await.unwrap();
        while !harness.handle.is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let handle = harness.handle.clone();
        let query = tokio::spawn(async move { handle.query("V042").await });

        let texts = read_texts(&mut server, Duration::from_millis(50)).await;
        assert_eq!(texts, vec![r#"{"vehicleId":"V042"}"#.to_string()]);
        server
            .send(Message::text(r#"{"code":0,"message":"ok","data":{"vehicleId":"V042","timestamp":9}}"#))
            .await
            .unwrap();

        let message = query.await.unwrap().unwrap();
        assert_eq!(message.vehicle_id(), Some("V042"));

        let err = harness
            .handle
            .query_with_timeout("V404", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Timeout { .. }));
        assert!(harness.handle.shared.pending.lock().is_empty());
        harness.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn query_defaults_to_configured_timeout() {
        let mut config = config();
        config.query_timeout_ms = 250;
        let mut harness = start(config, 0, SampleGate::disabled());
        let _server = harness.servers.recv().await.unwrap();
        while !harness.handle.is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(format!("{:?}", harness.handle).contains("connected: true"));

        let err = harness.handle.query("V404").await.unwrap_err();
        assert!(matches!(err, IngestError::Timeout { duration } if duration == Duration::from_millis(250)));
        harness.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_forces_reconnect() {
        let mut config = config();
        config.heartbeat_interval_ms = 1_000;
        let mut harness = start(config, 0, SampleGate::disabled());

        let _first = harness.servers.recv().await.unwrap();
        let started = Instant::now();
        let _second = harness.servers.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(3_000));
        assert_eq!(harness.handle.stats().connects, 2);
        harness.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_connection_and_ends_loop() {
        let mut harness = start(config(), 0, SampleGate::disabled());
        let mut server = harness.servers.recv().await.unwrap();

        harness.handle.stop().await;
        assert!(!harness.handle.is_connected());
        let closing = tokio::time::timeout(Duration::from_secs(1), server.next()).await.unwrap();
        assert!(matches!(closing, Some(Ok(Message::Close(_)))));
        assert!(harness.servers.try_recv().is_err());
    }
}
