//! Owned pipeline context wiring sources, batcher, hub and monitor together.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fleetwire::{LineProtocolSink, NoDirectory, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> fleetwire::Result<()> {
//!     fleetwire::logging::init_tracing();
//!     let config = PipelineConfig::load("fleetwire.yaml")?;
//!     let sink = Arc::new(LineProtocolSink::new(tokio::io::sink()));
//!     let pipeline = Pipeline::start(config, sink, Arc::new(NoDirectory)).await?;
//!     pipeline.spawn_frame_server().await?;
//!     tokio::time::sleep(Duration::from_secs(3600)).await;
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batcher::{Batcher, BatcherHandle};
use crate::config::{PipelineConfig, RetentionConfig};
use crate::directory::VehicleDirectory;
use crate::frame::FrameServer;
use crate::hub::{BroadcastHub, SubscriberListener};
use crate::ingest::{Ingest, SharedIngest};
use crate::monitor::TaskMonitor;
use crate::online::OnlineRegistry;
use crate::sink::TimeSeriesSink;
use crate::types::VehicleStateRecord;
use crate::upstream::{Dialer, SampleGate, UpstreamClient, UpstreamHandle, WsDialer};
use crate::{IngestError, Result};

/// Ingest path shared by every source: online status, monitor queue, batcher.
struct PipelineIngest {
    batcher: BatcherHandle,
    online: Arc<OnlineRegistry>,
    monitor_tx: mpsc::Sender<VehicleStateRecord>,
}

#[async_trait::async_trait]
impl Ingest for PipelineIngest {
    async fn ingest(&self, record: VehicleStateRecord) -> Result<()> {
        self.online.touch(&record.vehicle_id);

        if record.position.has_fix() {
            match self.monitor_tx.try_send(record.clone()) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(record)) => {
                    debug!(vehicle_id = %record.vehicle_id, "Monitor queue full, evaluation skipped");
                }
            }
        }

        self.batcher.enqueue(record).await
    }
}

/// A running pipeline instance.
pub struct Pipeline {
    config: PipelineConfig,
    hub: BroadcastHub,
    batcher: BatcherHandle,
    monitor: Arc<TaskMonitor>,
    online: Arc<OnlineRegistry>,
    gate: Arc<SampleGate>,
    ingest: SharedIngest,
    /// Stops sources before the batcher drains.
    sources: CancellationToken,
    /// Stops the hub and monitor after the final flush.
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    upstream: Mutex<Option<UpstreamHandle>>,
    subscriber_addr: Option<SocketAddr>,
}

impl Pipeline {
    /// Validate the configuration and start the hub, batcher and monitor.
    ///
    /// The subscriber websocket listener starts too when `hub.listen_addr` is set,
    /// and the upstream client when `upstream.enabled` is. The frame listener is
    /// started separately with [`spawn_frame_server`](Self::spawn_frame_server).
    pub async fn start(
        config: PipelineConfig,
        sink: Arc<dyn TimeSeriesSink>,
        directory: Arc<dyn VehicleDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let sources = cancel.child_token();

        let hub = BroadcastHub::spawn(&config.hub, cancel.clone());
        let batcher = Batcher::spawn(&config.batcher, sink, hub.clone(), directory);
        let monitor = Arc::new(TaskMonitor::new(&config.monitor, hub.clone()));
        let online = Arc::new(OnlineRegistry::new());
        let gate = Arc::new(SampleGate::new(Duration::from_millis(
            config.upstream.min_sample_interval_ms,
        )));

        let (monitor_tx, monitor_rx) = mpsc::channel(config.monitor.event_queue_capacity.max(1));
        let mut tasks = vec![
            monitor.spawn_listener(monitor_rx, cancel.clone()),
            tokio::spawn(prune_stale(
                config.retention.clone(),
                Arc::clone(&online),
                Arc::clone(&gate),
                cancel.clone(),
            )),
        ];

        let mut subscriber_addr = None;
        if let Some(addr) = &config.hub.listen_addr {
            let listener = SubscriberListener::bind(addr).await?;
            subscriber_addr = Some(listener.local_addr()?);
            tasks.push(tokio::spawn(listener.run(hub.clone(), sources.clone())));
        }

        let ingest: SharedIngest = Arc::new(PipelineIngest {
            batcher: batcher.clone(),
            online: Arc::clone(&online),
            monitor_tx,
        });

        info!(
            batch_size = config.batcher.batch_size,
            fanout = ?config.batcher.fanout,
            subscribers = ?subscriber_addr,
            "Pipeline started"
        );
        let pipeline = Self {
            config,
            hub,
            batcher,
            monitor,
            online,
            gate,
            ingest,
            sources,
            cancel,
            tasks: Mutex::new(tasks),
            upstream: Mutex::new(None),
            subscriber_addr,
        };
        if pipeline.config.upstream.enabled {
            pipeline.spawn_upstream()?;
        }
        Ok(pipeline)
    }

    /// The ingest entry point handed to record sources.
    pub fn ingest(&self) -> SharedIngest {
        Arc::clone(&self.ingest)
    }

    /// Bind the binary frame listener from `frame.listen_addr` and start accepting.
    pub async fn spawn_frame_server(&self) -> Result<SocketAddr> {
        if self.sources.is_cancelled() {
            return Err(IngestError::ShuttingDown);
        }
        let server = FrameServer::bind(self.config.frame.clone()).await?;
        let addr = server.local_addr()?;
        let task = tokio::spawn(server.run(self.ingest(), self.sources.clone()));
        self.tasks.lock().push(task);
        Ok(addr)
    }

    /// Connect to the configured upstream feed.
    pub fn spawn_upstream(&self) -> Result<UpstreamHandle> {
        self.spawn_upstream_with(WsDialer)
    }

    /// Connect to the upstream feed through a custom dialer.
    pub fn spawn_upstream_with<D: Dialer>(&self, dialer: D) -> Result<UpstreamHandle> {
        if self.sources.is_cancelled() {
            return Err(IngestError::ShuttingDown);
        }
        let config = &self.config.upstream;
        if config.url.is_empty() {
            return Err(IngestError::config("upstream.url is not set"));
        }

        let mut upstream = self.upstream.lock();
        if upstream.is_some() {
            return Err(IngestError::config("upstream client already running"));
        }
        let handle = UpstreamClient::spawn(
            config.clone(),
            dialer,
            self.ingest(),
            Arc::clone(&self.gate),
            self.sources.child_token(),
        );
        *upstream = Some(handle.clone());
        Ok(handle)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn batcher(&self) -> &BatcherHandle {
        &self.batcher
    }

    pub fn monitor(&self) -> &Arc<TaskMonitor> {
        &self.monitor
    }

    pub fn online(&self) -> &Arc<OnlineRegistry> {
        &self.online
    }

    pub fn subscriber_addr(&self) -> Option<SocketAddr> {
        self.subscriber_addr
    }

    /// Handle of the running upstream client, if one was started.
    pub fn upstream(&self) -> Option<UpstreamHandle> {
        self.upstream.lock().clone()
    }

    /// Stop sources, flush buffered records, then stop the hub and monitor.
    pub async fn shutdown(&self) {
        info!("Pipeline shutting down");
        self.sources.cancel();
        let upstream = self.upstream.lock().take();
        if let Some(upstream) = upstream {
            upstream.stop().await;
        }

        self.batcher.shutdown().await;
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let stats = self.batcher.stats();
        info!(
            written = stats.records_written,
            dropped = stats.backpressure_dropped,
            failures = stats.write_failures,
            "Pipeline stopped"
        );
    }
}

/// Periodically forget vehicles that have gone quiet.
async fn prune_stale(
    retention: RetentionConfig,
    online: Arc<OnlineRegistry>,
    gate: Arc<SampleGate>,
    cancel: CancellationToken,
) {
    let stale_after = retention.stale_after();
    let mut ticker = tokio::time::interval(retention.prune_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let offline = online.prune(stale_after);
                let shaped = gate.prune(stale_after);
                if offline + shaped > 0 {
                    debug!(offline, shaped, "Pruned stale vehicle state");
                }
            }
        }
    }
}
