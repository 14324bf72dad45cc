//! Vehicle telemetry ingestion and dispatch.
//!
//! Fleetwire accepts vehicle state from two sources, normalizes it into
//! [`VehicleStateRecord`]s and dispatches every record three ways.
//!
//! # Sources
//!
//! - **Binary devices**: a TCP listener decoding a framed big-endian wire
//!   format with heartbeats ([`frame`]).
//! - **Upstream feed**: a signed websocket subscription with reconnect,
//!   resubscription and per-vehicle rate shaping ([`upstream`]).
//!
//! # Dispatch
//!
//! - **Storage**: a backpressure-aware batcher writes points to a
//!   [`TimeSeriesSink`] ([`batcher`], [`sink`]).
//! - **Live fan-out**: a broadcast hub delivers JSON projections to
//!   websocket subscribers, evicting slow ones ([`hub`]).
//! - **Task events**: a geofence monitor emits pickup, destination and
//!   completion events for delivery tasks ([`monitor`]).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleetwire::{LineProtocolSink, NoDirectory, Pipeline, PipelineConfig, Position2D, TaskInfo};
//!
//! # async fn run() -> fleetwire::Result<()> {
//! let pipeline = Pipeline::start(
//!     PipelineConfig::default(),
//!     Arc::new(LineProtocolSink::new(tokio::io::sink())),
//!     Arc::new(NoDirectory),
//! )
//! .await?;
//!
//! pipeline.monitor().register(
//!     TaskInfo::new(
//!         "task-1",
//!         "order-1",
//!         Position2D::new(116.3975, 39.9087),
//!         Position2D::new(116.4500, 39.9300),
//!     )
//!     .with_vehicle("V001"),
//! );
//! let addr = pipeline.spawn_frame_server().await?;
//! println!("devices connect to {addr}");
//! # pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Core types and error handling
mod error;
pub mod config;
pub mod logging;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Sources
pub mod frame;
pub mod ingest;
pub mod upstream;

// Dispatch
pub mod batcher;
pub mod directory;
pub mod hub;
pub mod monitor;
pub mod online;
pub mod sink;

// Wiring
pub mod pipeline;

// Core exports
pub use config::{
    BatcherConfig, FanoutMode, FrameConfig, HubConfig, MonitorConfig, PipelineConfig,
    RetentionConfig, SubscriptionConfig, UpstreamConfig,
};
pub use error::*;
pub use types::*;

// Component exports
pub use batcher::{Batcher, BatcherHandle, BatcherStats};
pub use directory::{NoDirectory, StaticDirectory, VehicleDirectory, VehicleProfile};
pub use frame::{FrameHeader, FrameServer, VehicleStateFrame};
pub use hub::{BroadcastHub, Subscription};
pub use ingest::{Ingest, SharedIngest};
pub use monitor::{TaskMonitor, haversine_m};
pub use online::OnlineRegistry;
pub use pipeline::Pipeline;
pub use sink::{LineProtocolSink, Point, TimeSeriesSink};
pub use upstream::{UpstreamClient, UpstreamHandle};
