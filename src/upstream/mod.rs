//! Upstream push feed: signed websocket connection, subscriptions, and
//! per-vehicle rate shaping of the inbound stream.
//!
//! The [`UpstreamClient`] owns a single connection at a time. It reconnects
//! with exponential backoff, re-signs every attempt, and resends each
//! registered subscription exactly once per established connection.

mod auth;
mod backoff;
mod client;
mod gate;
mod messages;

pub use auth::{AUTH_TYPE_HEADER, AUTH_TYPE_SIGN, NONCE_LEN, SignedTarget, generate_nonce, sign};
pub use backoff::Backoff;
pub use client::{Dialer, UpstreamClient, UpstreamHandle, UpstreamStats, WsDialer};
pub use gate::SampleGate;
pub use messages::{SubscribeRequest, UpstreamMessage, UpstreamVehicleState};
