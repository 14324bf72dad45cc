//! Websocket transport for hub subscribers

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::BroadcastHub;
use crate::{IngestError, Result};

/// Extract the subscriber group from a `service` or `serviceId` query parameter.
pub fn service_group(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "service" || *key == "serviceId")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Pump hub payloads to one websocket until either side closes.
///
/// Inbound frames are drained and ignored. The subscriber is unregistered on
/// exit, and a close frame is sent when the hub evicted it.
pub async fn serve_subscriber<S>(
    ws: WebSocketStream<S>,
    hub: BroadcastHub,
    group: Option<String>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut subscription = hub.register(group);
    let id = subscription.id();
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            payload = subscription.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = write.send(Message::text(payload.to_string())).await {
                        debug!(client = id, error = %e, "Subscriber write failed");
                        break;
                    }
                }
                None => {
                    debug!(client = id, "Subscriber evicted");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client = id, error = %e, "Subscriber read failed");
                    break;
                }
            },
        }
    }

    hub.unregister(id);
}

/// Accepts websocket upgrades and attaches each peer to the hub.
pub struct SubscriberListener {
    listener: TcpListener,
}

impl SubscriberListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| IngestError::io(format!("binding {addr}"), e))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| IngestError::io("reading local address", e))
    }

    pub async fn run(self, hub: BroadcastHub, cancel: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "Subscriber listener started");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Subscriber accept failed");
                    continue;
                }
            };

            let hub = hub.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let mut group = None;
                let callback = |request: &Request, response: Response| {
                    group = service_group(request.uri().query());
                    Ok::<_, ErrorResponse>(response)
                };
                let handshake = tokio_tungstenite::accept_hdr_async(stream, callback).await;
                match handshake {
                    Ok(ws) => {
                        debug!(%peer, group = ?group, "Subscriber connected");
                        serve_subscriber(ws, hub, group, cancel).await;
                        debug!(%peer, "Subscriber disconnected");
                    }
                    Err(e) => debug!(%peer, error = %e, "Subscriber handshake failed"),
                }
            });
        }
        info!("Subscriber listener stopped");
    }
}
