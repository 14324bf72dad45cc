//! TCP listener and per-connection decode loop

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::header::{FrameCategory, FrameHeader, HEADER_LEN, SENTINEL, heartbeat_response};
use super::state::VehicleStateFrame;
use crate::config::FrameConfig;
use crate::ingest::SharedIngest;
use crate::types::now_ms;
use crate::{IngestError, Result};

/// Counters for one finished connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub frames: u64,
    pub records: u64,
    pub heartbeats: u64,
    pub skipped_bytes: u64,
}

/// Accepts device connections and runs one decode task per connection.
pub struct FrameServer {
    listener: TcpListener,
    config: FrameConfig,
}

impl FrameServer {
    pub async fn bind(config: FrameConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| IngestError::io(format!("binding {}", config.listen_addr), e))?;
        Ok(Self::from_listener(listener, config))
    }

    pub fn from_listener(listener: TcpListener, config: FrameConfig) -> Self {
        Self { listener, config }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| IngestError::io("reading local address", e))
    }

    /// Accept until cancelled. Accept errors are logged and the loop continues.
    pub async fn run(self, ingest: SharedIngest, cancel: CancellationToken) {
        let addr = self.listener.local_addr().ok();
        info!(?addr, "Frame server listening");
        let mut incoming = TcpListenerStream::new(self.listener);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = incoming.next() => next,
            };

            match next {
                Some(Ok(stream)) => {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "<unknown>".to_string());
                    let _ = stream.set_nodelay(true);
                    let ingest = ingest.clone();
                    let config = self.config.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        debug!(%peer, "Device connected");
                        match handle_connection(stream, &ingest, &config, &cancel).await {
                            Ok(summary) => {
                                info!(%peer, frames = summary.frames, records = summary.records, "Device disconnected")
                            }
                            Err(e) => warn!(%peer, error = %e, "Device connection closed on error"),
                        }
                    });
                }
                Some(Err(e)) => warn!(error = %e, "Accept failed"),
                None => break,
            }
        }

        info!("Frame server stopped");
    }
}

/// Decode frames from one byte stream until EOF, error or cancellation.
///
/// Bytes before a sentinel are skipped. A clean EOF between frames ends the
/// connection normally; EOF inside a frame and every decode error end it with
/// an error.
pub async fn handle_connection<S>(
    stream: S,
    ingest: &SharedIngest,
    config: &FrameConfig,
    cancel: &CancellationToken,
) -> Result<ConnectionSummary>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut summary = ConnectionSummary::default();
    let write_timeout = config.heartbeat_write_timeout();

    loop {
        let header = tokio::select! {
            _ = cancel.cancelled() => break,
            header = read_header(&mut reader, &mut summary) => header?,
        };
        let Some(header) = header else { break };

        let len = header.check_payload_len(config.max_payload_bytes)?;
        let mut payload = vec![0u8; len];
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_exact(&mut payload) => {
                read.map_err(|e| IngestError::io("reading frame payload", e))?;
            }
        }
        summary.frames += 1;

        match header.category {
            FrameCategory::HeartbeatRequest => {
                send_heartbeat(&mut write_half, write_timeout).await?;
                summary.heartbeats += 1;
                trace!("Heartbeat answered");
            }
            FrameCategory::HeartbeatResponse => {
                trace!(timestamp_ms = header.timestamp_ms, "Heartbeat response received");
            }
            FrameCategory::VehicleState if header.version == 1 => {
                let record = VehicleStateFrame::decode(&payload)?.into_record(&header)?;
                let vehicle_id = record.vehicle_id.clone();
                match ingest.ingest(record).await {
                    Ok(()) => summary.records += 1,
                    Err(e) => debug!(vehicle_id = %vehicle_id, error = %e, "Record dropped"),
                }
            }
            FrameCategory::VehicleState => {
                debug!(version = header.version, len, "Unsupported vehicle-state version skipped");
            }
            FrameCategory::Other(code) => {
                debug!(category = code, len, "Unknown frame category skipped");
            }
        }
    }

    Ok(summary)
}

/// Scan to the next sentinel and read the rest of the header.
///
/// Returns `Ok(None)` on EOF before a sentinel.
async fn read_header<R>(reader: &mut R, summary: &mut ConnectionSummary) -> Result<Option<FrameHeader>>
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.read_u8().await {
            Ok(SENTINEL) => break,
            Ok(_) => summary.skipped_bytes += 1,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(IngestError::io("scanning for frame sentinel", e)),
        }
    }

    let mut rest = [0u8; HEADER_LEN - 1];
    reader
        .read_exact(&mut rest)
        .await
        .map_err(|e| IngestError::io("reading frame header", e))?;
    Ok(Some(FrameHeader::parse_after_sentinel(&rest)))
}

async fn send_heartbeat<W>(writer: &mut W, timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = heartbeat_response(now_ms());
    let write = async {
        writer.write_all(&response).await?;
        writer.flush().await
    };
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => result.map_err(|e| IngestError::io("writing heartbeat response", e)),
        Err(_) => Err(IngestError::Timeout { duration: timeout }),
    }
}
