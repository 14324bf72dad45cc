//! Fixed 16-byte frame header

use crate::{IngestError, Result};

/// First byte of every frame.
pub const SENTINEL: u8 = 0xF2;

/// Encoded header size including the sentinel.
pub const HEADER_LEN: usize = 16;

/// Default hard cap on declared payload length.
pub const DEFAULT_MAX_PAYLOAD: u32 = 64 * 1024;

/// Frame category byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameCategory {
    HeartbeatRequest,
    HeartbeatResponse,
    VehicleState,
    Other(u8),
}

impl FrameCategory {
    pub const HEARTBEAT_REQUEST: u8 = 0x0C;
    pub const HEARTBEAT_RESPONSE: u8 = 0x0D;
    pub const VEHICLE_STATE: u8 = 0x15;

    pub fn code(self) -> u8 {
        match self {
            FrameCategory::HeartbeatRequest => Self::HEARTBEAT_REQUEST,
            FrameCategory::HeartbeatResponse => Self::HEARTBEAT_RESPONSE,
            FrameCategory::VehicleState => Self::VEHICLE_STATE,
            FrameCategory::Other(code) => code,
        }
    }
}

impl From<u8> for FrameCategory {
    fn from(code: u8) -> Self {
        match code {
            Self::HEARTBEAT_REQUEST => FrameCategory::HeartbeatRequest,
            Self::HEARTBEAT_RESPONSE => FrameCategory::HeartbeatResponse,
            Self::VEHICLE_STATE => FrameCategory::VehicleState,
            other => FrameCategory::Other(other),
        }
    }
}

/// Decoded frame header. All multi-byte fields are big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub category: FrameCategory,
    pub version: u8,
    pub timestamp_ms: u64,
    pub control: u8,
}

impl FrameHeader {
    /// Parse a complete header, sentinel included.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(IngestError::truncated("frame header", HEADER_LEN, bytes.len()));
        }
        if bytes[0] != SENTINEL {
            return Err(IngestError::protocol(
                "frame header",
                format!("expected sentinel {SENTINEL:#04x}, found {:#04x}", bytes[0]),
            ));
        }
        let rest: &[u8; HEADER_LEN - 1] = bytes[1..HEADER_LEN]
            .try_into()
            .map_err(|_| IngestError::truncated("frame header", HEADER_LEN, bytes.len()))?;
        Ok(Self::parse_after_sentinel(rest))
    }

    /// Parse the bytes that follow an already-consumed sentinel.
    pub(crate) fn parse_after_sentinel(rest: &[u8; HEADER_LEN - 1]) -> Self {
        let mut len = [0u8; 4];
        len.copy_from_slice(&rest[0..4]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&rest[6..14]);
        Self {
            payload_len: u32::from_be_bytes(len),
            category: FrameCategory::from(rest[4]),
            version: rest[5],
            timestamp_ms: u64::from_be_bytes(ts),
            control: rest[14],
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = SENTINEL;
        out[1..5].copy_from_slice(&self.payload_len.to_be_bytes());
        out[5] = self.category.code();
        out[6] = self.version;
        out[7..15].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        out[15] = self.control;
        out
    }

    /// Reject a declared payload length above `max` before anything is read.
    pub fn check_payload_len(&self, max: u32) -> Result<usize> {
        if self.payload_len > max {
            return Err(IngestError::PayloadTooLarge { declared: self.payload_len, max });
        }
        Ok(self.payload_len as usize)
    }
}

/// Zero-length heartbeat response carrying the responder's clock.
pub fn heartbeat_response(now_ms: u64) -> [u8; HEADER_LEN] {
    FrameHeader {
        payload_len: 0,
        category: FrameCategory::HeartbeatResponse,
        version: 0x01,
        timestamp_ms: now_ms,
        control: 0,
    }
    .encode()
}
