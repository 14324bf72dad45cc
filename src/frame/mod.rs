//! Binary frame protocol spoken by on-board devices.
//!
//! A frame is a 16-byte header followed by exactly `payload_len` bytes:
//!
//! | offset | size | field                       |
//! |--------|------|-----------------------------|
//! | 0      | 1    | sentinel `0xF2`             |
//! | 1      | 4    | payload length (BE)         |
//! | 5      | 1    | category                    |
//! | 6      | 1    | version                     |
//! | 7      | 8    | timestamp, ms (BE)          |
//! | 15     | 1    | control                     |
//!
//! Categories `0x0C`/`0x0D` are heartbeat request/response and `0x15` carries a
//! [`VehicleStateFrame`]. Declared lengths are checked against a cap before any
//! payload byte is read.

mod header;
mod server;
mod state;

pub use header::{
    DEFAULT_MAX_PAYLOAD, FrameCategory, FrameHeader, HEADER_LEN, SENTINEL, heartbeat_response,
};
pub use server::{ConnectionSummary, FrameServer, handle_connection};
pub use state::{PASS_POINT_LEN, VEHICLE_STATE_MIN_LEN, VehicleStateFrame, scale};
