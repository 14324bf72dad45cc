//! Geographic positions

use serde::{Deserialize, Serialize};

/// Scale between binary fixed-point coordinates and degrees.
pub const FIXED_POINT_SCALE: f64 = 1e7;

/// Longitude/latitude pair in degrees.
///
/// Degrees are the canonical unit everywhere inside the pipeline. The binary
/// wire format carries coordinates as fixed-point integers scaled by 1e7 and
/// converts at the decoder boundary through [`Position2D::from_fixed`] and
/// [`Position2D::to_fixed`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position2D {
    pub lon: f64,
    pub lat: f64,
}

impl Position2D {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Convert raw fixed-point wire values into degrees.
    ///
    /// The raw words are read as two's complement so that western and
    /// southern hemisphere positions survive the unsigned wire field.
    pub fn from_fixed(lon_raw: u32, lat_raw: u32) -> Self {
        Self {
            lon: f64::from(lon_raw as i32) / FIXED_POINT_SCALE,
            lat: f64::from(lat_raw as i32) / FIXED_POINT_SCALE,
        }
    }

    /// Convert back into raw fixed-point wire values.
    pub fn to_fixed(&self) -> (u32, u32) {
        (to_fixed_word(self.lon), to_fixed_word(self.lat))
    }

    /// Finite and inside the valid degree ranges.
    pub fn is_valid(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }

    /// Valid and not the all-zero placeholder devices send without a fix.
    pub fn has_fix(&self) -> bool {
        self.is_valid() && !(self.lon == 0.0 && self.lat == 0.0)
    }
}

fn to_fixed_word(degrees: f64) -> u32 {
    let scaled = (degrees * FIXED_POINT_SCALE).round();
    let clamped = scaled.clamp(f64::from(i32::MIN), f64::from(i32::MAX));
    (clamped as i32) as u32
}
