//! Coordinate validation applied by both ingestion paths before a position is stored.
//!
//! A rejected position never overwrites stored coordinates; callers attach the
//! rejection message to the node's `last_position_warning` instead.

/// Reasons a reported position is refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionRejected {
    #[error("No GPS fix (latitude and longitude are both 0)")]
    NoFix,

    #[error("Latitude {lat} out of range [-90, 90]")]
    LatitudeOutOfRange { lat: f64 },

    #[error("Longitude {lon} out of range [-180, 180]")]
    LongitudeOutOfRange { lon: f64 },

    #[error("Position reported as the north pole (90, 0); treated as no fix")]
    PoleSentinel,
}

/// Validate a latitude/longitude pair in degrees.
///
/// NaN fails both range checks and is rejected.
pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), PositionRejected> {
    if lat == 0.0 && lon == 0.0 {
        return Err(PositionRejected::NoFix);
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(PositionRejected::LatitudeOutOfRange { lat });
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(PositionRejected::LongitudeOutOfRange { lon });
    }
    if lat == 90.0 && lon == 0.0 {
        return Err(PositionRejected::PoleSentinel);
    }
    Ok(())
}

/// Convert Meshtastic fixed-point degrees (1e-7) to floating degrees.
pub fn degrees_from_i32(value: i32) -> f64 {
    value as f64 * 1e-7
}
