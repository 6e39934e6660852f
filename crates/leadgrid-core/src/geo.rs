//! Spherical geometry helpers.
//!
//! All distances are great-circle distances on a sphere of radius
//! [`EARTH_RADIUS_KM`] (haversine formula).

use crate::error::{LeadgridError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated WGS84 coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in degrees, `[-90, 90]`
    pub latitude: f64,
    /// Longitude in degrees, `[-180, 180]`
    pub longitude: f64,
}

impl Coordinates {
    /// Create a coordinate pair, rejecting out-of-range or non-finite values.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(LeadgridError::Validation(format!(
                "latitude must be within [-90, 90], got {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(LeadgridError::Validation(format!(
                "longitude must be within [-180, 180], got {longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Parse a `"lat,lon"` string such as `"30.2672, -97.7431"`.
    ///
    /// Returns `None` when the text is not exactly two in-range numbers.
    #[must_use]
    pub fn parse_pair(text: &str) -> Option<Self> {
        let (lat, lon) = text.split_once(',')?;
        let lat: f64 = lat.trim().parse().ok()?;
        let lon: f64 = lon.trim().parse().ok()?;
        Self::new(lat, lon).ok()
    }

    /// Great-circle distance to `other` in kilometers.
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        haversine_km(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    /// Great-circle distance to `other` in meters.
    #[must_use]
    pub fn distance_m(&self, other: &Self) -> f64 {
        self.distance_km(other) * 1000.0
    }

    /// Point reached by moving `north_km` and `east_km` from here on a
    /// local tangent plane.
    ///
    /// Longitude degrees are scaled by the cosine of the *target* latitude,
    /// so each lattice row gets its own conversion. The result is clamped
    /// to valid ranges; longitude wraps across the antimeridian.
    #[must_use]
    pub fn offset_km(&self, north_km: f64, east_km: f64) -> Self {
        let km_per_degree = EARTH_RADIUS_KM.to_radians();
        let latitude = (self.latitude + north_km / km_per_degree).clamp(-90.0, 90.0);
        let cos_lat = latitude.to_radians().cos().max(1e-6);
        let mut longitude = self.longitude + east_km / (km_per_degree * cos_lat);
        if longitude > 180.0 {
            longitude -= 360.0;
        } else if longitude < -180.0 {
            longitude += 360.0;
        }
        Self {
            latitude,
            longitude: longitude.clamp(-180.0, 180.0),
        }
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.latitude, self.longitude)
    }
}

/// Haversine distance between two points given in decimal degrees, in km.
#[must_use]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}
