//! Location resolution and search-area tiling.
//!
//! - [`geocoder`] turns a free-form location into coordinates through a
//!   Nominatim-compatible service, behind one process-wide [`RateGate`].
//! - [`grid`] tiles a search radius with overlapping fixed-size cells.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod error;
pub mod geocoder;
pub mod grid;
pub mod rate_gate;

pub use error::{GeoError, Result};
pub use geocoder::{Geocode, GeocodeResult, NominatimGeocoder};
pub use grid::{estimate_supplement_calls, generate_grid, GridCell};
pub use rate_gate::RateGate;
