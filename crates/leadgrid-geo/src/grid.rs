//! Search grid generation.
//!
//! A map search only returns listings near its center, so a large radius is
//! tiled with overlapping cells of at most `max_cell_radius_km`. Cells sit on
//! a hexagonal lattice, which covers a disc with fewer cells than a square
//! one for the same worst-case gap.

use leadgrid_core::{Coordinates, MIN_CELL_RADIUS_KM};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Overlap fractions outside this range are clamped.
const MAX_OVERLAP: f64 = 0.5;

/// One search cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    /// Position in processing order (nearest to the center first)
    pub index: usize,
    /// Cell center
    pub center: Coordinates,
    /// Radius covered by this cell
    pub radius_km: f64,
    /// Distance from the grid center
    pub distance_km: f64,
}

impl GridCell {
    /// Radius in whole meters, as search APIs expect.
    #[must_use]
    pub fn radius_m(&self) -> u32 {
        // Bounded by the 50 km request limit, well inside u32.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meters = (self.radius_km * 1000.0).round().max(0.0) as u32;
        meters
    }
}

/// Tile a disc of `radius_km` around `center` with search cells.
///
/// - `max_cell_radius_km` is first raised to [`MIN_CELL_RADIUS_KM`] if
///   smaller, which bounds the cell count for any radius.
/// - If `radius_km <= max_cell_radius_km`, a single cell at `center` with
///   the requested radius is returned.
/// - Otherwise cells of `max_cell_radius_km` are laid out on a hexagonal
///   lattice with spacing `2·C·(1 - f)`, capped at `√3·C` so neighbouring
///   cells always meet. Candidates farther than `R + margin` from the center
///   are dropped, where the margin is `C·f` or the lattice covering radius,
///   whichever is larger. Cells are returned nearest first.
#[must_use]
pub fn generate_grid(
    center: Coordinates,
    radius_km: f64,
    max_cell_radius_km: f64,
    overlap_factor: f64,
) -> Vec<GridCell> {
    let overlap = if overlap_factor.is_finite() {
        overlap_factor.clamp(0.0, MAX_OVERLAP)
    } else {
        0.0
    };
    let cell_radius = if max_cell_radius_km.is_finite() {
        max_cell_radius_km.max(MIN_CELL_RADIUS_KM)
    } else {
        MIN_CELL_RADIUS_KM
    };
    let radius_km = radius_km.max(0.0);

    if radius_km <= cell_radius {
        return vec![GridCell {
            index: 0,
            center,
            radius_km,
            distance_km: 0.0,
        }];
    }

    let step = (2.0 * cell_radius * (1.0 - overlap)).min(3f64.sqrt() * cell_radius);
    let covering_radius = step / 3f64.sqrt();
    let keep_within = radius_km + (cell_radius * overlap).max(covering_radius);

    let row_spacing = step * 3f64.sqrt() / 2.0;
    // Bounded by the 50 km request limit; these are small positive counts.
    #[allow(clippy::cast_possible_truncation)]
    let rows = (keep_within / row_spacing).ceil() as i64 + 1;
    #[allow(clippy::cast_possible_truncation)]
    let cols = (keep_within / step).ceil() as i64 + 1;

    let mut seen = HashSet::new();
    let mut cells = Vec::new();

    for row in -rows..=rows {
        #[allow(clippy::cast_precision_loss)]
        let north = row as f64 * row_spacing;
        let shift = if row.rem_euclid(2) == 1 { step / 2.0 } else { 0.0 };

        for col in -cols..=cols {
            #[allow(clippy::cast_precision_loss)]
            let east = col as f64 * step + shift;
            let point = center.offset_km(north, east);
            let distance_km = center.distance_km(&point);
            if distance_km > keep_within {
                continue;
            }

            #[allow(clippy::cast_possible_truncation)]
            let key = (
                (point.latitude * 1e6).round() as i64,
                (point.longitude * 1e6).round() as i64,
            );
            if !seen.insert(key) {
                continue;
            }

            cells.push(GridCell {
                index: 0,
                center: point,
                radius_km: cell_radius,
                distance_km,
            });
        }
    }

    cells.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then(a.center.latitude.total_cmp(&b.center.latitude))
            .then(a.center.longitude.total_cmp(&b.center.longitude))
    });
    for (index, cell) in cells.iter_mut().enumerate() {
        cell.index = index;
    }

    tracing::debug!(
        "Generated {} cells for radius {:.1} km (cell radius {:.1} km, step {:.2} km)",
        cells.len(),
        radius_km,
        cell_radius,
        step
    );
    cells
}

/// Supplementary API calls needed to cover `cells` (one per cell).
#[must_use]
pub fn estimate_supplement_calls(cells: &[GridCell]) -> u64 {
    cells.len() as u64
}
