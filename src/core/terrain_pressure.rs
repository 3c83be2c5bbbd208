use crate::types::{AtmosError, AtmosResult};
use ndarray::Array2;

/// Elevation value marking missing DEM cells
pub const DEM_NODATA: i16 = -9999;

/// Standard sea-level pressure used by the barometric formula (mb)
pub const SEA_LEVEL_PRESSURE_MB: f32 = 1013.2;

/// Pressure substituted for missing DEM cells, and the reference of the fusion rule (mb)
pub const REFERENCE_PRESSURE_MB: f32 = 1013.0;

/// Atmospheric scale height (m)
pub const SCALE_HEIGHT_M: f32 = 8000.0;

/// Global elevation grid with north-up rows, nearest-cell lookup
#[derive(Debug, Clone)]
pub struct DemGrid {
    elevations: Array2<i16>, // meters, rows from lat_max southwards
    lat_max: f64,
    lon_min: f64,
    lat_step: f64, // degrees per row, positive
    lon_step: f64, // degrees per column, positive
}

impl DemGrid {
    /// Rows and columns of the 0.05 degree climate modelling grid
    pub const CMG_ROWS: usize = 3600;
    pub const CMG_COLS: usize = 7200;

    pub fn new(
        elevations: Array2<i16>,
        lat_max: f64,
        lon_min: f64,
        lat_step: f64,
        lon_step: f64,
    ) -> AtmosResult<Self> {
        let (rows, cols) = elevations.dim();
        if rows == 0 || cols == 0 {
            return Err(AtmosError::InvalidInput("DEM grid is empty".to_string()));
        }
        if !(lat_step > 0.0) || !(lon_step > 0.0) {
            return Err(AtmosError::InvalidInput(format!(
                "DEM grid spacing must be positive, got {} x {}",
                lat_step, lon_step
            )));
        }
        Ok(Self {
            elevations,
            lat_max,
            lon_min,
            lat_step,
            lon_step,
        })
    }

    /// Global 0.05 degree grid covering 90N..90S, 180W..180E
    pub fn global_cmg(elevations: Array2<i16>) -> AtmosResult<Self> {
        if elevations.dim() != (Self::CMG_ROWS, Self::CMG_COLS) {
            return Err(AtmosError::InvalidInput(format!(
                "global DEM must be {}x{}, got {:?}",
                Self::CMG_ROWS,
                Self::CMG_COLS,
                elevations.dim()
            )));
        }
        Self::new(elevations, 90.0, -180.0, 0.05, 0.05)
    }

    pub fn dim(&self) -> (usize, usize) {
        self.elevations.dim()
    }

    /// Elevation of the cell nearest to (lat, lon), index clamped to the grid
    pub fn elevation_at(&self, lat: f64, lon: f64) -> i16 {
        let (rows, cols) = self.elevations.dim();
        let row = nearest_index((self.lat_max - lat) / self.lat_step, rows);
        let col = nearest_index((lon - self.lon_min) / self.lon_step, cols);
        self.elevations[[row, col]]
    }
}

fn nearest_index(pos: f64, len: usize) -> usize {
    let idx = (pos + 0.5).floor();
    if idx < 0.0 {
        0
    } else {
        (idx as usize).min(len - 1)
    }
}

/// Surface pressure from terrain height
#[derive(Debug, Clone)]
pub struct TerrainPressureModel {
    dem: DemGrid,
}

impl TerrainPressureModel {
    pub fn new(dem: DemGrid) -> Self {
        Self { dem }
    }

    pub fn dem(&self) -> &DemGrid {
        &self.dem
    }

    /// Barometric surface pressure (mb) at (lat, lon).
    ///
    /// Missing DEM cells give the sea-level fallback of 1013 mb.
    pub fn surface_pressure(&self, lat: f64, lon: f64) -> f32 {
        pressure_from_elevation(self.dem.elevation_at(lat, lon))
    }
}

/// `P0 * exp(-z/H)`, with the no-data sentinel mapped to 1013 mb
pub fn pressure_from_elevation(elevation: i16) -> f32 {
    if elevation == DEM_NODATA {
        REFERENCE_PRESSURE_MB
    } else {
        SEA_LEVEL_PRESSURE_MB * (-(elevation as f32) / SCALE_HEIGHT_M).exp()
    }
}

/// Scale a reanalysis pressure by the local terrain pressure.
///
/// Both values must be positive for the correction to apply; otherwise the
/// reanalysis pressure is returned unchanged.
pub fn fuse_surface_pressure(spres_anc: f32, spres_dem: f32) -> f32 {
    if spres_anc > 0.0 && spres_dem > 0.0 {
        spres_dem * spres_anc / REFERENCE_PRESSURE_MB
    } else {
        spres_anc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_dem() -> DemGrid {
        // 4 rows x 8 cols of 1 degree, cell value = 100*row + col
        let elev = Array2::from_shape_fn((4, 8), |(r, c)| (100 * r + c) as i16);
        DemGrid::new(elev, 2.0, -4.0, 1.0, 1.0).unwrap()
    }

    #[test]
    fn test_sea_level_pressure() {
        assert_eq!(pressure_from_elevation(0), 1013.2);
        assert_eq!(pressure_from_elevation(DEM_NODATA), 1013.0);
    }

    #[test]
    fn test_pressure_decreases_with_height() {
        let p = pressure_from_elevation(8000);
        assert_relative_eq!(p, 1013.2 / std::f32::consts::E, epsilon = 1e-3);
    }

    #[test]
    fn test_nearest_cell_lookup() {
        let dem = ramp_dem();
        assert_eq!(dem.elevation_at(2.0, -4.0), 0);
        // 0.6 rows down rounds to row 1, 2.4 cols right rounds to col 2
        assert_eq!(dem.elevation_at(1.4, -1.6), 102);
        // Clamped outside the grid
        assert_eq!(dem.elevation_at(50.0, -100.0), 0);
        assert_eq!(dem.elevation_at(-50.0, 100.0), 307);
    }

    #[test]
    fn test_model_uses_dem() {
        let mut elev = Array2::zeros((4, 8));
        elev[[1, 1]] = DEM_NODATA;
        let model = TerrainPressureModel::new(DemGrid::new(elev, 2.0, -4.0, 1.0, 1.0).unwrap());
        assert_eq!(model.surface_pressure(1.2, -3.2), 1013.0);
        assert_eq!(model.surface_pressure(2.0, -4.0), 1013.2);
    }

    #[test]
    fn test_fusion_rule() {
        assert_relative_eq!(fuse_surface_pressure(1000.0, 900.0), 900.0 * 1000.0 / 1013.0);
        assert_relative_eq!(fuse_surface_pressure(1000.0, 900.0), 888.45, epsilon = 0.01);
        assert_eq!(fuse_surface_pressure(1000.0, 0.0), 1000.0);
        assert_eq!(fuse_surface_pressure(-1.0, 900.0), -1.0);
    }

    #[test]
    fn test_global_cmg_shape_checked() {
        assert!(DemGrid::global_cmg(Array2::zeros((10, 10))).is_err());
    }
}
