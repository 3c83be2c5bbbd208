//! Gridded ancillary fields (reanalysis pressure, water vapour, ozone, air
//! temperature) sampled in space and time at arbitrary scene locations.

use crate::types::{AtmosError, AtmosResult};
use ndarray::Array3;
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Linear interpolation between `a` and `b`
pub(crate) fn lerp<T: Float>(a: T, b: T, t: T) -> T {
    (T::one() - t) * a + t * b
}

/// Ancillary quantity carried by a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AncillaryKind {
    SurfacePressure,
    WaterVapor,
    Ozone,
    AirTemperature,
}

impl AncillaryKind {
    /// Factor converting the provider's native units into working units
    /// (Pa -> mb, kg/m2 -> g/cm2, Dobson-like -> cm-atm).
    pub fn unit_scale(self) -> f32 {
        match self {
            AncillaryKind::SurfacePressure => 0.01,
            AncillaryKind::WaterVapor => 0.1,
            AncillaryKind::Ozone => 0.001,
            AncillaryKind::AirTemperature => 1.0,
        }
    }
}

impl std::fmt::Display for AncillaryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AncillaryKind::SurfacePressure => write!(f, "surface pressure"),
            AncillaryKind::WaterVapor => write!(f, "water vapor"),
            AncillaryKind::Ozone => write!(f, "ozone"),
            AncillaryKind::AirTemperature => write!(f, "air temperature"),
        }
    }
}

/// Regular lat/lon grid on which a field is defined
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub lat_first: f64, // latitude of row 0 (degrees)
    pub lat_step: f64,  // signed, negative for north-to-south rows
    pub lon_first: f64, // longitude of column 0 (degrees)
    pub lon_step: f64,  // positive, degrees
    pub rows: usize,
    pub cols: usize,
}

impl GridGeometry {
    /// NCEP reanalysis 2.5 degree global grid (90N..90S, 0E..357.5E)
    pub fn ncep_reanalysis() -> Self {
        Self {
            lat_first: 90.0,
            lat_step: -2.5,
            lon_first: 0.0,
            lon_step: 2.5,
            rows: 73,
            cols: 144,
        }
    }

    /// Fractional (row, col) of a point, longitude wrapped onto the grid origin
    fn fractional_index(&self, lat: f64, lon: f64) -> (f64, f64) {
        let row = (lat - self.lat_first) / self.lat_step;
        let lon = self.lon_first + (lon - self.lon_first).rem_euclid(360.0);
        let col = (lon - self.lon_first) / self.lon_step;
        (row, col)
    }
}

/// Lower bracketing index and weight along one axis, clamped to the grid
fn bracket(pos: f64, len: usize) -> (usize, usize, f64) {
    if len < 2 || pos <= 0.0 {
        return (0, 0, 0.0);
    }
    let last = len - 1;
    if pos >= last as f64 {
        return (last, last, 0.0);
    }
    let i0 = pos.floor() as usize;
    (i0, i0 + 1, pos - i0 as f64)
}

/// One gridded ancillary quantity over several time layers
#[derive(Debug, Clone)]
pub struct AncillaryField {
    pub kind: AncillaryKind,
    pub geometry: GridGeometry,
    /// Values in working units (time x lat x lon)
    pub values: Array3<f32>,
    /// Layer times in GMT hours
    pub time: Vec<f32>,
    /// Spacing of the layers in hours
    pub timeres: f32,
}

impl AncillaryField {
    /// Create a field whose values are already in working units
    pub fn new(
        kind: AncillaryKind,
        geometry: GridGeometry,
        values: Array3<f32>,
        time: Vec<f32>,
        timeres: f32,
    ) -> AtmosResult<Self> {
        let (nblayers, rows, cols) = values.dim();
        if nblayers == 0 || rows == 0 || cols == 0 {
            return Err(AtmosError::Ancillary(format!("{} field is empty", kind)));
        }
        if rows != geometry.rows || cols != geometry.cols {
            return Err(AtmosError::Ancillary(format!(
                "{} field is {}x{} but its grid is {}x{}",
                kind, rows, cols, geometry.rows, geometry.cols
            )));
        }
        if time.len() != nblayers {
            return Err(AtmosError::Ancillary(format!(
                "{} field has {} layers but {} layer times",
                kind,
                nblayers,
                time.len()
            )));
        }
        if nblayers > 1 && !(timeres > 0.0) {
            return Err(AtmosError::Ancillary(format!(
                "{} field has invalid time resolution {}",
                kind, timeres
            )));
        }

        Ok(Self {
            kind,
            geometry,
            values,
            time,
            timeres,
        })
    }

    /// Create a field from values in the provider's native units
    pub fn from_native_units(
        kind: AncillaryKind,
        geometry: GridGeometry,
        mut values: Array3<f32>,
        time: Vec<f32>,
        timeres: f32,
    ) -> AtmosResult<Self> {
        let scale = kind.unit_scale();
        values.mapv_inplace(|v| v * scale);
        Self::new(kind, geometry, values, time, timeres)
    }

    pub fn nb_layers(&self) -> usize {
        self.values.dim().0
    }

    /// Bilinear value of every time layer at (lat, lon)
    pub fn interpolate_spatial(&self, lat: f64, lon: f64) -> Vec<f32> {
        let (row, col) = self.geometry.fractional_index(lat, lon);
        let (r0, r1, dr) = bracket(row, self.geometry.rows);
        let (c0, c1, dc) = bracket(col, self.geometry.cols);
        let (dr, dc) = (dr as f32, dc as f32);

        (0..self.nb_layers())
            .map(|t| {
                let top = lerp(self.values[[t, r0, c0]], self.values[[t, r0, c1]], dc);
                let bottom = lerp(self.values[[t, r1, c0]], self.values[[t, r1, c1]], dc);
                lerp(top, bottom, dr)
            })
            .collect()
    }

    /// Interpolate per-layer values to `gmt` hours.
    ///
    /// Past the last layer the last interval is extrapolated linearly.
    pub fn interpolate_time(&self, layers: &[f32], gmt: f32) -> f32 {
        let nblayers = layers.len();
        if nblayers == 1 {
            return layers[0];
        }
        let mut k = (gmt / self.timeres).floor().max(0.0) as usize;
        if k >= nblayers - 1 {
            k = nblayers - 2;
        }
        let coef = (gmt - self.time[k]) / self.timeres;
        lerp(layers[k], layers[k + 1], coef)
    }

    /// Field value at (lat, lon) and `gmt` hours
    pub fn sample(&self, lat: f64, lon: f64, gmt: f32) -> f32 {
        let layers = self.interpolate_spatial(lat, lon);
        self.interpolate_time(&layers, gmt)
    }
}

/// Zonal ozone climatology (cm-atm), months x 10 degree bands from 80S to 80N.
/// London et al. (1976), Atlas of the global distribution of total ozone.
const OZONE_CLIMATOLOGY: [[f32; 17]; 12] = [
    [0.315, 0.320, 0.315, 0.305, 0.300, 0.280, 0.260, 0.240, 0.240, 0.240, 0.250, 0.280, 0.320, 0.350, 0.375, 0.380, 0.380],
    [0.280, 0.300, 0.300, 0.300, 0.280, 0.270, 0.260, 0.240, 0.240, 0.240, 0.260, 0.300, 0.340, 0.380, 0.400, 0.420, 0.420],
    [0.280, 0.280, 0.280, 0.280, 0.280, 0.260, 0.250, 0.240, 0.250, 0.250, 0.270, 0.300, 0.340, 0.400, 0.420, 0.440, 0.440],
    [0.280, 0.280, 0.280, 0.280, 0.280, 0.260, 0.250, 0.250, 0.250, 0.260, 0.280, 0.300, 0.340, 0.380, 0.420, 0.430, 0.430],
    [0.280, 0.290, 0.300, 0.300, 0.280, 0.270, 0.260, 0.250, 0.250, 0.260, 0.270, 0.300, 0.320, 0.360, 0.380, 0.400, 0.400],
    [0.280, 0.300, 0.300, 0.305, 0.300, 0.280, 0.260, 0.250, 0.250, 0.260, 0.260, 0.280, 0.310, 0.330, 0.360, 0.370, 0.370],
    [0.290, 0.300, 0.315, 0.320, 0.305, 0.280, 0.260, 0.250, 0.240, 0.240, 0.260, 0.270, 0.290, 0.310, 0.320, 0.320, 0.320],
    [0.300, 0.310, 0.320, 0.325, 0.320, 0.300, 0.270, 0.260, 0.240, 0.240, 0.250, 0.260, 0.280, 0.290, 0.300, 0.300, 0.290],
    [0.300, 0.320, 0.325, 0.335, 0.320, 0.300, 0.280, 0.260, 0.240, 0.240, 0.240, 0.260, 0.270, 0.280, 0.280, 0.280, 0.280],
    [0.320, 0.340, 0.350, 0.345, 0.330, 0.300, 0.280, 0.260, 0.240, 0.240, 0.240, 0.260, 0.260, 0.280, 0.280, 0.280, 0.280],
    [0.360, 0.360, 0.360, 0.340, 0.320, 0.300, 0.280, 0.260, 0.240, 0.240, 0.240, 0.260, 0.280, 0.300, 0.310, 0.310, 0.300],
    [0.340, 0.350, 0.340, 0.320, 0.310, 0.280, 0.260, 0.250, 0.240, 0.240, 0.240, 0.260, 0.300, 0.320, 0.330, 0.340, 0.330],
];

/// Ozone used poleward of the climatology's coverage
const POLAR_OZONE: f32 = 0.270;

/// Climatological total ozone (cm-atm) for a day of year and latitude
pub fn ozone_climatology(day_of_year: u32, lat: f64) -> f32 {
    if lat.abs() >= 80.0 {
        return POLAR_OZONE;
    }
    let jday = day_of_year as f64;

    // Months are centred on day 15 + 30.5*m, latitude bands on multiples of 10
    let month_inf = ((jday - 15.0) / 30.5).floor();
    let lat_inf = (lat * 0.1).floor();
    let t = ((jday - 15.0) - 30.5 * month_inf) / 30.5;
    let u = (lat - 10.0 * lat_inf) * 0.1;

    let i1 = (month_inf as i64).rem_euclid(12) as usize;
    let i2 = (i1 + 1) % 12;
    let j1 = (lat_inf as i64 + 8) as usize;
    let j2 = j1 + 1;

    let oz = &OZONE_CLIMATOLOGY;
    let (t, u) = (t as f32, u as f32);
    (1.0 - t) * (1.0 - u) * oz[i1][j1]
        + t * (1.0 - u) * oz[i2][j1]
        + t * u * oz[i2][j2]
        + (1.0 - t) * u * oz[i1][j2]
}

/// The ancillary fields a scene needs; ozone is optional
#[derive(Debug, Clone, Default)]
pub struct AncillarySet {
    pub surface_pressure: Option<AncillaryField>,
    pub water_vapor: Option<AncillaryField>,
    pub air_temperature: Option<AncillaryField>,
    pub ozone: Option<AncillaryField>,
}

impl AncillarySet {
    /// Check that every required field is present and of the right kind
    pub fn validate(&self) -> AtmosResult<()> {
        let required = [
            (&self.surface_pressure, AncillaryKind::SurfacePressure),
            (&self.water_vapor, AncillaryKind::WaterVapor),
            (&self.air_temperature, AncillaryKind::AirTemperature),
        ];
        for (field, kind) in required {
            match field {
                None => {
                    return Err(AtmosError::Ancillary(format!("missing {} source", kind)));
                }
                Some(f) if f.kind != kind => {
                    return Err(AtmosError::Ancillary(format!(
                        "{} source holds {} values",
                        kind, f.kind
                    )));
                }
                _ => {}
            }
        }
        if let Some(oz) = &self.ozone {
            if oz.kind != AncillaryKind::Ozone {
                return Err(AtmosError::Ancillary(format!("ozone source holds {} values", oz.kind)));
            }
        } else {
            log::warn!("No ozone source, using zonal ozone climatology");
        }
        Ok(())
    }

    fn required<'a>(
        field: &'a Option<AncillaryField>,
        kind: AncillaryKind,
    ) -> AtmosResult<&'a AncillaryField> {
        field
            .as_ref()
            .ok_or_else(|| AtmosError::Ancillary(format!("missing {} source", kind)))
    }

    pub fn surface_pressure(&self, lat: f64, lon: f64, gmt: f32) -> AtmosResult<f32> {
        let field = Self::required(&self.surface_pressure, AncillaryKind::SurfacePressure)?;
        Ok(field.sample(lat, lon, gmt))
    }

    pub fn water_vapor(&self, lat: f64, lon: f64, gmt: f32) -> AtmosResult<f32> {
        let field = Self::required(&self.water_vapor, AncillaryKind::WaterVapor)?;
        Ok(field.sample(lat, lon, gmt))
    }

    pub fn air_temperature(&self, lat: f64, lon: f64, gmt: f32) -> AtmosResult<f32> {
        let field = Self::required(&self.air_temperature, AncillaryKind::AirTemperature)?;
        Ok(field.sample(lat, lon, gmt))
    }

    /// Ozone from the supplied field, or the climatology when absent
    pub fn ozone(&self, lat: f64, lon: f64, gmt: f32, day_of_year: u32) -> f32 {
        match &self.ozone {
            Some(field) => field.sample(lat, lon, gmt),
            None => ozone_climatology(day_of_year, lat),
        }
    }
}
