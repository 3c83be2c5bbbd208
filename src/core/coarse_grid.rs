use crate::core::ancillary::AncillarySet;
use crate::core::terrain_pressure::{fuse_surface_pressure, TerrainPressureModel};
use crate::io::raster::{GeoPoint, Projector};
use crate::types::{AtmosResult, ImageSize, RegionSize, SceneMetadata};
use ndarray::Array2;

/// Geometry and atmosphere of one coarse region, sampled at its centre
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoarseCell {
    pub lat: f64,
    pub lon: f64,
    pub sun_zenith: f32,       // degrees
    pub view_zenith: f32,      // degrees
    pub relative_azimuth: f32, // degrees
    pub water_vapor: f32,      // g/cm2
    pub ozone: f32,            // cm-atm
    pub surface_pressure: f32, // mb, terrain corrected
    pub dem_pressure: f32,     // mb, 0 without a DEM
    pub valid: bool,
}

/// Inputs shared by every cell of the grid
pub struct CoarseGridInputs<'a> {
    pub projector: &'a dyn Projector,
    pub ancillary: &'a AncillarySet,
    pub terrain: Option<&'a TerrainPressureModel>,
    pub scene: &'a SceneMetadata,
    pub gmt: f32,
    pub view_zenith: f32,
}

/// Downsampled grid of `ceil(lines/R) x ceil(samples/S)` regions
#[derive(Debug, Clone)]
pub struct CoarseGrid {
    pub region: RegionSize,
    pub image: ImageSize,
    pub cells: Array2<CoarseCell>,
}

impl CoarseGrid {
    pub fn build(image: ImageSize, region: RegionSize, inputs: &CoarseGridInputs) -> AtmosResult<Self> {
        let (rows, cols) = region.coarse_dims(&image);
        log::info!("Building {}x{} coarse grid ({}x{} pixel regions)", rows, cols, region.lines, region.samples);

        let sun_zenith = inputs.scene.sun_zenith;
        let relative_azimuth = inputs.scene.corrected_sun_azimuth();
        let day_of_year = inputs.scene.day_of_year();

        let mut cells = Array2::from_elem((rows, cols), CoarseCell::default());
        let mut sum_spres_anc = 0.0f64;
        let mut nb_spres_anc = 0usize;
        let mut sum_spres_dem = 0.0f64;
        let mut nb_spres_dem = 0usize;

        for il in 0..rows {
            let line = (il * region.lines) as f64 + region.lines as f64 / 2.0;
            for is in 0..cols {
                let sample = (is * region.samples) as f64 + region.samples as f64 / 2.0;
                let geo = inputs.projector.to_geographic(line, sample)?;
                let cell = &mut cells[[il, is]];
                if !(geo.lat.is_finite() && geo.lon.is_finite()) {
                    continue;
                }

                let spres_anc = inputs.ancillary.surface_pressure(geo.lat, geo.lon, inputs.gmt)?;
                if spres_anc > 0.0 {
                    sum_spres_anc += spres_anc as f64;
                    nb_spres_anc += 1;
                }
                let spres_dem = inputs
                    .terrain
                    .map_or(0.0, |t| t.surface_pressure(geo.lat, geo.lon));
                if spres_dem > 0.0 {
                    sum_spres_dem += spres_dem as f64;
                    nb_spres_dem += 1;
                }

                *cell = CoarseCell {
                    lat: geo.lat,
                    lon: geo.lon,
                    sun_zenith,
                    view_zenith: inputs.view_zenith,
                    relative_azimuth,
                    water_vapor: inputs.ancillary.water_vapor(geo.lat, geo.lon, inputs.gmt)?,
                    ozone: inputs.ancillary.ozone(geo.lat, geo.lon, inputs.gmt, day_of_year),
                    surface_pressure: fuse_surface_pressure(spres_anc, spres_dem),
                    dem_pressure: spres_dem,
                    valid: true,
                };
            }
        }

        if nb_spres_anc > 0 {
            log::debug!("Mean reanalysis pressure: {:.2} mb", sum_spres_anc / nb_spres_anc as f64);
        }
        if nb_spres_dem > 0 {
            log::debug!("Mean DEM pressure: {:.2} mb", sum_spres_dem / nb_spres_dem as f64);
        }

        Ok(Self { region, image, cells })
    }

    pub fn rows(&self) -> usize {
        self.cells.dim().0
    }

    pub fn cols(&self) -> usize {
        self.cells.dim().1
    }

    pub fn cell(&self, row: usize, col: usize) -> &CoarseCell {
        &self.cells[[row, col]]
    }
}

/// Geographic position of the image centre
pub fn scene_center(projector: &dyn Projector, image: ImageSize) -> AtmosResult<GeoPoint> {
    projector.to_geographic(image.lines as f64 / 2.0, image.samples as f64 / 2.0)
}

/// Angle (degrees, clockwise) between image-up and true north at the image centre.
///
/// A point 100 lines above the centre is moved onto the centre's meridian
/// and projected back; the offset of that point from the centre gives the
/// direction of true north in image space.
pub fn true_north_adjustment(projector: &dyn Projector, image: ImageSize) -> AtmosResult<f64> {
    let center_line = image.lines as f64 / 2.0;
    let center_sample = image.samples as f64 / 2.0;
    let center = projector.to_geographic(center_line, center_sample)?;

    let up = projector.to_geographic(center_line - 100.0, center_sample)?;
    let (line, sample) = projector.to_image(GeoPoint {
        lat: up.lat,
        lon: center.lon,
    })?;

    let delta_y = center_line - line;
    let delta_x = sample - center_sample;
    let adjust_north = (delta_x / delta_y).atan().to_degrees();
    log::debug!("True north adjustment: {:.4} degrees", adjust_north);
    Ok(adjust_north)
}
