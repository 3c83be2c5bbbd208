//! Two-pass cloud and cloud-shadow screening.
//!
//! Pass 1 gathers clear-sky brightness temperature and SWIR statistics on
//! 5 km diagnostic cells. Pass 2 classifies each pixel against those
//! statistics into a three-block rotating buffer, grows clouds, casts their
//! shadows and streams completed blocks to the scratch mask file.

use crate::core::atmos_coef::{AtmosCoefficientGrid, AtmosCoefficients};
use crate::io::raster::{LineBlock, INPUT_QA_FILL_BIT};
use crate::io::scratch::MaskWriter;
use crate::types::{
    mask_bits, AtmosError, AtmosResult, ImageSize, RegionSize, BAND_BLUE, BAND_GREEN, BAND_NIR,
    BAND_RED, BAND_SWIR1, BAND_SWIR2, NB_REFLECTIVE_BANDS, REFLECTANCE_SCALE,
};
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Value of diagnostic statistics for cells without clear observations
pub const DIAG_FILL: f32 = -9999.0;

/// Cloud screening parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudScreeningParams {
    /// Diagnostic cell size in lines and samples
    pub diag_cell_lines: usize,
    pub diag_cell_samples: usize,
    /// Radius of the cloud and shadow dilations (pixels)
    pub dilation_radius: usize,
    /// Brightness temperature per thermal count (K)
    pub thermal_scale: f32,
    /// Blue - red/2 anomaly below which a pixel may be clear
    pub clear_anomaly_max: f32,
    /// Clear pixels are at most this much colder than the 2 m air (K)
    pub clear_temp_margin: f32,
    /// Blue - red/2 anomaly above which a cold pixel is cloud
    pub cloud_anomaly_min: f32,
    /// Cloud when colder than clear mean - sigma * std - offset
    pub cloud_temp_sigma: f32,
    pub cloud_temp_offset: f32,
    /// Red reflectance above which a cold pixel is cloud
    pub bright_red_min: f32,
    /// Visible-only cloud rule used without a thermal band
    pub visible_anomaly_min: f32,
    pub visible_swir1_min: f32,
    /// Water: low NDVI and dark NIR
    pub water_ndvi_max: f32,
    pub water_nir_max: f32,
    /// Snow: high NDSI, bright NIR
    pub snow_ndsi_min: f32,
    pub snow_nir_min: f32,
    /// Dark dense vegetation window on band 7 surface reflectance
    pub ddv_swir2_min: f32,
    pub ddv_swir2_max: f32,
    pub ddv_ndvi_min: f32,
    /// Cloud top height model
    pub lapse_rate: f32,       // K/km
    pub min_cloud_height: f32, // km
    pub max_cloud_height: f32, // km
}

impl Default for CloudScreeningParams {
    fn default() -> Self {
        Self {
            diag_cell_lines: 167,       // 5 km at 30 m
            diag_cell_samples: 167,
            dilation_radius: 5,
            thermal_scale: 0.1,         // 0.1 K counts
            clear_anomaly_max: 0.03,
            clear_temp_margin: 20.0,
            cloud_anomaly_min: 0.03,
            cloud_temp_sigma: 3.0,
            cloud_temp_offset: 2.0,
            bright_red_min: 0.5,
            visible_anomaly_min: 0.1,
            visible_swir1_min: 0.3,
            water_ndvi_max: 0.1,
            water_nir_max: 0.05,
            snow_ndsi_min: 0.4,
            snow_nir_min: 0.11,
            ddv_swir2_min: 0.015,
            ddv_swir2_max: 0.05,
            ddv_ndvi_min: 0.1,
            lapse_rate: 6.4,            // moist adiabatic
            min_cloud_height: 0.2,
            max_cloud_height: 12.0,
        }
    }
}

fn normalized_difference(a: f32, b: f32) -> f32 {
    let sum = a + b;
    if sum.abs() < f32::EPSILON {
        0.0
    } else {
        (a - b) / sum
    }
}

/// Background-corrected surface reflectance of one pixel
fn pixel_reflectance(coefs: &[AtmosCoefficients], dn: ArrayView1<'_, i16>) -> [f32; NB_REFLECTIVE_BANDS] {
    let mut rho = [0.0f32; NB_REFLECTIVE_BANDS];
    for ((r, c), v) in rho.iter_mut().zip(coefs.iter()).zip(dn.iter()) {
        *r = c.surface_reflectance(*v as f32 / REFLECTANCE_SCALE);
    }
    rho
}

impl CloudScreeningParams {
    fn is_water(&self, rho: &[f32; NB_REFLECTIVE_BANDS]) -> bool {
        normalized_difference(rho[BAND_NIR], rho[BAND_RED]) < self.water_ndvi_max
            && rho[BAND_NIR] < self.water_nir_max
    }

    fn is_snow(&self, rho: &[f32; NB_REFLECTIVE_BANDS]) -> bool {
        normalized_difference(rho[BAND_GREEN], rho[BAND_SWIR1]) > self.snow_ndsi_min
            && rho[BAND_NIR] > self.snow_nir_min
    }

    fn anomaly(rho: &[f32; NB_REFLECTIVE_BANDS]) -> f32 {
        rho[BAND_BLUE] - rho[BAND_RED] / 2.0
    }
}

/// Clear-sky statistics at one location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearSkyStats {
    pub t6_mean: f32,
    pub t6_std: f32,
    pub b7_mean: f32,
    pub b7_std: f32,
    pub airtemp: f32,
    /// False when no diagnostic cell near the point saw clear sky
    pub has_clear: bool,
}

/// Clear-sky statistics on the 5 km diagnostic grid
#[derive(Debug, Clone)]
pub struct CloudDiagnostics {
    cell_lines: usize,
    cell_samples: usize,
    image: ImageSize,
    nb_clear: Array2<u32>,
    // t6, t6^2, b7, b7^2 per cell
    sums: Array3<f64>,
    t6_mean: Array2<f32>,
    t6_std: Array2<f32>,
    b7_mean: Array2<f32>,
    b7_std: Array2<f32>,
    airtemp: Array2<f32>,
    finalized: bool,
}

impl CloudDiagnostics {
    pub fn new(image: ImageSize, cell_lines: usize, cell_samples: usize) -> AtmosResult<Self> {
        if cell_lines == 0 || cell_samples == 0 {
            return Err(AtmosError::InvalidInput("diagnostic cell size must be positive".to_string()));
        }
        let rows = (image.lines + cell_lines - 1) / cell_lines;
        let cols = (image.samples + cell_samples - 1) / cell_samples;
        Ok(Self {
            cell_lines,
            cell_samples,
            image,
            nb_clear: Array2::zeros((rows, cols)),
            sums: Array3::zeros((rows, cols, 4)),
            t6_mean: Array2::zeros((rows, cols)),
            t6_std: Array2::zeros((rows, cols)),
            b7_mean: Array2::zeros((rows, cols)),
            b7_std: Array2::zeros((rows, cols)),
            airtemp: Array2::zeros((rows, cols)),
            finalized: false,
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.nb_clear.dim()
    }

    pub fn nb_clear(&self, row: usize, col: usize) -> u32 {
        self.nb_clear[[row, col]]
    }

    /// (t6 mean, t6 std, b7 mean, b7 std) of a finalized cell
    pub fn cell_stats(&self, row: usize, col: usize) -> (f32, f32, f32, f32) {
        (
            self.t6_mean[[row, col]],
            self.t6_std[[row, col]],
            self.b7_mean[[row, col]],
            self.b7_std[[row, col]],
        )
    }

    /// Add one clear-sky observation
    pub fn accumulate(&mut self, line: usize, sample: usize, t6: f32, b7: f32) {
        let (row, col) = (line / self.cell_lines, sample / self.cell_samples);
        self.nb_clear[[row, col]] += 1;
        let (t6, b7) = (t6 as f64, b7 as f64);
        let mut sums = self.sums.slice_mut(s![row, col, ..]);
        sums[0] += t6;
        sums[1] += t6 * t6;
        sums[2] += b7;
        sums[3] += b7 * b7;
    }

    /// Image position of a cell centre, clamped to the image
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let line = (row * self.cell_lines) as f64 + self.cell_lines as f64 / 2.0;
        let sample = (col * self.cell_samples) as f64 + self.cell_samples as f64 / 2.0;
        (
            line.min(self.image.lines as f64 - 1.0),
            sample.min(self.image.samples as f64 - 1.0),
        )
    }

    pub fn set_air_temperature(&mut self, row: usize, col: usize, value: f32) {
        self.airtemp[[row, col]] = value;
    }

    /// Turn the running sums into mean and standard deviation
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        for ((row, col), n) in self.nb_clear.indexed_iter() {
            let idx = [row, col];
            if *n == 0 {
                self.t6_mean[idx] = DIAG_FILL;
                self.t6_std[idx] = DIAG_FILL;
                self.b7_mean[idx] = DIAG_FILL;
                self.b7_std[idx] = DIAG_FILL;
                continue;
            }
            let sums = self.sums.slice(s![row, col, ..]);
            (self.t6_mean[idx], self.t6_std[idx]) = mean_std(sums[0], sums[1], *n);
            (self.b7_mean[idx], self.b7_std[idx]) = mean_std(sums[2], sums[3], *n);
        }
        self.finalized = true;
    }

    /// Replace empty cells by the mean of the nearest ring of observed cells.
    ///
    /// Returns the number of cells filled.
    pub fn fill_gaps(&mut self) -> usize {
        let (rows, cols) = self.dim();
        let observed = self.nb_clear.mapv(|n| n > 0);
        if !observed.iter().any(|o| *o) {
            return 0;
        }
        let source = (
            self.t6_mean.clone(),
            self.t6_std.clone(),
            self.b7_mean.clone(),
            self.b7_std.clone(),
        );

        let mut filled = 0;
        for row in 0..rows {
            for col in 0..cols {
                if observed[[row, col]] {
                    continue;
                }
                for radius in 1..rows.max(cols) {
                    let ring = ring_cells(row, col, radius, rows, cols);
                    let valid: Vec<(usize, usize)> =
                        ring.into_iter().filter(|&(r, c)| observed[[r, c]]).collect();
                    if valid.is_empty() {
                        continue;
                    }
                    let n = valid.len() as f32;
                    let mean_of = |a: &Array2<f32>| valid.iter().map(|&(r, c)| a[[r, c]]).sum::<f32>() / n;
                    self.t6_mean[[row, col]] = mean_of(&source.0);
                    self.t6_std[[row, col]] = mean_of(&source.1);
                    self.b7_mean[[row, col]] = mean_of(&source.2);
                    self.b7_std[[row, col]] = mean_of(&source.3);
                    filled += 1;
                    break;
                }
            }
        }
        filled
    }

    /// Bilinear clear-sky statistics at a pixel, skipping unfilled cells
    pub fn interpolate(&self, line: usize, sample: usize) -> ClearSkyStats {
        let (rows, cols) = self.dim();
        let (r0, r1, fr) = cell_bracket(line, self.cell_lines, rows);
        let (c0, c1, fc) = cell_bracket(sample, self.cell_samples, cols);
        let candidates = [
            (r0, c0, (1.0 - fr) * (1.0 - fc)),
            (r0, c1, (1.0 - fr) * fc),
            (r1, c0, fr * (1.0 - fc)),
            (r1, c1, fr * fc),
        ];

        let mut stats = ClearSkyStats {
            t6_mean: 0.0,
            t6_std: 0.0,
            b7_mean: 0.0,
            b7_std: 0.0,
            airtemp: 0.0,
            has_clear: false,
        };
        let mut sum_w = 0.0;
        let mut sum_w_air = 0.0;
        for (r, c, w) in candidates {
            if w <= 0.0 {
                continue;
            }
            stats.airtemp += w * self.airtemp[[r, c]];
            sum_w_air += w;
            if self.t6_mean[[r, c]] == DIAG_FILL {
                continue;
            }
            stats.t6_mean += w * self.t6_mean[[r, c]];
            stats.t6_std += w * self.t6_std[[r, c]];
            stats.b7_mean += w * self.b7_mean[[r, c]];
            stats.b7_std += w * self.b7_std[[r, c]];
            sum_w += w;
        }
        if sum_w_air > 0.0 {
            stats.airtemp /= sum_w_air;
        }
        if sum_w > 0.0 {
            stats.t6_mean /= sum_w;
            stats.t6_std /= sum_w;
            stats.b7_mean /= sum_w;
            stats.b7_std /= sum_w;
            stats.has_clear = true;
        }
        stats
    }
}

fn mean_std(sum: f64, sumsq: f64, n: u32) -> (f32, f32) {
    let nf = n as f64;
    let mean = sum / nf;
    let std = if n > 1 {
        ((sumsq - sum * sum / nf) / (nf - 1.0)).abs().sqrt()
    } else {
        0.0
    };
    (mean as f32, std as f32)
}

fn ring_cells(row: usize, col: usize, radius: usize, rows: usize, cols: usize) -> Vec<(usize, usize)> {
    let (row, col, radius) = (row as i64, col as i64, radius as i64);
    let mut cells = Vec::new();
    for r in (row - radius)..=(row + radius) {
        for c in (col - radius)..=(col + radius) {
            let on_ring = (r - row).abs() == radius || (c - col).abs() == radius;
            if on_ring && r >= 0 && c >= 0 && (r as usize) < rows && (c as usize) < cols {
                cells.push((r as usize, c as usize));
            }
        }
    }
    cells
}

/// Cells around `pos` whose centres bracket it, and the weight of the second
fn cell_bracket(pos: usize, cell: usize, len: usize) -> (usize, usize, f32) {
    let p = (pos as f64 + 0.5) / cell as f64 - 0.5;
    if len < 2 || p <= 0.0 {
        return (0, 0, 0.0);
    }
    let last = len - 1;
    if p >= last as f64 {
        return (last, last, 0.0);
    }
    let i0 = p.floor() as usize;
    (i0, i0 + 1, (p - i0 as f64) as f32)
}

/// One block of mask lines held by the rotating buffer
#[derive(Debug, Clone)]
pub struct MaskSlot {
    pub data: Array2<u8>,
    pub first_line: usize,
    pub nb_lines: usize,
}

impl MaskSlot {
    fn contains(&self, line: usize) -> bool {
        line >= self.first_line && line < self.first_line + self.nb_lines
    }

    /// The valid lines of the slot
    pub fn lines(&self) -> ArrayView2<'_, u8> {
        self.data.slice(s![..self.nb_lines, ..])
    }
}

/// Ring of three mask blocks: previous, current and next
#[derive(Debug, Clone)]
pub struct RotatingMaskBuffer {
    slots: [MaskSlot; 3],
    region_lines: usize,
    image_lines: usize,
}

impl RotatingMaskBuffer {
    pub const PREVIOUS: usize = 0;
    pub const CURRENT: usize = 1;
    pub const NEXT: usize = 2;

    pub fn new(region_lines: usize, samples: usize, image_lines: usize) -> Self {
        let slot = |first_line: usize, nb_lines: usize| MaskSlot {
            data: Array2::zeros((region_lines, samples)),
            first_line,
            nb_lines,
        };
        let first = image_lines.min(region_lines);
        let second = image_lines.saturating_sub(region_lines).min(region_lines);
        Self {
            slots: [slot(0, 0), slot(0, first), slot(region_lines, second)],
            region_lines,
            image_lines,
        }
    }

    pub fn slot(&self, idx: usize) -> &MaskSlot {
        &self.slots[idx]
    }

    pub fn get(&self, line: usize, sample: usize) -> Option<u8> {
        self.slots
            .iter()
            .find(|slot| slot.contains(line))
            .and_then(|slot| slot.data.get([line - slot.first_line, sample]).copied())
    }

    pub fn get_mut(&mut self, line: usize, sample: usize) -> Option<&mut u8> {
        self.slots
            .iter_mut()
            .find(|slot| slot.contains(line))
            .and_then(|slot| slot.data.get_mut([line - slot.first_line, sample]))
    }

    /// Pixels of slot `idx` carrying `bit`, in image coordinates
    fn pixels_with(&self, idx: usize, bit: u8) -> Vec<(usize, usize)> {
        let slot = &self.slots[idx];
        slot.lines()
            .indexed_iter()
            .filter(|(_, v)| **v & bit != 0)
            .map(|((l, s), _)| (slot.first_line + l, s))
            .collect()
    }

    /// Set `target` within `radius` of every pixel of slot `idx` carrying `source`
    pub fn dilate(&mut self, idx: usize, source: u8, target: u8, radius: usize) {
        let samples = self.slots[idx].data.dim().1;
        for (line, sample) in self.pixels_with(idx, source) {
            let l_start = line.saturating_sub(radius);
            let s_start = sample.saturating_sub(radius);
            let s_end = (sample + radius).min(samples.saturating_sub(1));
            for l in l_start..=line + radius {
                for s in s_start..=s_end {
                    if let Some(v) = self.get_mut(l, s) {
                        *v |= target;
                    }
                }
            }
        }
    }

    /// Drop the oldest block, reuse it zeroed as the new next block
    pub fn rotate(&mut self) {
        self.slots.rotate_left(1);
        let first_line = self.slots[Self::CURRENT].first_line + self.region_lines;
        let nb_lines = self
            .image_lines
            .saturating_sub(first_line)
            .min(self.region_lines);
        let next = &mut self.slots[Self::NEXT];
        next.data.fill(0);
        next.first_line = first_line;
        next.nb_lines = nb_lines;
    }
}

/// Sun geometry used to cast shadows
#[derive(Debug, Clone, Copy)]
pub struct ShadowGeometry {
    pub sun_zenith: f32,   // degrees
    pub sun_azimuth: f32,  // degrees, corrected for south-up scenes
    pub adjust_north: f64, // degrees, image-up to true north
    pub pixel_size: f64,   // meters
}

impl ShadowGeometry {
    /// Image displacement (lines, samples) of a shadow per km of cloud height
    fn displacement_per_km(&self) -> (f64, f64) {
        let pixels_per_km = 1000.0 * (self.sun_zenith as f64).to_radians().tan() / self.pixel_size;
        let bearing = (self.sun_azimuth as f64 + 180.0 + self.adjust_north).to_radians();
        (-bearing.cos() * pixels_per_km, bearing.sin() * pixels_per_km)
    }
}

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    ScanningPass1,
    ScanningPass2,
    Dilating,
    Done,
}

/// Pixel counts of the final mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskSummary {
    pub cloud: usize,
    pub adjacent_cloud: usize,
    pub shadow: usize,
    pub water: usize,
    pub snow: usize,
    pub dark_target: usize,
}

impl MaskSummary {
    fn add(&mut self, block: ArrayView2<'_, u8>) {
        for v in block.iter() {
            let count = |bit: u8| usize::from(*v & bit != 0);
            self.cloud += count(mask_bits::CLOUD);
            self.adjacent_cloud += count(mask_bits::ADJACENT_CLOUD);
            self.shadow += count(mask_bits::CLOUD_SHADOW);
            self.water += count(mask_bits::WATER);
            self.snow += count(mask_bits::SNOW);
            self.dark_target += count(mask_bits::DARK_TARGET);
        }
    }
}

/// Two-pass cloud / shadow / dark-target classifier
pub struct CloudShadowDetector {
    params: CloudScreeningParams,
    image: ImageSize,
    region: RegionSize,
    fill: i16,
    has_thermal: bool,
    state: DetectorState,
    diagnostics: CloudDiagnostics,
    buffer: RotatingMaskBuffer,
    blocks_done: usize,
    summary: MaskSummary,
}

impl CloudShadowDetector {
    pub fn new(
        params: CloudScreeningParams,
        image: ImageSize,
        region: RegionSize,
        fill: i16,
        has_thermal: bool,
    ) -> AtmosResult<Self> {
        let diagnostics = CloudDiagnostics::new(image, params.diag_cell_lines, params.diag_cell_samples)?;
        let buffer = RotatingMaskBuffer::new(region.lines, image.samples, image.lines);
        let state = if has_thermal {
            DetectorState::ScanningPass1
        } else {
            log::warn!("No thermal band: cloud screening uses visible tests only, no shadows");
            DetectorState::ScanningPass2
        };
        Ok(Self {
            params,
            image,
            region,
            fill,
            has_thermal,
            state,
            diagnostics,
            buffer,
            blocks_done: 0,
            summary: MaskSummary::default(),
        })
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn diagnostics(&self) -> &CloudDiagnostics {
        &self.diagnostics
    }

    pub fn buffer(&self) -> &RotatingMaskBuffer {
        &self.buffer
    }

    fn expect_state(&self, expected: DetectorState, operation: &str) -> AtmosResult<()> {
        if self.state != expected {
            return Err(AtmosError::Processing(format!(
                "cloud detector cannot {} in state {:?}",
                operation, self.state
            )));
        }
        Ok(())
    }

    fn is_fill(&self, dn: ArrayView1<'_, i16>, qa: u8, thermal: Option<i16>) -> bool {
        qa & INPUT_QA_FILL_BIT != 0
            || dn.iter().any(|v| *v == self.fill)
            || thermal.map_or(false, |t| t == self.fill)
    }

    /// Pass 1: accumulate clear-sky statistics of one line.
    ///
    /// `bands` is band x sample, `airtemp` the 2 m air temperature per sample.
    pub fn accumulate_line(
        &mut self,
        line: usize,
        bands: ArrayView2<'_, i16>,
        qa: ArrayView1<'_, u8>,
        thermal: ArrayView1<'_, i16>,
        airtemp: &[f32],
        coefs: &AtmosCoefficientGrid,
    ) -> AtmosResult<()> {
        self.expect_state(DetectorState::ScanningPass1, "accumulate pass 1 statistics")?;
        let nb_bands = bands.dim().0;
        let mut pixel_coefs = vec![AtmosCoefficients::default(); nb_bands];

        for sample in 0..self.image.samples {
            let dn = bands.column(sample);
            if self.is_fill(dn, qa[sample], Some(thermal[sample])) {
                continue;
            }
            coefs.interpolate_at(line, sample, &mut pixel_coefs)?;
            let rho = pixel_reflectance(&pixel_coefs, dn);
            let t6 = thermal[sample] as f32 * self.params.thermal_scale;

            let clear = !self.params.is_water(&rho)
                && !self.params.is_snow(&rho)
                && CloudScreeningParams::anomaly(&rho) < self.params.clear_anomaly_max
                && t6 > airtemp[sample] - self.params.clear_temp_margin;
            if clear {
                self.diagnostics.accumulate(line, sample, t6, rho[BAND_SWIR2]);
            }
        }
        Ok(())
    }

    /// Close pass 1: finalize the statistics, attach the air temperature of
    /// each cell (from `air_temperature(line, sample)`) and fill empty cells.
    pub fn finish_pass1<F>(&mut self, mut air_temperature: F) -> AtmosResult<()>
    where
        F: FnMut(f64, f64) -> AtmosResult<f32>,
    {
        self.expect_state(DetectorState::ScanningPass1, "finish pass 1")?;
        let (rows, cols) = self.diagnostics.dim();
        for row in 0..rows {
            for col in 0..cols {
                let (line, sample) = self.diagnostics.cell_center(row, col);
                let t = air_temperature(line, sample)?;
                self.diagnostics.set_air_temperature(row, col, t);
            }
        }
        self.diagnostics.finalize();
        let empty = self.diagnostics.nb_clear.iter().filter(|n| **n == 0).count();
        let filled = self.diagnostics.fill_gaps();
        if empty > 0 && filled == 0 {
            log::warn!("No clear-sky pixels found: cloud tests fall back on air temperature");
        }
        log::debug!(
            "Clear-sky diagnostics: {}x{} cells, {} empty, {} filled",
            rows,
            cols,
            empty,
            filled
        );
        self.state = DetectorState::ScanningPass2;
        Ok(())
    }

    fn classify_pixel(
        &self,
        line: usize,
        sample: usize,
        rho: &[f32; NB_REFLECTIVE_BANDS],
        t6: Option<f32>,
    ) -> u8 {
        let p = &self.params;
        if p.is_water(rho) {
            return mask_bits::WATER;
        }
        if p.is_snow(rho) {
            return mask_bits::SNOW;
        }

        let anomaly = CloudScreeningParams::anomaly(rho);
        let cloud = match t6 {
            Some(t6) => {
                let stats = self.diagnostics.interpolate(line, sample);
                let threshold = if stats.has_clear {
                    stats.t6_mean - p.cloud_temp_sigma * stats.t6_std - p.cloud_temp_offset
                } else {
                    stats.airtemp - p.clear_temp_margin
                };
                t6 < threshold && (anomaly > p.cloud_anomaly_min || rho[BAND_RED] > p.bright_red_min)
            }
            None => {
                (anomaly > p.visible_anomaly_min && rho[BAND_SWIR1] > p.visible_swir1_min)
                    || rho[BAND_RED] > p.bright_red_min
            }
        };
        if cloud {
            return mask_bits::CLOUD;
        }

        let ndvi = normalized_difference(rho[BAND_NIR], rho[BAND_RED]);
        if rho[BAND_SWIR2] >= p.ddv_swir2_min && rho[BAND_SWIR2] <= p.ddv_swir2_max && ndvi > p.ddv_ndvi_min {
            mask_bits::DARK_TARGET
        } else {
            0
        }
    }

    /// Pass 2: classify the block held by the current slot
    pub fn classify_block(&mut self, block: &LineBlock, coefs: &AtmosCoefficientGrid) -> AtmosResult<()> {
        self.expect_state(DetectorState::ScanningPass2, "classify a block")?;
        let current = self.buffer.slot(RotatingMaskBuffer::CURRENT);
        if block.first_line != current.first_line || block.nb_lines() != current.nb_lines {
            return Err(AtmosError::Processing(format!(
                "block at line {} ({} lines) does not match the current mask slot at line {} ({} lines)",
                block.first_line,
                block.nb_lines(),
                current.first_line,
                current.nb_lines
            )));
        }
        let mut pixel_coefs = vec![AtmosCoefficients::default(); coefs.nb_bands()];

        for i in 0..block.nb_lines() {
            let line = block.first_line + i;
            let bands = block.line(i);
            let thermal = if self.has_thermal { block.thermal_line(i) } else { None };
            for sample in 0..self.image.samples {
                let dn = bands.column(sample);
                let t = thermal.as_ref().map(|t| t[sample]);
                if self.is_fill(dn, block.qa[[i, sample]], t) {
                    continue;
                }
                coefs.interpolate_at(line, sample, &mut pixel_coefs)?;
                let rho = pixel_reflectance(&pixel_coefs, dn);
                let t6 = t.map(|v| v as f32 * self.params.thermal_scale);
                let bits = self.classify_pixel(line, sample, &rho, t6);
                if let Some(v) = self.buffer.get_mut(line, sample) {
                    *v |= bits;
                }
            }
        }
        self.state = DetectorState::Dilating;
        Ok(())
    }

    fn cast_shadows(&mut self, block: &LineBlock, geometry: &ShadowGeometry) {
        let Some(thermal) = block.thermal.as_ref() else {
            return;
        };
        let (dl, ds) = geometry.displacement_per_km();
        let p = &self.params;
        let clouds = self.buffer.pixels_with(RotatingMaskBuffer::CURRENT, mask_bits::CLOUD);
        let mut shadows = Vec::new();

        for (line, sample) in clouds {
            let t6 = thermal[[line - block.first_line, sample]] as f32 * p.thermal_scale;
            let stats = self.diagnostics.interpolate(line, sample);
            let t_surface = if stats.has_clear { stats.t6_mean } else { stats.airtemp };
            let height = ((t_surface - t6) / p.lapse_rate).clamp(p.min_cloud_height, p.max_cloud_height) as f64;

            let target_line = (line as f64 + height * dl).round();
            let target_sample = (sample as f64 + height * ds).round();
            if target_line < 0.0 || target_sample < 0.0 || target_sample >= self.image.samples as f64 {
                continue;
            }
            shadows.push((target_line as usize, target_sample as usize));
        }

        for (line, sample) in shadows {
            if let Some(v) = self.buffer.get_mut(line, sample) {
                if *v & mask_bits::CLOUD == 0 {
                    *v |= mask_bits::CLOUD_SHADOW;
                }
            }
        }
    }

    fn flush(&mut self, idx: usize, writer: &mut MaskWriter<'_>) -> AtmosResult<()> {
        let lines = self.buffer.slot(idx).lines();
        self.summary.add(lines);
        writer.write_lines(lines)
    }

    /// Grow clouds, cast and grow shadows, flush the oldest block and rotate
    pub fn end_block(
        &mut self,
        block: &LineBlock,
        geometry: &ShadowGeometry,
        writer: &mut MaskWriter<'_>,
    ) -> AtmosResult<()> {
        self.expect_state(DetectorState::Dilating, "dilate")?;
        if self.has_thermal {
            let radius = self.params.dilation_radius;
            self.buffer.dilate(
                RotatingMaskBuffer::CURRENT,
                mask_bits::CLOUD,
                mask_bits::ADJACENT_CLOUD,
                radius,
            );
            self.cast_shadows(block, geometry);
            // shadows may land in the previous block before it is flushed
            for idx in [RotatingMaskBuffer::PREVIOUS, RotatingMaskBuffer::CURRENT] {
                self.buffer.dilate(idx, mask_bits::CLOUD_SHADOW, mask_bits::ADJACENT_SHADOW, radius);
            }
        }
        if self.blocks_done > 0 {
            self.flush(RotatingMaskBuffer::PREVIOUS, writer)?;
        }
        self.buffer.rotate();
        self.blocks_done += 1;
        self.state = DetectorState::ScanningPass2;
        log::debug!("Cloud mask block {} done", self.blocks_done);
        Ok(())
    }

    /// Grow the last block's shadows once more and flush it
    pub fn finish(&mut self, writer: &mut MaskWriter<'_>) -> AtmosResult<MaskSummary> {
        self.expect_state(DetectorState::ScanningPass2, "finish")?;
        let (rows, _) = self.region.coarse_dims(&self.image);
        if self.blocks_done != rows {
            return Err(AtmosError::Processing(format!(
                "cloud mask finished after {} of {} blocks",
                self.blocks_done, rows
            )));
        }
        if self.has_thermal {
            self.buffer.dilate(
                RotatingMaskBuffer::PREVIOUS,
                mask_bits::CLOUD_SHADOW,
                mask_bits::ADJACENT_SHADOW,
                self.params.dilation_radius,
            );
        }
        if self.blocks_done > 0 {
            self.flush(RotatingMaskBuffer::PREVIOUS, writer)?;
        }
        self.state = DetectorState::Done;
        log::info!(
            "Cloud mask: {} cloud, {} shadow, {} water, {} snow, {} dark target pixels",
            self.summary.cloud,
            self.summary.shadow,
            self.summary.water,
            self.summary.snow,
            self.summary.dark_target
        );
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::scratch::ScratchMaskFile;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn identity_grid(image: ImageSize, region: RegionSize) -> AtmosCoefficientGrid {
        let (rows, cols) = region.coarse_dims(&image);
        let mut grid = AtmosCoefficientGrid::new(rows, cols, NB_REFLECTIVE_BANDS, region);
        let identity = AtmosCoefficients {
            tg_og: 1.0,
            tg_h2o: 1.0,
            td_ra: 1.0,
            tu_ra: 1.0,
            ..Default::default()
        };
        let bands = vec![identity; NB_REFLECTIVE_BANDS];
        for row in 0..rows {
            for col in 0..cols {
                grid.set_cell(row, col, &bands).unwrap();
            }
        }
        grid
    }

    // Vegetated land: dark target under the default thresholds
    const LAND: [i16; 6] = [300, 500, 300, 3000, 1500, 300];
    // Bright cold cloud
    const CLOUD: [i16; 6] = [6000, 6000, 6000, 6000, 5000, 3000];

    fn block(first_line: usize, lines: usize, samples: usize, thermal: i16) -> LineBlock {
        LineBlock {
            first_line,
            bands: Array3::from_shape_fn((6, lines, samples), |(b, _, _)| LAND[b]),
            qa: Array2::zeros((lines, samples)),
            thermal: Some(Array2::from_elem((lines, samples), thermal)),
        }
    }

    #[test]
    fn test_single_observation_has_zero_std() {
        let mut diags = CloudDiagnostics::new(ImageSize::new(20, 20), 10, 10).unwrap();
        diags.accumulate(2, 3, 290.0, 0.02);
        diags.accumulate(12, 3, 280.0, 0.02);
        diags.accumulate(13, 4, 284.0, 0.04);
        diags.finalize();
        let (t6m, t6s, b7m, b7s) = diags.cell_stats(0, 0);
        assert_eq!((t6m, t6s), (290.0, 0.0));
        assert_eq!(b7s, 0.0);
        assert_relative_eq!(b7m, 0.02);

        let (t6m, t6s, _, _) = diags.cell_stats(1, 0);
        assert_relative_eq!(t6m, 282.0, epsilon = 1e-4);
        assert_relative_eq!(t6s, 8.0f32.sqrt(), epsilon = 1e-4);

        assert_eq!(diags.cell_stats(0, 1), (DIAG_FILL, DIAG_FILL, DIAG_FILL, DIAG_FILL));
    }

    #[test]
    fn test_fill_gaps_uses_nearest_ring() {
        let mut diags = CloudDiagnostics::new(ImageSize::new(30, 30), 10, 10).unwrap();
        diags.accumulate(0, 0, 290.0, 0.02);
        diags.accumulate(25, 25, 270.0, 0.04);
        diags.finalize();
        let filled = diags.fill_gaps();
        assert_eq!(filled, 7);
        assert_eq!(diags.cell_stats(0, 1).0, 290.0);
        assert_eq!(diags.cell_stats(2, 1).0, 270.0);
        // (1,1) touches both observed cells in its first ring
        assert_relative_eq!(diags.cell_stats(1, 1).0, 280.0, epsilon = 1e-4);
    }

    #[test]
    fn test_fill_gaps_without_observations() {
        let mut diags = CloudDiagnostics::new(ImageSize::new(30, 30), 10, 10).unwrap();
        diags.finalize();
        assert_eq!(diags.fill_gaps(), 0);
        assert!(!diags.interpolate(15, 15).has_clear);
    }

    #[test]
    fn test_rotation_zeroes_and_truncates() {
        let mut buffer = RotatingMaskBuffer::new(4, 3, 10);
        assert_eq!(buffer.slot(RotatingMaskBuffer::PREVIOUS).nb_lines, 0);
        *buffer.get_mut(1, 1).unwrap() = mask_bits::CLOUD;
        *buffer.get_mut(5, 0).unwrap() = mask_bits::ADJACENT_CLOUD;
        assert!(buffer.get_mut(8, 0).is_none());

        buffer.rotate();
        assert_eq!(buffer.slot(RotatingMaskBuffer::PREVIOUS).first_line, 0);
        assert_eq!(buffer.get(1, 1), Some(mask_bits::CLOUD));
        assert_eq!(buffer.get(5, 0), Some(mask_bits::ADJACENT_CLOUD));
        let next = buffer.slot(RotatingMaskBuffer::NEXT);
        assert_eq!((next.first_line, next.nb_lines), (8, 2));
        assert!(next.data.iter().all(|v| *v == 0));

        buffer.rotate();
        let next = buffer.slot(RotatingMaskBuffer::NEXT);
        assert_eq!((next.first_line, next.nb_lines), (12, 0));
        assert_eq!(buffer.get(1, 1), None);
    }

    #[test]
    fn test_dilation_bleeds_across_blocks() {
        let mut buffer = RotatingMaskBuffer::new(4, 12, 12);
        buffer.rotate(); // current = lines 4..8
        *buffer.get_mut(4, 6).unwrap() = mask_bits::CLOUD;
        buffer.dilate(RotatingMaskBuffer::CURRENT, mask_bits::CLOUD, mask_bits::ADJACENT_CLOUD, 2);
        assert_eq!(buffer.get(2, 4), Some(mask_bits::ADJACENT_CLOUD));
        assert_eq!(buffer.get(6, 8), Some(mask_bits::ADJACENT_CLOUD));
        assert_eq!(buffer.get(1, 6), Some(0));
        assert_eq!(buffer.get(4, 9), Some(0));
        assert_eq!(buffer.get(4, 6), Some(mask_bits::CLOUD | mask_bits::ADJACENT_CLOUD));
    }

    #[test]
    fn test_state_machine_order() {
        let image = ImageSize::new(8, 8);
        let region = RegionSize { lines: 4, samples: 4 };
        let mut detector =
            CloudShadowDetector::new(CloudScreeningParams::default(), image, region, -9999, true).unwrap();
        let coefs = identity_grid(image, region);
        assert_eq!(detector.state(), DetectorState::ScanningPass1);
        assert!(detector.classify_block(&block(0, 4, 8, 2950), &coefs).is_err());
        detector.finish_pass1(|_, _| Ok(295.0)).unwrap();
        assert_eq!(detector.state(), DetectorState::ScanningPass2);
        assert!(detector.finish_pass1(|_, _| Ok(295.0)).is_err());
        // wrong block position
        assert!(detector.classify_block(&block(4, 4, 8, 2950), &coefs).is_err());
    }

    #[test]
    fn test_detector_marks_cloud_shadow_and_dark_targets() {
        let image = ImageSize::new(12, 30);
        let region = RegionSize { lines: 4, samples: 10 };
        let params = CloudScreeningParams {
            diag_cell_lines: 6,
            diag_cell_samples: 15,
            dilation_radius: 1,
            ..Default::default()
        };
        let coefs = identity_grid(image, region);
        let mut detector = CloudShadowDetector::new(params, image, region, -9999, true).unwrap();

        // Pass 1 on warm clear land
        let full = block(0, 12, 30, 2950);
        for i in 0..12 {
            detector
                .accumulate_line(i, full.line(i), full.qa.row(i), full.thermal_line(i).unwrap(), &[295.0; 30], &coefs)
                .unwrap();
        }
        detector.finish_pass1(|_, _| Ok(295.0)).unwrap();
        assert_eq!(detector.diagnostics().nb_clear(0, 0), 90);

        let dir = tempfile::tempdir().unwrap();
        let mut scratch = ScratchMaskFile::create_in(dir.path(), image).unwrap();
        let mut writer = scratch.writer().unwrap();

        // Sun due east, 45 degrees: shadows fall west, 1 km height = 1 pixel at 1 km pixels
        let geometry = ShadowGeometry {
            sun_zenith: 45.0,
            sun_azimuth: 90.0,
            adjust_north: 0.0,
            pixel_size: 1000.0,
        };

        for b in 0..3 {
            let mut blk = block(b * 4, 4, 30, 2950);
            if b == 1 {
                // cloud at line 5, sample 20, 3.2 km above the 295 K surface
                for ib in 0..6 {
                    blk.bands[[ib, 1, 20]] = CLOUD[ib];
                }
                blk.thermal.as_mut().unwrap()[[1, 20]] = 2745;
            }
            detector.classify_block(&blk, &coefs).unwrap();
            detector.end_block(&blk, &geometry, &mut writer).unwrap();
        }
        let summary = detector.finish(&mut writer).unwrap();
        assert_eq!(detector.state(), DetectorState::Done);
        writer.finish().unwrap();

        assert_eq!(summary.cloud, 1);
        assert_eq!(summary.shadow, 1);
        assert_eq!(summary.adjacent_cloud, 9);
        assert_eq!(summary.dark_target, 12 * 30 - 1);

        let mut reader = scratch.reader().unwrap();
        let mut line = vec![0u8; 30];
        for l in 0..12 {
            reader.read_line(&mut line).unwrap();
            if l == 5 {
                assert_ne!(line[20] & mask_bits::CLOUD, 0);
                assert_ne!(line[17] & mask_bits::CLOUD_SHADOW, 0);
                assert_ne!(line[16] & mask_bits::ADJACENT_SHADOW, 0);
                assert_ne!(line[21] & mask_bits::ADJACENT_CLOUD, 0);
            }
            if l == 4 {
                assert_ne!(line[19] & mask_bits::ADJACENT_CLOUD, 0);
            }
            if l == 0 {
                assert!(line.iter().all(|v| *v == mask_bits::DARK_TARGET));
            }
        }
    }

    #[test]
    fn test_visible_only_rules_without_thermal() {
        let image = ImageSize::new(4, 4);
        let region = RegionSize { lines: 4, samples: 4 };
        let coefs = identity_grid(image, region);
        let mut detector =
            CloudShadowDetector::new(CloudScreeningParams::default(), image, region, -9999, false).unwrap();
        assert_eq!(detector.state(), DetectorState::ScanningPass2);

        let mut blk = block(0, 4, 4, 0);
        blk.thermal = None;
        for ib in 0..6 {
            blk.bands[[ib, 0, 0]] = CLOUD[ib];
        }
        blk.bands[[0, 3, 3]] = -9999;

        let mut scratch = ScratchMaskFile::create(image).unwrap();
        let mut writer = scratch.writer().unwrap();
        let geometry = ShadowGeometry {
            sun_zenith: 30.0,
            sun_azimuth: 120.0,
            adjust_north: 0.0,
            pixel_size: 30.0,
        };
        detector.classify_block(&blk, &coefs).unwrap();
        detector.end_block(&blk, &geometry, &mut writer).unwrap();
        let summary = detector.finish(&mut writer).unwrap();
        writer.finish().unwrap();
        assert_eq!(summary.cloud, 1);
        assert_eq!(summary.adjacent_cloud, 0);
        assert_eq!(summary.dark_target, 14);
    }
}
