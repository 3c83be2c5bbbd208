//! Aerosol optical thickness retrieval over dark dense vegetation, gap
//! filling of the coarse AOT grid and per-pixel AOT interpolation.

use crate::core::atmos_coef::{cell_coefficients, region_neighbours, AtmosCoefficients};
use crate::core::coarse_grid::{CoarseCell, CoarseGrid};
use crate::core::radiative_transfer::RadiativeTransferTable;
use crate::io::raster::{LineBlock, INPUT_QA_FILL_BIT};
use crate::types::{
    mask_bits, AtmosError, AtmosResult, RegionSize, BAND_SWIR2, REFLECTANCE_SCALE,
};
use ndarray::{s, Array3, ArrayViewMut2};
use serde::{Deserialize, Serialize};

/// Bands with a retrieved AOT (blue, green, red)
pub const NB_AEROSOL_BANDS: usize = 3;

/// Central wavelengths (nm) of the aerosol bands
pub const AEROSOL_WAVELENGTHS_NM: [f32; NB_AEROSOL_BANDS] = [486.0, 570.0, 660.0];

/// Reference wavelength of the table AOT axis (nm)
pub const REFERENCE_WAVELENGTH_NM: f32 = 550.0;

/// Fixed-point scale of stored AOT values
pub const AOT_SCALE: f32 = 1000.0;

/// Dark target retrieval parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AerosolParams {
    /// Regions with fewer dark pixels keep the fill value
    pub min_dark_pixels: usize,
    /// Dark pixels further than this many std devs from the band 7 mean are dropped
    pub outlier_sigma: f32,
    /// Surface reflectance of the aerosol bands relative to band 7
    pub surface_ratios: [f32; NB_AEROSOL_BANDS],
    /// AOT value of cells without a retrieval
    pub aerosol_fill: i16,
}

impl Default for AerosolParams {
    fn default() -> Self {
        Self {
            min_dark_pixels: 10,
            outlier_sigma: 2.0,
            surface_ratios: [0.33, 0.45, 0.50], // blue, green, red over 2.2 um
            aerosol_fill: -9999,
        }
    }
}

/// Retrieval result of one coarse cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRetrieval {
    /// AOT x 1000 at each aerosol band, or the fill value
    pub aot: [i16; NB_AEROSOL_BANDS],
    pub nb_dark: i16,
    /// Band 7 dark target mean and stddev, reflectance x 10000
    pub avg_dark: i16,
    pub std_dark: i16,
}

impl CellRetrieval {
    pub fn fill(aerosol_fill: i16) -> Self {
        Self {
            aot: [aerosol_fill; NB_AEROSOL_BANDS],
            nb_dark: 0,
            avg_dark: 0,
            std_dark: 0,
        }
    }
}

/// Coarse AOT grid with the dark target diagnostics of each cell
#[derive(Debug, Clone)]
pub struct AerosolGrid {
    region: RegionSize,
    fill: i16,
    aot: Array3<i16>,   // row x col x aerosol band
    stats: Array3<i16>, // row x col x (count, mean, stddev)
}

impl AerosolGrid {
    pub fn new(rows: usize, cols: usize, region: RegionSize, aerosol_fill: i16) -> Self {
        Self {
            region,
            fill: aerosol_fill,
            aot: Array3::from_elem((rows, cols, NB_AEROSOL_BANDS), aerosol_fill),
            stats: Array3::zeros((rows, cols, 3)),
        }
    }

    pub fn rows(&self) -> usize {
        self.aot.dim().0
    }

    pub fn cols(&self) -> usize {
        self.aot.dim().1
    }

    pub fn fill_value(&self) -> i16 {
        self.fill
    }

    pub fn aot(&self, row: usize, col: usize, band: usize) -> i16 {
        self.aot[[row, col, band]]
    }

    pub fn is_fill(&self, row: usize, col: usize, band: usize) -> bool {
        self.aot[[row, col, band]] == self.fill
    }

    pub fn nb_fill(&self, band: usize) -> usize {
        self.aot
            .slice(s![.., .., band])
            .iter()
            .filter(|v| **v == self.fill)
            .count()
    }

    /// (count, mean, stddev) of the dark targets of a cell
    pub fn dark_stats(&self, row: usize, col: usize) -> (i16, i16, i16) {
        (
            self.stats[[row, col, 0]],
            self.stats[[row, col, 1]],
            self.stats[[row, col, 2]],
        )
    }

    pub fn set_cell(&mut self, row: usize, col: usize, cell: &CellRetrieval) {
        for (ib, aot) in cell.aot.iter().enumerate() {
            self.aot[[row, col, ib]] = *aot;
        }
        self.stats[[row, col, 0]] = cell.nb_dark;
        self.stats[[row, col, 1]] = cell.avg_dark;
        self.stats[[row, col, 2]] = cell.std_dark;
    }

    /// AOT at 550 nm of a cell from its band 1 retrieval, `None` when fill
    pub fn aot550(&self, row: usize, col: usize) -> Option<f32> {
        let aot_b1 = self.aot[[row, col, 0]];
        if aot_b1 == self.fill {
            return None;
        }
        Some(aot_b1 as f32 / AOT_SCALE * AEROSOL_WAVELENGTHS_NM[0] / REFERENCE_WAVELENGTH_NM)
    }

    /// Band 1 AOT x 1000 at a full-resolution pixel.
    ///
    /// Same neighbour scheme as the coefficient interpolation; fill cells are
    /// skipped, and the fill value is returned when every neighbour is fill.
    pub fn interpolate_at(&self, line: usize, sample: usize) -> i16 {
        let (l0, l1, fl) = region_neighbours(line, self.region.lines, self.rows());
        let (s0, s1, fs) = region_neighbours(sample, self.region.samples, self.cols());
        let candidates = [
            (l0, s0, (1.0 - fl) * (1.0 - fs)),
            (l0, s1, (1.0 - fl) * fs),
            (l1, s0, fl * (1.0 - fs)),
            (l1, s1, fl * fs),
        ];

        let mut sum = 0.0f32;
        let mut sum_w = 0.0f32;
        for (row, col, w) in candidates {
            if w <= 0.0 || self.is_fill(row, col, 0) {
                continue;
            }
            sum += w * self.aot[[row, col, 0]] as f32;
            sum_w += w;
        }
        if sum_w > 0.0 {
            (sum / sum_w).round() as i16
        } else {
            self.fill
        }
    }
}

/// Scene inputs shared by the retrieval of every region
pub struct RetrievalContext<'a> {
    pub grid: &'a CoarseGrid,
    pub table: &'a RadiativeTransferTable,
    pub input_fill: i16,
    /// AOT at 550 nm of the cloud screening coefficients
    pub background_aot550: f32,
}

/// Per-region AOT retrieval from the dark target mask
pub trait AerosolRetriever {
    /// Retrieve every cell of coarse row `row`.
    ///
    /// `block` holds the input lines of the row and `mask` their dark target
    /// mask bytes; the retriever may clear bits it rejects.
    fn retrieve_row(
        &self,
        row: usize,
        block: &LineBlock,
        mask: ArrayViewMut2<'_, u8>,
        ctx: &RetrievalContext<'_>,
    ) -> AtmosResult<Vec<CellRetrieval>>;
}

/// Dark dense vegetation retrieval: band 7 predicts the visible surface
/// reflectance, and the table is searched for the AOT reproducing the
/// measured TOA signal.
#[derive(Debug, Clone, Default)]
pub struct DarkTargetRetriever {
    pub params: AerosolParams,
}

impl DarkTargetRetriever {
    pub fn new(params: AerosolParams) -> Self {
        Self { params }
    }

    fn retrieve_cell(
        &self,
        cell: &CoarseCell,
        block: &LineBlock,
        mask: &mut ArrayViewMut2<'_, u8>,
        samples: std::ops::Range<usize>,
        ctx: &RetrievalContext<'_>,
    ) -> AtmosResult<CellRetrieval> {
        let fill = CellRetrieval::fill(self.params.aerosol_fill);
        if !cell.valid {
            return Ok(fill);
        }
        let background = cell_coefficients(cell, ctx.table, ctx.background_aot550)?;

        // Candidate dark pixels and their band 7 surface reflectance
        let mut dark: Vec<(usize, usize, f32)> = Vec::new();
        for i in 0..block.nb_lines() {
            for sample in samples.clone() {
                let bits = mask[[i, sample]];
                if bits & mask_bits::DARK_TARGET == 0 || bits & mask_bits::CONTAMINATED != 0 {
                    continue;
                }
                let dn = block.bands.slice(s![.., i, sample]);
                if block.qa[[i, sample]] & INPUT_QA_FILL_BIT != 0 || dn.iter().any(|v| *v == ctx.input_fill) {
                    continue;
                }
                let rho7 = background[BAND_SWIR2].surface_reflectance(dn[BAND_SWIR2] as f32 / REFLECTANCE_SCALE);
                dark.push((i, sample, rho7));
            }
        }

        // Outlier rejection on band 7
        let (mean, std) = mean_std(dark.iter().map(|d| d.2));
        if dark.len() > 1 && std > 0.0 {
            let limit = self.params.outlier_sigma * std;
            dark.retain(|&(i, sample, rho7)| {
                let keep = (rho7 - mean).abs() <= limit;
                if !keep {
                    mask[[i, sample]] &= !mask_bits::DARK_TARGET;
                }
                keep
            });
        }

        let (mean, std) = mean_std(dark.iter().map(|d| d.2));
        let mut result = CellRetrieval {
            nb_dark: dark.len().min(i16::MAX as usize) as i16,
            avg_dark: to_scaled(mean, REFLECTANCE_SCALE),
            std_dark: to_scaled(std, REFLECTANCE_SCALE),
            ..fill
        };
        if dark.len() < self.params.min_dark_pixels.max(1) {
            return Ok(result);
        }

        // Simulated TOA reflectance of the predicted surface at every table node
        let nodes = &ctx.table.aot;
        let node_coefs: Vec<Vec<AtmosCoefficients>> = nodes
            .iter()
            .map(|aot| cell_coefficients(cell, ctx.table, *aot))
            .collect::<AtmosResult<_>>()?;

        for ib in 0..NB_AEROSOL_BANDS {
            let rho_surface = self.params.surface_ratios[ib] * mean;
            let measured = dark
                .iter()
                .map(|&(i, sample, _)| block.bands[[ib, i, sample]] as f32 / REFLECTANCE_SCALE)
                .sum::<f32>()
                / dark.len() as f32;
            let simulated: Vec<f32> = node_coefs
                .iter()
                .map(|coefs| coefs[ib].toa_reflectance(rho_surface))
                .collect();
            let aot550 = invert_aot(nodes, &simulated, measured);
            let aot_band = aot550 * REFERENCE_WAVELENGTH_NM / AEROSOL_WAVELENGTHS_NM[ib];
            result.aot[ib] = to_scaled(aot_band, AOT_SCALE);
        }
        Ok(result)
    }
}

impl AerosolRetriever for DarkTargetRetriever {
    fn retrieve_row(
        &self,
        row: usize,
        block: &LineBlock,
        mut mask: ArrayViewMut2<'_, u8>,
        ctx: &RetrievalContext<'_>,
    ) -> AtmosResult<Vec<CellRetrieval>> {
        if mask.dim() != (block.nb_lines(), block.nb_samples()) {
            return Err(AtmosError::InvalidInput(format!(
                "mask block {:?} does not match the input block {}x{}",
                mask.dim(),
                block.nb_lines(),
                block.nb_samples()
            )));
        }
        let region = ctx.grid.region;
        let samples = block.nb_samples();
        let cells = (0..ctx.grid.cols())
            .map(|col| {
                let start = col * region.samples;
                let end = (start + region.samples).min(samples);
                self.retrieve_cell(ctx.grid.cell(row, col), block, &mut mask, start..end, ctx)
            })
            .collect::<AtmosResult<Vec<_>>>()?;
        log::debug!(
            "Aerosol row {}: {} of {} cells retrieved",
            row,
            cells.iter().filter(|c| c.aot[0] != self.params.aerosol_fill).count(),
            cells.len()
        );
        Ok(cells)
    }
}

fn mean_std<I: Iterator<Item = f32>>(values: I) -> (f32, f32) {
    let (mut n, mut sum, mut sumsq) = (0usize, 0.0f64, 0.0f64);
    for v in values {
        n += 1;
        sum += v as f64;
        sumsq += (v as f64) * (v as f64);
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    let std = if n > 1 {
        ((sumsq - sum * sum / n as f64) / (n as f64 - 1.0)).abs().sqrt()
    } else {
        0.0
    };
    (mean as f32, std as f32)
}

fn to_scaled(value: f32, scale: f32) -> i16 {
    (value * scale).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// AOT at which the simulated TOA curve reaches `measured`.
///
/// The curve is searched from the low end; values outside it extrapolate
/// along the first or last bracket, and negative results clamp to 0.
fn invert_aot(nodes: &[f32], simulated: &[f32], measured: f32) -> f32 {
    let nb = nodes.len();
    let mut k = 0;
    while k + 2 < nb && measured >= simulated[k + 1] {
        k += 1;
    }
    let dt = simulated[k + 1] - simulated[k];
    if dt.abs() < f32::EPSILON {
        return nodes[k];
    }
    let aot = nodes[k] + (measured - simulated[k]) / dt * (nodes[k + 1] - nodes[k]);
    aot.max(0.0)
}

/// Scene summary of the coarse retrieval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AerosolStats {
    pub nfill: usize,
    pub aot_min: i16,
    pub aot_max: i16,
    #[serde(skip)]
    seeded: bool,
}

impl AerosolStats {
    /// Count one retrieved band 1 value
    pub fn add(&mut self, aot: i16, aerosol_fill: i16) {
        if aot == aerosol_fill {
            self.nfill += 1;
        } else if !self.seeded {
            self.aot_min = aot;
            self.aot_max = aot;
            self.seeded = true;
        } else {
            self.aot_min = self.aot_min.min(aot);
            self.aot_max = self.aot_max.max(aot);
        }
    }
}

/// Replaces fill cells of the coarse AOT grid from their nearest valid ring
#[derive(Debug, Clone, Copy, Default)]
pub struct GapFiller;

impl GapFiller {
    /// Fill `band` in place; returns the number of cells filled.
    ///
    /// Each fill cell takes the mean of the valid cells on the smallest
    /// square ring around it holding any. Only the original values are
    /// used as sources, so the result does not depend on scan order.
    pub fn fill(&self, grid: &mut AerosolGrid, band: usize) -> AtmosResult<usize> {
        if band >= NB_AEROSOL_BANDS {
            return Err(AtmosError::InvalidInput(format!("no aerosol band {}", band)));
        }
        let (rows, cols) = (grid.rows(), grid.cols());
        let source = grid.aot.slice(s![.., .., band]).to_owned();
        let fill = grid.fill;
        let nb_fill = source.iter().filter(|v| **v == fill).count();
        if nb_fill == 0 {
            return Ok(0);
        }
        if nb_fill == rows * cols {
            log::warn!("No aerosol retrieved anywhere in the scene: background AOT is used");
            return Ok(0);
        }

        let mut filled = 0;
        for row in 0..rows {
            for col in 0..cols {
                if source[[row, col]] != fill {
                    continue;
                }
                for radius in 1..rows.max(cols) as i64 {
                    let mut sum = 0i64;
                    let mut n = 0i64;
                    for r in (row as i64 - radius)..=(row as i64 + radius) {
                        for c in (col as i64 - radius)..=(col as i64 + radius) {
                            let on_ring = (r - row as i64).abs() == radius || (c - col as i64).abs() == radius;
                            if !on_ring || r < 0 || c < 0 || r as usize >= rows || c as usize >= cols {
                                continue;
                            }
                            let v = source[[r as usize, c as usize]];
                            if v != fill {
                                sum += v as i64;
                                n += 1;
                            }
                        }
                    }
                    if n > 0 {
                        grid.aot[[row, col, band]] = (sum as f64 / n as f64).round() as i16;
                        filled += 1;
                        break;
                    }
                }
            }
        }
        log::debug!("Aerosol gap fill: {} of {} cells filled", filled, rows * cols);
        Ok(filled)
    }
}
