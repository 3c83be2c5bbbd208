//! Atmospheric correction coefficients on the coarse grid.
//!
//! Each coarse cell gets one [`AtmosCoefficients`] per reflective band,
//! interpolated from the radiative-transfer table at the cell's AOT and then
//! moved from the table's reference pressure to the cell's surface pressure.
//! Full-resolution pixels get bilinear blends of the surrounding cells.

use crate::core::aerosol::AerosolGrid;
use crate::core::ancillary::lerp;
use crate::core::coarse_grid::{CoarseCell, CoarseGrid};
use crate::core::radiative_transfer::RadiativeTransferTable;
use crate::core::rayleigh::{
    rayleigh_optical_depth, rayleigh_reflectance, rayleigh_spherical_albedo,
    rayleigh_transmittance,
};
use crate::core::terrain_pressure::REFERENCE_PRESSURE_MB;
use crate::types::{AtmosError, AtmosResult, RegionSize};
use ndarray::{s, Array2, Array3, ArrayView1};
use serde::{Deserialize, Serialize};

/// AOT at 550 nm used for the cloud screening pass and for unretrieved cells
pub const BACKGROUND_AOT550: f32 = 0.01;

/// Correction terms of one band
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AtmosCoefficients {
    pub tg_og: f32,
    pub tg_h2o: f32,
    pub td_ra: f32,
    pub tu_ra: f32,
    pub rho_mol: f32,
    pub rho_ra: f32,
    pub td_da: f32,
    pub tu_da: f32,
    pub s_ra: f32,
    pub td_r: f32,
    pub tu_r: f32,
    pub s_r: f32,
    pub rho_r: f32,
}

impl AtmosCoefficients {
    /// Surface reflectance from TOA reflectance (both unitless)
    pub fn surface_reflectance(&self, toa: f32) -> f32 {
        let mut rho = toa / self.tg_og - self.rho_ra;
        rho /= self.tg_h2o * self.td_ra * self.tu_ra;
        rho / (1.0 + self.s_ra * rho)
    }

    /// TOA reflectance seen above a lambertian surface of reflectance `rho_s`
    pub fn toa_reflectance(&self, rho_s: f32) -> f32 {
        let coupled = self.tg_h2o * self.td_ra * self.tu_ra * rho_s / (1.0 - self.s_ra * rho_s);
        self.tg_og * (self.rho_ra + coupled)
    }

    fn add_weighted(&mut self, other: &Self, w: f32) {
        self.tg_og += w * other.tg_og;
        self.tg_h2o += w * other.tg_h2o;
        self.td_ra += w * other.td_ra;
        self.tu_ra += w * other.tu_ra;
        self.rho_mol += w * other.rho_mol;
        self.rho_ra += w * other.rho_ra;
        self.td_da += w * other.td_da;
        self.tu_da += w * other.tu_da;
        self.s_ra += w * other.s_ra;
        self.td_r += w * other.td_r;
        self.tu_r += w * other.tu_r;
        self.s_r += w * other.s_r;
        self.rho_r += w * other.rho_r;
    }

    fn scaled(&self, f: f32) -> Self {
        let mut out = Self::default();
        out.add_weighted(self, f);
        out
    }
}

/// Table coefficients of `band` linearly interpolated in AOT, before any
/// pressure adjustment
pub fn interpolate_table(
    table: &RadiativeTransferTable,
    band: usize,
    k: usize,
    coef: f32,
) -> AtmosCoefficients {
    let b = &table.bands[band];
    AtmosCoefficients {
        tg_og: b.tg_og,
        tg_h2o: b.tg_h2o,
        rho_mol: b.rho_mol,
        td_ra: lerp(b.td_ra[k], b.td_ra[k + 1], coef),
        tu_ra: lerp(b.tu_ra[k], b.tu_ra[k + 1], coef),
        rho_ra: lerp(b.rho_ra[k], b.rho_ra[k + 1], coef),
        td_da: lerp(b.td_da[k], b.td_da[k + 1], coef),
        tu_da: lerp(b.tu_da[k], b.tu_da[k + 1], coef),
        s_ra: lerp(b.s_ra[k], b.s_ra[k + 1], coef),
        td_r: b.td_r,
        tu_r: b.tu_r,
        s_r: b.s_r,
        rho_r: b.rho_r,
    }
}

/// Coefficients of every band for one cell at `aot550`
pub fn cell_coefficients(
    cell: &CoarseCell,
    table: &RadiativeTransferTable,
    aot550: f32,
) -> AtmosResult<Vec<AtmosCoefficients>> {
    let mus = (cell.sun_zenith as f64).to_radians().cos();
    let muv = (cell.view_zenith as f64).to_radians().cos();
    let phi = cell.relative_azimuth as f64;
    if !(mus > 0.0) {
        return Err(AtmosError::InvalidInput(format!(
            "sun zenith {} is below the horizon",
            cell.sun_zenith
        )));
    }
    let pressure = if cell.surface_pressure > 0.0 {
        cell.surface_pressure
    } else {
        REFERENCE_PRESSURE_MB
    };

    let (k, coef) = table.aot_bracket(aot550);

    (0..table.nb_bands())
        .map(|ib| {
            let mut c = interpolate_table(table, ib, k, coef);

            let tau = rayleigh_optical_depth(ib, pressure)? as f64;
            let rho_r = rayleigh_reflectance(phi, muv, mus, tau) as f32;
            let td_r = rayleigh_transmittance(mus, tau) as f32;
            let tu_r = rayleigh_transmittance(muv, tau) as f32;
            let s_r = rayleigh_spherical_albedo(tau) as f32;

            // Replace the reference-pressure Rayleigh part of the aerosol terms
            c.rho_ra += rho_r - c.rho_r;
            c.td_ra *= td_r / c.td_r;
            c.tu_ra *= tu_r / c.tu_r;
            c.s_ra += s_r - c.s_r;

            c.rho_r = rho_r;
            c.td_r = td_r;
            c.tu_r = tu_r;
            c.s_r = s_r;
            Ok(c)
        })
        .collect()
}

/// AOT assignment of the coarse cells for one build
#[derive(Debug, Clone, Copy)]
pub enum AotField<'a> {
    Uniform(f32),
    /// Retrieved AOT; cells still at fill use `background`
    Retrieved {
        grid: &'a AerosolGrid,
        background: f32,
    },
}

impl AotField<'_> {
    fn aot550(&self, row: usize, col: usize) -> f32 {
        match self {
            AotField::Uniform(aot) => *aot,
            AotField::Retrieved { grid, background } => grid.aot550(row, col).unwrap_or(*background),
        }
    }
}

/// Owned per-scene coefficient grid (row x col x band)
#[derive(Debug, Clone)]
pub struct AtmosCoefficientGrid {
    region: RegionSize,
    coefs: Array3<AtmosCoefficients>,
    computed: Array2<bool>,
    /// Scene mean of the first build, used where no neighbour was computed
    fallback: Option<Vec<AtmosCoefficients>>,
}

impl AtmosCoefficientGrid {
    pub fn new(rows: usize, cols: usize, nb_bands: usize, region: RegionSize) -> Self {
        Self {
            region,
            coefs: Array3::from_elem((rows, cols, nb_bands), AtmosCoefficients::default()),
            computed: Array2::from_elem((rows, cols), false),
            fallback: None,
        }
    }

    pub fn for_grid(grid: &CoarseGrid, nb_bands: usize) -> Self {
        Self::new(grid.rows(), grid.cols(), nb_bands, grid.region)
    }

    pub fn rows(&self) -> usize {
        self.coefs.dim().0
    }

    pub fn cols(&self) -> usize {
        self.coefs.dim().1
    }

    pub fn nb_bands(&self) -> usize {
        self.coefs.dim().2
    }

    pub fn region(&self) -> RegionSize {
        self.region
    }

    pub fn is_computed(&self, row: usize, col: usize) -> bool {
        self.computed[[row, col]]
    }

    pub fn coefficients(&self, row: usize, col: usize) -> ArrayView1<'_, AtmosCoefficients> {
        self.coefs.slice(s![row, col, ..])
    }

    /// Install precomputed coefficients for one cell
    pub fn set_cell(
        &mut self,
        row: usize,
        col: usize,
        bands: &[AtmosCoefficients],
    ) -> AtmosResult<()> {
        if row >= self.rows() || col >= self.cols() || bands.len() != self.nb_bands() {
            return Err(AtmosError::InvalidInput(format!(
                "cannot set cell ({}, {}) with {} bands on a {}x{}x{} grid",
                row,
                col,
                bands.len(),
                self.rows(),
                self.cols(),
                self.nb_bands()
            )));
        }
        for (dst, src) in self.coefs.slice_mut(s![row, col, ..]).iter_mut().zip(bands) {
            *dst = *src;
        }
        self.computed[[row, col]] = true;
        Ok(())
    }

    pub fn nb_computed(&self) -> usize {
        self.computed.iter().filter(|c| **c).count()
    }

    /// Recompute every valid cell of `grid` at the AOT given by `aot`
    pub fn update(
        &mut self,
        grid: &CoarseGrid,
        table: &RadiativeTransferTable,
        aot: AotField<'_>,
    ) -> AtmosResult<()> {
        let (rows, cols) = (grid.rows(), grid.cols());
        if (rows, cols) != (self.rows(), self.cols()) || table.nb_bands() != self.nb_bands() {
            return Err(AtmosError::InvalidInput(format!(
                "coefficient grid {}x{}x{} does not match coarse grid {}x{} with {} table bands",
                self.rows(),
                self.cols(),
                self.nb_bands(),
                rows,
                cols,
                table.nb_bands()
            )));
        }
        log::info!("Computing atmospheric coefficients for {} coarse cells", rows * cols);

        let compute = |idx: usize| -> AtmosResult<Option<Vec<AtmosCoefficients>>> {
            let (row, col) = (idx / cols, idx % cols);
            let cell = grid.cell(row, col);
            if !cell.valid {
                return Ok(None);
            }
            cell_coefficients(cell, table, aot.aot550(row, col)).map(Some)
        };

        #[cfg(feature = "parallel")]
        let results: Vec<Option<Vec<AtmosCoefficients>>> = {
            use rayon::prelude::*;
            (0..rows * cols)
                .into_par_iter()
                .map(compute)
                .collect::<AtmosResult<Vec<_>>>()?
        };

        #[cfg(not(feature = "parallel"))]
        let results: Vec<Option<Vec<AtmosCoefficients>>> = (0..rows * cols)
            .map(compute)
            .collect::<AtmosResult<Vec<_>>>()?;

        for (idx, result) in results.into_iter().enumerate() {
            let (row, col) = (idx / cols, idx % cols);
            match result {
                Some(bands) => {
                    for (dst, src) in self.coefs.slice_mut(s![row, col, ..]).iter_mut().zip(bands) {
                        *dst = src;
                    }
                    self.computed[[row, col]] = true;
                }
                None => self.computed[[row, col]] = false,
            }
        }

        if self.fallback.is_none() {
            self.fallback = self.scene_mean();
        }
        log::info!("Computed {} of {} coarse cells", self.nb_computed(), rows * cols);
        Ok(())
    }

    fn scene_mean(&self) -> Option<Vec<AtmosCoefficients>> {
        let n = self.nb_computed();
        if n == 0 {
            return None;
        }
        let mut mean = vec![AtmosCoefficients::default(); self.nb_bands()];
        for ((row, col), computed) in self.computed.indexed_iter() {
            if *computed {
                for (m, c) in mean.iter_mut().zip(self.coefs.slice(s![row, col, ..]).iter()) {
                    m.add_weighted(c, 1.0);
                }
            }
        }
        Some(mean.iter().map(|m| m.scaled(1.0 / n as f32)).collect())
    }

    /// Bilinear coefficients of pixel (line, sample) written into `out`.
    ///
    /// Cells are centred half a region into their block; past the outermost
    /// centres the nearest cell is reused. Uncomputed cells are skipped and
    /// the weights renormalised. Returns the number of contributing cells;
    /// when none contributes `out` holds the scene-mean fallback.
    pub fn interpolate_at(
        &self,
        line: usize,
        sample: usize,
        out: &mut [AtmosCoefficients],
    ) -> AtmosResult<usize> {
        if out.len() != self.nb_bands() {
            return Err(AtmosError::InvalidInput(format!(
                "coefficient buffer holds {} bands, grid has {}",
                out.len(),
                self.nb_bands()
            )));
        }
        let (l0, l1, fl) = region_neighbours(line, self.region.lines, self.rows());
        let (s0, s1, fs) = region_neighbours(sample, self.region.samples, self.cols());
        let candidates = [
            (l0, s0, (1.0 - fl) * (1.0 - fs)),
            (l0, s1, (1.0 - fl) * fs),
            (l1, s0, fl * (1.0 - fs)),
            (l1, s1, fl * fs),
        ];

        out.iter_mut().for_each(|c| *c = AtmosCoefficients::default());
        let mut sum_w = 0.0f32;
        let mut n = 0;
        for (row, col, w) in candidates {
            if w <= 0.0 || !self.computed[[row, col]] {
                continue;
            }
            for (o, c) in out.iter_mut().zip(self.coefs.slice(s![row, col, ..]).iter()) {
                o.add_weighted(c, w);
            }
            sum_w += w;
            n += 1;
        }

        if n == 0 {
            let fallback = self.fallback.as_ref().ok_or_else(|| {
                AtmosError::Processing(format!(
                    "no atmospheric coefficients available at line {} sample {}",
                    line, sample
                ))
            })?;
            out.copy_from_slice(fallback);
            return Ok(0);
        }
        if sum_w != 1.0 {
            out.iter_mut().for_each(|c| *c = c.scaled(1.0 / sum_w));
        }
        Ok(n)
    }
}

/// Bracketing cells and weight along one axis for a pixel position
pub(crate) fn region_neighbours(pos: usize, region: usize, len: usize) -> (usize, usize, f32) {
    let half = ((region + 1) / 2) as f64;
    let p = (pos as f64 - half) / region as f64;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::radiative_transfer::sample_table;
    use crate::types::ImageSize;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn cell(pressure: f32) -> CoarseCell {
        CoarseCell {
            lat: 40.0,
            lon: -100.0,
            sun_zenith: 30.0,
            view_zenith: 0.0,
            relative_azimuth: 0.0,
            water_vapor: 2.0,
            ozone: 0.3,
            surface_pressure: pressure,
            dem_pressure: pressure,
            valid: true,
        }
    }

    fn uniform_grid(rows: usize, cols: usize, pressure: f32) -> CoarseGrid {
        let region = RegionSize { lines: 10, samples: 10 };
        CoarseGrid {
            region,
            image: ImageSize::new(rows * 10, cols * 10),
            cells: Array2::from_elem((rows, cols), cell(pressure)),
        }
    }

    #[test]
    fn test_table_node_is_exact() {
        let table = sample_table();
        let (k, coef) = table.aot_bracket(table.aot[4]);
        for ib in 0..table.nb_bands() {
            let c = interpolate_table(&table, ib, k, coef);
            let b = &table.bands[ib];
            assert_eq!(c.rho_ra, b.rho_ra[4]);
            assert_eq!(c.td_ra, b.td_ra[4]);
            assert_eq!(c.tu_ra, b.tu_ra[4]);
            assert_eq!(c.td_da, b.td_da[4]);
            assert_eq!(c.tu_da, b.tu_da[4]);
            assert_eq!(c.s_ra, b.s_ra[4]);
        }
    }

    #[test]
    fn test_reference_pressure_keeps_table_row() {
        let table = sample_table();
        let coefs = cell_coefficients(&cell(1013.0), &table, table.aot[2]).unwrap();
        for (ib, c) in coefs.iter().enumerate() {
            let b = &table.bands[ib];
            assert_relative_eq!(c.rho_ra, b.rho_ra[2], epsilon = 1e-5);
            assert_relative_eq!(c.td_ra, b.td_ra[2], epsilon = 1e-5);
            assert_relative_eq!(c.tu_ra, b.tu_ra[2], epsilon = 1e-5);
            assert_relative_eq!(c.s_ra, b.s_ra[2], epsilon = 1e-5);
            assert_eq!(c.tg_og, b.tg_og);
        }
    }

    #[test]
    fn test_low_pressure_reduces_rayleigh() {
        let table = sample_table();
        let sea = cell_coefficients(&cell(1013.0), &table, 0.05).unwrap();
        let high = cell_coefficients(&cell(700.0), &table, 0.05).unwrap();
        assert!(high[0].rho_ra < sea[0].rho_ra);
        assert!(high[0].rho_r < sea[0].rho_r);
        assert!(high[0].td_ra > sea[0].td_ra);
        assert!(high[0].s_ra < sea[0].s_ra);
    }

    #[test]
    fn test_inversion_round_trip() {
        let table = sample_table();
        let coefs = cell_coefficients(&cell(950.0), &table, 0.2).unwrap();
        for c in &coefs {
            for rho in [0.01f32, 0.05, 0.2, 0.45] {
                let toa = c.toa_reflectance(rho);
                assert_abs_diff_eq!(c.surface_reflectance(toa), rho, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_uniform_grid_interpolates_to_cell_values() {
        let table = sample_table();
        let grid = uniform_grid(3, 3, 1013.0);
        let mut atmos = AtmosCoefficientGrid::for_grid(&grid, table.nb_bands());
        atmos.update(&grid, &table, AotField::Uniform(0.05)).unwrap();
        assert_eq!(atmos.nb_computed(), 9);

        let mut out = vec![AtmosCoefficients::default(); table.nb_bands()];
        for (line, sample) in [(0, 0), (15, 15), (29, 3), (12, 27)] {
            let n = atmos.interpolate_at(line, sample, &mut out).unwrap();
            assert!(n >= 1);
            for (o, c) in out.iter().zip(atmos.coefficients(1, 1).iter()) {
                assert_relative_eq!(o.rho_ra, c.rho_ra, epsilon = 1e-6);
                assert_relative_eq!(o.s_ra, c.s_ra, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_bilinear_weights() {
        let grid = uniform_grid(2, 2, 1013.0);
        let mut atmos = AtmosCoefficientGrid::new(2, 2, 1, grid.region);
        for (i, v) in [(0, 0.0f32), (1, 1.0), (2, 2.0), (3, 3.0)] {
            let (row, col) = (i / 2, i % 2);
            atmos.coefs[[row, col, 0]].rho_ra = v;
            atmos.computed[[row, col]] = true;
        }
        let mut out = vec![AtmosCoefficients::default(); 1];
        // half = 5: centre of cell (0,0) is pixel 5, of (1,1) pixel 15
        atmos.interpolate_at(5, 5, &mut out).unwrap();
        assert_relative_eq!(out[0].rho_ra, 0.0);
        atmos.interpolate_at(10, 10, &mut out).unwrap();
        assert_relative_eq!(out[0].rho_ra, 1.5, epsilon = 1e-6);
        atmos.interpolate_at(15, 10, &mut out).unwrap();
        assert_relative_eq!(out[0].rho_ra, 2.5, epsilon = 1e-6);
        // past the last centre: no extrapolation
        atmos.interpolate_at(19, 19, &mut out).unwrap();
        assert_relative_eq!(out[0].rho_ra, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_uncomputed_neighbours_are_skipped() {
        let grid = uniform_grid(2, 2, 1013.0);
        let mut atmos = AtmosCoefficientGrid::new(2, 2, 1, grid.region);
        atmos.coefs[[0, 0, 0]].rho_ra = 0.2;
        atmos.computed[[0, 0]] = true;
        atmos.coefs[[1, 1, 0]].rho_ra = 0.4;
        atmos.computed[[1, 1]] = true;
        let mut out = vec![AtmosCoefficients::default(); 1];
        let n = atmos.interpolate_at(10, 10, &mut out).unwrap();
        assert_eq!(n, 2);
        assert_relative_eq!(out[0].rho_ra, 0.3, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_neighbours_uses_scene_mean() {
        let table = sample_table();
        let mut grid = uniform_grid(2, 2, 1013.0);
        grid.cells[[1, 1]].valid = false;
        let mut atmos = AtmosCoefficientGrid::for_grid(&grid, table.nb_bands());

        let mut out = vec![AtmosCoefficients::default(); table.nb_bands()];
        assert!(atmos.interpolate_at(19, 19, &mut out).is_err());

        atmos.update(&grid, &table, AotField::Uniform(BACKGROUND_AOT550)).unwrap();
        assert!(!atmos.is_computed(1, 1));
        let n = atmos.interpolate_at(19, 19, &mut out).unwrap();
        assert_eq!(n, 0);
        assert_relative_eq!(out[0].rho_ra, atmos.coefficients(0, 0)[0].rho_ra, epsilon = 1e-6);
    }

    #[test]
    fn test_fill_cells_take_configured_background() {
        let table = sample_table();
        let grid = uniform_grid(2, 2, 1013.0);
        let mut aerosol = AerosolGrid::new(2, 2, grid.region, -9999);
        aerosol.set_cell(
            0,
            0,
            &crate::core::aerosol::CellRetrieval {
                aot: [226, 194, 167],
                nb_dark: 50,
                avg_dark: 300,
                std_dark: 5,
            },
        );

        let mut uniform = AtmosCoefficientGrid::for_grid(&grid, table.nb_bands());
        uniform.update(&grid, &table, AotField::Uniform(0.3)).unwrap();
        let mut retrieved = AtmosCoefficientGrid::for_grid(&grid, table.nb_bands());
        let aot = AotField::Retrieved {
            grid: &aerosol,
            background: 0.3,
        };
        retrieved.update(&grid, &table, aot).unwrap();

        for (u, r) in uniform.coefficients(1, 1).iter().zip(retrieved.coefficients(1, 1).iter()) {
            assert_relative_eq!(u.rho_ra, r.rho_ra, epsilon = 1e-6);
            assert_relative_eq!(u.td_ra, r.td_ra, epsilon = 1e-6);
        }
        // retrieved cell keeps its own AOT
        assert!(retrieved.coefficients(0, 0)[0].rho_ra < uniform.coefficients(0, 0)[0].rho_ra);
    }
}
