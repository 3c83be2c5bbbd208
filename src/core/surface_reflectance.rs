//! Per-pixel surface reflectance inversion and QA encoding.

use crate::core::aerosol::AerosolGrid;
use crate::core::atmos_coef::{AtmosCoefficientGrid, AtmosCoefficients};
use crate::types::{
    mask_bits, AtmosError, AtmosResult, QaBand, BAND_BLUE, BAND_RED, BAND_SWIR1, QA_OFF, QA_ON,
    REFLECTANCE_SCALE,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Output sentinels and valid range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionLimits {
    pub output_fill: i16,
    pub output_saturation: i16,
    pub min_valid_sr: i16,
    pub max_valid_sr: i16,
}

impl Default for CorrectionLimits {
    fn default() -> Self {
        Self {
            output_fill: -9999,
            output_saturation: 20000,
            min_valid_sr: -2000, // -0.2
            max_valid_sr: 16000, // 1.6
        }
    }
}

/// Thermal / visible anomaly test of the output QA cloud band.
/// Reflectance thresholds are in output units (x 10000).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaThresholds {
    pub anomaly: f32,
    pub swir1: f32,
    pub red: f32,
    pub temperature: f32, // K
    pub thermal_scale: f32,
}

impl Default for QaThresholds {
    fn default() -> Self {
        Self {
            anomaly: 300.0,
            swir1: 300.0,
            red: 5000.0,
            temperature: 290.0,
            thermal_scale: 0.1,
        }
    }
}

/// Per-band counters of the correction pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrStats {
    pub nfill: Vec<usize>,
    pub nsatu: Vec<usize>,
    pub nout_range: Vec<usize>,
    pub sr_min: Vec<i16>,
    pub sr_max: Vec<i16>,
    #[serde(skip)]
    seeded: Vec<bool>,
}

impl SrStats {
    pub fn new(nb_bands: usize) -> Self {
        Self {
            nfill: vec![0; nb_bands],
            nsatu: vec![0; nb_bands],
            nout_range: vec![0; nb_bands],
            sr_min: vec![0; nb_bands],
            sr_max: vec![0; nb_bands],
            seeded: vec![false; nb_bands],
        }
    }

    fn add_valid(&mut self, band: usize, value: i16) {
        if self.seeded[band] {
            self.sr_min[band] = self.sr_min[band].min(value);
            self.sr_max[band] = self.sr_max[band].max(value);
        } else {
            self.sr_min[band] = value;
            self.sr_max[band] = value;
            self.seeded[band] = true;
        }
    }
}

/// One output line: reflectance, AOT, QA and dark target diagnostics
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub reflectance: Array2<i16>, // band x sample
    pub aot: Array1<i16>,
    pub qa: Array2<u8>, // QA band x sample
    pub nb_dark: Array1<i16>,
    pub avg_dark: Array1<i16>,
    pub std_dark: Array1<i16>,
}

impl OutputLine {
    pub fn new(nb_bands: usize, samples: usize) -> Self {
        Self {
            reflectance: Array2::zeros((nb_bands, samples)),
            aot: Array1::zeros(samples),
            qa: Array2::zeros((QaBand::COUNT, samples)),
            nb_dark: Array1::zeros(samples),
            avg_dark: Array1::zeros(samples),
            std_dark: Array1::zeros(samples),
        }
    }

    pub fn nb_bands(&self) -> usize {
        self.reflectance.dim().0
    }

    pub fn nb_samples(&self) -> usize {
        self.reflectance.dim().1
    }

    pub fn qa_band(&self, band: QaBand) -> ArrayView1<'_, u8> {
        self.qa.row(band.index())
    }
}

/// Inverts TOA reflectance lines with the final coefficient grid
pub struct SurfaceReflectanceCorrector<'a> {
    coefs: &'a AtmosCoefficientGrid,
    limits: CorrectionLimits,
    thresholds: QaThresholds,
    input_fill: i16,
    input_saturation: i16,
    aerosol_fill: i16,
    stats: SrStats,
    pixel_coefs: Vec<AtmosCoefficients>,
}

impl<'a> SurfaceReflectanceCorrector<'a> {
    pub fn new(
        coefs: &'a AtmosCoefficientGrid,
        limits: CorrectionLimits,
        thresholds: QaThresholds,
        input_fill: i16,
        input_saturation: i16,
        aerosol_fill: i16,
    ) -> Self {
        let nb_bands = coefs.nb_bands();
        Self {
            coefs,
            limits,
            thresholds,
            input_fill,
            input_saturation,
            aerosol_fill,
            stats: SrStats::new(nb_bands),
            pixel_coefs: vec![AtmosCoefficients::default(); nb_bands],
        }
    }

    pub fn stats(&self) -> &SrStats {
        &self.stats
    }

    pub fn into_stats(self) -> SrStats {
        self.stats
    }

    fn scale_output(&mut self, band: usize, rho: f32) -> i16 {
        let value = (rho * REFLECTANCE_SCALE).round();
        if value.is_nan() || value < self.limits.min_valid_sr as f32 {
            self.stats.nout_range[band] += 1;
            self.limits.min_valid_sr
        } else if value > self.limits.max_valid_sr as f32 {
            self.stats.nout_range[band] += 1;
            self.limits.max_valid_sr
        } else {
            value as i16
        }
    }

    /// Surface reflectance of every band of `line` (`bands` is band x sample)
    pub fn correct_line(
        &mut self,
        line: usize,
        bands: ArrayView2<'_, i16>,
        out: &mut OutputLine,
    ) -> AtmosResult<()> {
        let (nb_bands, samples) = bands.dim();
        if nb_bands != self.coefs.nb_bands() || out.nb_bands() != nb_bands || out.nb_samples() != samples {
            return Err(AtmosError::InvalidInput(format!(
                "line {} has {} bands x {} samples, output {}x{}, coefficients {} bands",
                line,
                nb_bands,
                samples,
                out.nb_bands(),
                out.nb_samples(),
                self.coefs.nb_bands()
            )));
        }

        for sample in 0..samples {
            let mut pixel_coefs = std::mem::take(&mut self.pixel_coefs);
            self.coefs.interpolate_at(line, sample, &mut pixel_coefs)?;
            for ib in 0..nb_bands {
                let dn = bands[[ib, sample]];
                out.reflectance[[ib, sample]] = if dn == self.input_fill {
                    self.stats.nfill[ib] += 1;
                    self.limits.output_fill
                } else if dn == self.input_saturation {
                    self.stats.nsatu[ib] += 1;
                    self.limits.output_saturation
                } else {
                    let rho = pixel_coefs[ib].surface_reflectance(dn as f32 / REFLECTANCE_SCALE);
                    let value = self.scale_output(ib, rho);
                    self.stats.add_valid(ib, value);
                    value
                };
            }
            self.pixel_coefs = pixel_coefs;
        }
        Ok(())
    }

    /// QA bands, AOT and dark target diagnostics of a corrected line.
    ///
    /// `mask` is the line of the dark target mask. Without `thermal` the
    /// cloud band is the mask's cloud bit; with it the anomaly test on the
    /// corrected reflectance decides.
    pub fn apply_qa(
        &self,
        line: usize,
        bands: ArrayView2<'_, i16>,
        thermal: Option<ArrayView1<'_, i16>>,
        mask: &[u8],
        aerosol: &AerosolGrid,
        out: &mut OutputLine,
    ) -> AtmosResult<()> {
        let samples = out.nb_samples();
        if mask.len() != samples || bands.dim().1 != samples {
            return Err(AtmosError::InvalidInput(format!(
                "QA inputs of line {} do not match {} output samples",
                line, samples
            )));
        }
        let region = self.coefs.region();
        let row = line / region.lines;

        for sample in 0..samples {
            out.qa.column_mut(sample).fill(QA_OFF);
            let qa = |band: QaBand| [band.index(), sample];

            if bands.column(sample).iter().any(|v| *v == self.input_fill) {
                out.qa[qa(QaBand::Fill)] = QA_ON;
                out.aot[sample] = self.aerosol_fill;
                out.nb_dark[sample] = 0;
                out.avg_dark[sample] = self.input_fill;
                out.std_dark[sample] = self.input_fill;
                continue;
            }

            out.aot[sample] = aerosol.interpolate_at(line, sample);
            let bits = mask[sample];
            let on_off = |set: bool| if set { QA_ON } else { QA_OFF };
            out.qa[qa(QaBand::DarkTarget)] = on_off(bits & mask_bits::DARK_TARGET != 0);
            out.qa[qa(QaBand::LandWater)] = on_off(bits & mask_bits::WATER != 0);
            out.qa[qa(QaBand::Snow)] = on_off(bits & mask_bits::SNOW != 0);

            // a filled thermal sample leaves the mask's cloud bit in place
            let t6_dn = thermal.map(|t| t[sample]).filter(|dn| *dn != self.input_fill);
            let cloud = match t6_dn {
                Some(dn) => {
                    let sr = |ib: usize| out.reflectance[[ib, sample]] as f32;
                    let t6 = dn as f32 * self.thresholds.thermal_scale;
                    let cold = t6 < self.thresholds.temperature;
                    let anomaly = sr(BAND_BLUE) - sr(BAND_RED) / 2.0;
                    (anomaly > self.thresholds.anomaly && sr(BAND_SWIR1) > self.thresholds.swir1 && cold)
                        || (sr(BAND_RED) > self.thresholds.red && cold)
                }
                None => bits & mask_bits::CLOUD != 0,
            };
            out.qa[qa(QaBand::Cloud)] = on_off(cloud);
            // shadow and adjacent cloud stay off

            let (nb, avg, std) = aerosol.dark_stats(row, sample / region.samples);
            out.nb_dark[sample] = nb;
            out.avg_dark[sample] = avg;
            out.std_dark[sample] = std;
        }
        Ok(())
    }
}
