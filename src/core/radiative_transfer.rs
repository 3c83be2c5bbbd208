use crate::types::{AtmosError, AtmosResult, Instrument, NB_REFLECTIVE_BANDS};
use serde::{Deserialize, Serialize};

/// Length of the AOT axis produced by the radiative-transfer solver
pub const SIXS_NB_AOT: usize = 15;

/// Coefficients of one reflective band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandTable {
    pub tg_og: f32,   // other-gases transmittance
    pub tg_h2o: f32,  // water vapour transmittance
    pub rho_mol: f32, // molecular path reflectance

    // Pure Rayleigh terms at the table's reference pressure
    pub rho_r: f32,
    pub td_r: f32,
    pub tu_r: f32,
    pub s_r: f32,

    // AOT-indexed terms
    pub rho_ra: Vec<f32>, // Rayleigh + aerosol path reflectance
    pub td_ra: Vec<f32>,  // Rayleigh + aerosol downward transmittance
    pub tu_ra: Vec<f32>,  // Rayleigh + aerosol upward transmittance
    pub td_da: Vec<f32>,  // aerosol-only downward transmittance
    pub tu_da: Vec<f32>,  // aerosol-only upward transmittance
    pub s_ra: Vec<f32>,   // Rayleigh + aerosol spherical albedo
}

impl BandTable {
    fn aot_fields(&self) -> [(&'static str, &Vec<f32>); 6] {
        [
            ("rho_ra", &self.rho_ra),
            ("td_ra", &self.td_ra),
            ("tu_ra", &self.tu_ra),
            ("td_da", &self.td_da),
            ("tu_da", &self.tu_da),
            ("s_ra", &self.s_ra),
        ]
    }
}

/// AOT-indexed radiative-transfer coefficients for every reflective band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadiativeTransferTable {
    /// AOT at 550 nm of each table node, strictly increasing
    pub aot: Vec<f32>,
    pub bands: Vec<BandTable>,
}

impl RadiativeTransferTable {
    pub fn new(aot: Vec<f32>, bands: Vec<BandTable>) -> AtmosResult<Self> {
        if aot.len() < 2 {
            return Err(AtmosError::Table(format!(
                "AOT axis needs at least 2 nodes, got {}",
                aot.len()
            )));
        }
        if aot.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(AtmosError::Table("AOT axis is not strictly increasing".to_string()));
        }
        if bands.is_empty() || bands.len() > NB_REFLECTIVE_BANDS {
            return Err(AtmosError::Table(format!(
                "table must hold 1 to {} bands, got {}",
                NB_REFLECTIVE_BANDS,
                bands.len()
            )));
        }
        for (ib, band) in bands.iter().enumerate() {
            // reference Rayleigh transmittances rescale the aerosol terms
            if !(band.td_r > 0.0 && band.tu_r > 0.0) {
                return Err(AtmosError::Table(format!(
                    "band {} has non-positive Rayleigh transmittance (td_r {}, tu_r {})",
                    ib, band.td_r, band.tu_r
                )));
            }
            for (name, values) in band.aot_fields() {
                if values.len() != aot.len() {
                    return Err(AtmosError::Table(format!(
                        "band {} field {} has {} values for {} AOT nodes",
                        ib,
                        name,
                        values.len(),
                        aot.len()
                    )));
                }
            }
        }
        Ok(Self { aot, bands })
    }

    pub fn nb_bands(&self) -> usize {
        self.bands.len()
    }

    pub fn nb_aot(&self) -> usize {
        self.aot.len()
    }

    /// Bracketing node `k` and weight for `aot550`.
    ///
    /// Linear scan from the low end; values past the last node stay in the
    /// last bracket and extrapolate along it.
    pub fn aot_bracket(&self, aot550: f32) -> (usize, f32) {
        let nb = self.aot.len();
        let mut k = 1;
        while k < nb && aot550 >= self.aot[k] {
            k += 1;
        }
        let k = (k - 1).min(nb - 2);
        let coef = (aot550 - self.aot[k]) / (self.aot[k + 1] - self.aot[k]);
        (k, coef)
    }
}

/// Scene inputs to the radiative-transfer solver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRequest {
    pub instrument: Instrument,
    pub sun_zenith: f32,        // degrees
    pub view_zenith: f32,       // degrees
    pub relative_azimuth: f32,  // degrees
    pub water_vapor: f32,       // g/cm2
    pub ozone: f32,             // cm-atm
    pub target_altitude: f32,   // km, sea level = 0
    pub month: u32,
    pub day: u32,
    pub surface_reflectance: f32,
}

impl TableRequest {
    /// Request for a scene, with the solver's fixed reference settings
    pub fn for_scene(
        instrument: Instrument,
        sun_zenith: f32,
        relative_azimuth: f32,
        water_vapor: f32,
        ozone: f32,
    ) -> Self {
        Self {
            instrument,
            sun_zenith,
            view_zenith: 0.0,
            relative_azimuth,
            water_vapor,
            ozone,
            target_altitude: 0.0,
            month: 9,
            day: 15,
            surface_reflectance: 0.14,
        }
    }
}

/// Source of radiative-transfer tables (typically a 6S run)
pub trait TableProvider {
    fn build_table(&self, request: &TableRequest) -> AtmosResult<RadiativeTransferTable>;
}

/// Provider returning a precomputed table whatever the request
#[derive(Debug, Clone)]
pub struct StaticTableProvider {
    table: RadiativeTransferTable,
}

impl StaticTableProvider {
    pub fn new(table: RadiativeTransferTable) -> Self {
        Self { table }
    }
}

impl TableProvider for StaticTableProvider {
    fn build_table(&self, request: &TableRequest) -> AtmosResult<RadiativeTransferTable> {
        log::debug!(
            "Static table for {} (sza {:.2}, phi {:.2}, wv {:.3}, oz {:.3})",
            request.instrument,
            request.sun_zenith,
            request.relative_azimuth,
            request.water_vapor,
            request.ozone
        );
        Ok(self.table.clone())
    }
}

#[cfg(test)]
pub(crate) fn sample_table() -> RadiativeTransferTable {
    use crate::core::rayleigh::{
        rayleigh_optical_depth, rayleigh_reflectance, rayleigh_spherical_albedo,
        rayleigh_transmittance,
    };

    let aot: Vec<f32> = vec![
        0.01, 0.05, 0.10, 0.15, 0.20, 0.30, 0.40, 0.60, 0.80, 1.00, 1.20, 1.40, 1.60, 1.80, 2.00,
    ];
    let mus = 30f64.to_radians().cos();
    let bands = (0..NB_REFLECTIVE_BANDS)
        .map(|ib| {
            let tau = rayleigh_optical_depth(ib, 1013.0).unwrap() as f64;
            let rho_r = rayleigh_reflectance(0.0, 1.0, mus, tau) as f32;
            let t_r = rayleigh_transmittance(mus, tau) as f32;
            let t_r_up = rayleigh_transmittance(1.0, tau) as f32;
            let s_r = rayleigh_spherical_albedo(tau) as f32;
            let aero = 1.0 - 0.1 * ib as f32; // weaker aerosol effect at longer wavelengths
            BandTable {
                tg_og: 0.98 + 0.002 * ib as f32,
                tg_h2o: 0.99 - 0.01 * ib as f32,
                rho_mol: rho_r,
                rho_r,
                td_r: t_r,
                tu_r: t_r_up,
                s_r,
                rho_ra: aot.iter().map(|a| rho_r + 0.1 * aero * a).collect(),
                td_ra: aot.iter().map(|a| t_r * (-0.3 * aero * a).exp()).collect(),
                tu_ra: aot.iter().map(|a| t_r_up * (-0.25 * aero * a).exp()).collect(),
                td_da: aot.iter().map(|a| (-0.3 * aero * a).exp()).collect(),
                tu_da: aot.iter().map(|a| (-0.25 * aero * a).exp()).collect(),
                s_ra: aot.iter().map(|a| s_r + 0.05 * aero * a).collect(),
            }
        })
        .collect();
    RadiativeTransferTable::new(aot, bands).unwrap()
}
