//! Analytic molecular (Rayleigh) scattering terms used to move the
//! radiative-transfer table from its reference pressure to the actual
//! surface pressure of each coarse cell.

use crate::types::{AtmosError, AtmosResult, NB_REFLECTIVE_BANDS};

/// Sea-level Rayleigh optical depth of the reflective bands (1, 2, 3, 4, 5, 7)
pub const TAU_RAYLEIGH_SEA_LEVEL: [f32; NB_REFLECTIVE_BANDS] =
    [0.16511, 0.08614, 0.04716, 0.01835, 0.00113, 0.00037];

/// Pressure at which the sea-level optical depths apply (mb)
pub const RAYLEIGH_REFERENCE_PRESSURE: f32 = 1013.0;

/// Rayleigh optical depth of `band` at `pressure` mb
pub fn rayleigh_optical_depth(band: usize, pressure: f32) -> AtmosResult<f32> {
    let tau0 = TAU_RAYLEIGH_SEA_LEVEL.get(band).copied().ok_or_else(|| {
        AtmosError::InvalidInput(format!("no Rayleigh optical depth for band index {}", band))
    })?;
    Ok(tau0 * pressure / RAYLEIGH_REFERENCE_PRESSURE)
}

// Fit coefficients of the multiple-scattering correction (6S CHAND)
const AS0: [f64; 10] = [
    0.33243832,
    -6.777104e-02,
    0.16285370,
    1.577425e-03,
    -0.30924818,
    -1.240906e-02,
    -0.10324388,
    3.241678e-02,
    0.11493334,
    -3.503695e-02,
];
const AS1: [f64; 2] = [0.19666292, -5.439061e-02];
const AS2: [f64; 2] = [0.14545937, -2.910845e-02];

/// Molecular depolarization factor
const DEPOLARIZATION: f64 = 0.0279;

/// Rayleigh path reflectance.
///
/// `phi` is the relative azimuth in degrees, `muv`/`mus` the cosines of the
/// view and sun zenith angles and `tau` the Rayleigh optical depth.
pub fn rayleigh_reflectance(phi: f64, muv: f64, mus: f64, tau: f64) -> f64 {
    let phios = (180.0 - phi).to_radians();
    let cosf1 = 1.0;
    let cosf2 = phios.cos();
    let cosf3 = (2.0 * phios).cos();

    let beta2 = 0.5;
    let fd = DEPOLARIZATION / (2.0 - DEPOLARIZATION);
    let fd = (1.0 - fd) / (1.0 + 2.0 * fd);

    let mus2 = mus * mus;
    let muv2 = muv * muv;

    let ph1 = 1.0 + (3.0 * mus2 - 1.0) * (3.0 * muv2 - 1.0) * fd / 8.0;
    let ph2 = -mus * muv * (1.0 - mus2).sqrt() * (1.0 - muv2).sqrt() * fd * beta2 * 1.5;
    let ph3 = (1.0 - mus2) * (1.0 - muv2) * fd * beta2 * 0.375;

    // single scattering
    let itm = (1.0 - (-tau * (1.0 / mus + 1.0 / muv)).exp()) * mus / (4.0 * (mus + muv));
    let (p1, p2, p3) = (ph1 * itm, ph2 * itm, ph3 * itm);

    // multiple scattering correction
    let itm2 = (1.0 - (-tau / mus).exp()) * (1.0 - (-tau / muv).exp());
    let (cfonc1, cfonc2, cfonc3) = (ph1 * itm2, ph2 * itm2, ph3 * itm2);

    let lntau = tau.ln();
    let sum_mu = mus + muv;
    let prod_mu = mus * muv;
    let sum_mu2 = mus2 + muv2;
    let prod_mu2 = mus2 * muv2;
    let pl = [
        1.0,
        lntau,
        sum_mu,
        lntau * sum_mu,
        prod_mu,
        lntau * prod_mu,
        sum_mu2,
        lntau * sum_mu2,
        prod_mu2,
        lntau * prod_mu2,
    ];
    let fs0: f64 = pl.iter().zip(AS0.iter()).map(|(p, a)| p * a).sum();
    let fs1 = AS1[0] + lntau * AS1[1];
    let fs2 = AS2[0] + lntau * AS2[1];

    let xitot1 = p1 + cfonc1 * fs0 * mus;
    let xitot2 = p2 + cfonc2 * fs1 * mus;
    let xitot3 = p3 + cfonc3 * fs2 * mus;

    (xitot1 * cosf1 + 2.0 * xitot2 * cosf2 + 2.0 * xitot3 * cosf3) / mus
}

/// Exponential integral E1 by its series expansion
fn exp_integral_e1(tau: f64) -> f64 {
    const A: [f64; 6] = [
        -0.57721566,
        0.99999193,
        -0.24991055,
        0.05519968,
        -0.00976004,
        0.00107857,
    ];
    let mut xx = 1.0;
    let mut sum = 0.0;
    for a in A {
        sum += a * xx;
        xx *= tau;
    }
    sum - tau.ln()
}

/// Exponential integral E3
fn exp_integral_e3(tau: f64) -> f64 {
    ((-tau).exp() * (1.0 - tau) + tau * tau * exp_integral_e1(tau)) / 2.0
}

/// Rayleigh spherical albedo for optical depth `tau`
pub fn rayleigh_spherical_albedo(tau: f64) -> f64 {
    (3.0 * tau - exp_integral_e3(tau) * (4.0 + 2.0 * tau) + 2.0 * (-tau).exp()) / (4.0 + 3.0 * tau)
}

/// Two-stream Rayleigh transmittance along a path of zenith cosine `mu`
pub fn rayleigh_transmittance(mu: f64, tau: f64) -> f64 {
    ((2.0 / 3.0 + mu) + (2.0 / 3.0 - mu) * (-tau / mu).exp()) / (4.0 / 3.0 + tau)
}
