//! atmocorr: atmospheric correction of Landsat TM/ETM+ imagery
//!
//! Converts top-of-atmosphere reflectance to surface reflectance with a
//! dark-target aerosol retrieval, a thermal cloud and shadow mask, and per
//! pixel QA bands. Raster I/O, projection and the radiative transfer code
//! are supplied by the caller through the traits in [`io`] and [`core`].

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    AtmosError, AtmosResult, ImageSize, Instrument, PipelineStage, QaBand, RegionSize,
    SceneMetadata,
};

pub use crate::core::{AtmosphericCorrector, CorrectionConfig, CorrectionReport, SceneInputs};
pub use io::{InputRaster, OutputSink, Projector};
