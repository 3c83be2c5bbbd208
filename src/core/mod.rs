//! Core atmospheric correction modules

pub mod aerosol;
pub mod ancillary;
pub mod atmos_coef;
pub mod cloud_mask;
pub mod coarse_grid;
pub mod pipeline;
pub mod radiative_transfer;
pub mod rayleigh;
pub mod surface_reflectance;
pub mod terrain_pressure;

// Re-export main types
pub use aerosol::{
    AerosolGrid, AerosolParams, AerosolRetriever, AerosolStats, CellRetrieval, DarkTargetRetriever,
    GapFiller, RetrievalContext,
};
pub use ancillary::{ozone_climatology, AncillaryField, AncillaryKind, AncillarySet, GridGeometry};
pub use atmos_coef::{AotField, AtmosCoefficientGrid, AtmosCoefficients};
pub use cloud_mask::{CloudScreeningParams, CloudShadowDetector, MaskSummary, ShadowGeometry};
pub use coarse_grid::{CoarseCell, CoarseGrid, CoarseGridInputs};
pub use pipeline::{AtmosphericCorrector, CorrectionConfig, CorrectionReport, SceneInputs};
pub use radiative_transfer::{
    BandTable, RadiativeTransferTable, StaticTableProvider, TableProvider, TableRequest,
};
pub use surface_reflectance::{
    CorrectionLimits, OutputLine, QaThresholds, SrStats, SurfaceReflectanceCorrector,
};
pub use terrain_pressure::{DemGrid, TerrainPressureModel};
