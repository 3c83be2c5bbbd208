use chrono::{DateTime, Datelike, Timelike, Utc};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// Number of reflective bands corrected (TM/ETM+ bands 1, 2, 3, 4, 5, 7)
pub const NB_REFLECTIVE_BANDS: usize = 6;

/// Reflective band indices used by the cloud and aerosol tests
pub const BAND_BLUE: usize = 0;
pub const BAND_GREEN: usize = 1;
pub const BAND_RED: usize = 2;
pub const BAND_NIR: usize = 3;
pub const BAND_SWIR1: usize = 4;
pub const BAND_SWIR2: usize = 5;

/// Scale of reflectance digital numbers (DN = reflectance * 10000)
pub const REFLECTANCE_SCALE: f32 = 10000.0;

/// Multi-band block of digital numbers (band x line x sample)
pub type BandBlock = Array3<i16>;

/// Per-pixel classification bytes (line x sample)
pub type MaskBlock = Array2<u8>;

/// Bit flags of the dark-target / cloud mask byte
pub mod mask_bits {
    pub const DARK_TARGET: u8 = 0x01;
    pub const ADJACENT_CLOUD: u8 = 0x04;
    pub const ADJACENT_SHADOW: u8 = 0x08;
    pub const WATER: u8 = 0x10;
    pub const CLOUD: u8 = 0x20;
    pub const CLOUD_SHADOW: u8 = 0x40;
    pub const SNOW: u8 = 0x80;

    /// Bits that disqualify a pixel as an aerosol dark target
    pub const CONTAMINATED: u8 =
        ADJACENT_CLOUD | ADJACENT_SHADOW | WATER | CLOUD | CLOUD_SHADOW | SNOW;
}

/// Sensor that acquired the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instrument {
    Tm,  // Landsat 4/5 Thematic Mapper
    Etm, // Landsat 7 Enhanced Thematic Mapper Plus
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instrument::Tm => write!(f, "TM"),
            Instrument::Etm => write!(f, "ETM+"),
        }
    }
}

/// Full-resolution image dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub lines: usize,
    pub samples: usize,
}

impl ImageSize {
    pub fn new(lines: usize, samples: usize) -> Self {
        Self { lines, samples }
    }

    pub fn pixel_count(&self) -> usize {
        self.lines * self.samples
    }
}

/// Size of one coarse aerosol region in full-resolution pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSize {
    pub lines: usize,
    pub samples: usize,
}

impl Default for RegionSize {
    fn default() -> Self {
        Self {
            lines: 40,   // ~1.2 km at 30 m
            samples: 40,
        }
    }
}

impl RegionSize {
    /// Coarse grid dimensions (rows, cols) covering `image`
    pub fn coarse_dims(&self, image: &ImageSize) -> (usize, usize) {
        (
            (image.lines + self.lines - 1) / self.lines,
            (image.samples + self.samples - 1) / self.samples,
        )
    }

    /// Number of valid lines in coarse row `row` (the last row may be truncated)
    pub fn lines_in_row(&self, row: usize, image: &ImageSize) -> usize {
        let first = row * self.lines;
        image.lines.saturating_sub(first).min(self.lines)
    }
}

/// Acquisition metadata of a scene
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub instrument: Instrument,
    pub acquisition_time: DateTime<Utc>,
    pub sun_zenith: f32,  // degrees
    pub sun_azimuth: f32, // degrees, clockwise from north
    pub pixel_size: f64,  // meters
    /// Ascending or flipped scene (upper-left corner south of lower-right)
    pub south_up: bool,
}

impl SceneMetadata {
    pub fn day_of_year(&self) -> u32 {
        self.acquisition_time.ordinal()
    }

    /// Acquisition time in GMT hours.
    ///
    /// A timestamp of exactly midnight means the time of day is unknown; it is
    /// then estimated from a 10:30 local overpass at `center_lon`.
    pub fn gmt_hours(&self, center_lon: f64) -> f32 {
        let t = self.acquisition_time;
        if t.hour() == 0 && t.minute() == 0 && t.second() == 0 {
            let gmt = 10.5 - center_lon / 15.0;
            return gmt.rem_euclid(24.0) as f32;
        }
        t.hour() as f32 + t.minute() as f32 / 60.0 + t.second() as f32 / 3600.0
    }

    /// Sun azimuth turned by 180 degrees for south-up scenes
    pub fn corrected_sun_azimuth(&self) -> f32 {
        if self.south_up {
            let az = self.sun_azimuth + 180.0;
            if az > 360.0 {
                az - 360.0
            } else {
                az
            }
        } else {
            self.sun_azimuth
        }
    }
}

/// Output QA bands, in sink order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QaBand {
    Fill,
    DarkTarget,
    Cloud,
    CloudShadow,
    Snow,
    LandWater,
    AdjacentCloud,
}

impl QaBand {
    pub const COUNT: usize = 7;

    pub const ALL: [QaBand; QaBand::COUNT] = [
        QaBand::Fill,
        QaBand::DarkTarget,
        QaBand::Cloud,
        QaBand::CloudShadow,
        QaBand::Snow,
        QaBand::LandWater,
        QaBand::AdjacentCloud,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for QaBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QaBand::Fill => "fill_QA",
            QaBand::DarkTarget => "DDV_QA",
            QaBand::Cloud => "cloud_QA",
            QaBand::CloudShadow => "cloud_shadow_QA",
            QaBand::Snow => "snow_QA",
            QaBand::LandWater => "land_water_QA",
            QaBand::AdjacentCloud => "adjacent_cloud_QA",
        };
        write!(f, "{}", name)
    }
}

pub const QA_ON: u8 = 1;
pub const QA_OFF: u8 = 0;

/// Pipeline stage, used to tag fatal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Setup,
    CoarseGrid,
    BackgroundCoefficients,
    CloudPass1,
    CloudPass2,
    AerosolRetrieval,
    GapFill,
    FinalCoefficients,
    SurfaceReflectance,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Setup => "setup",
            PipelineStage::CoarseGrid => "coarse grid",
            PipelineStage::BackgroundCoefficients => "background coefficients",
            PipelineStage::CloudPass1 => "cloud screening pass 1",
            PipelineStage::CloudPass2 => "cloud screening pass 2",
            PipelineStage::AerosolRetrieval => "aerosol retrieval",
            PipelineStage::GapFill => "aerosol gap fill",
            PipelineStage::FinalCoefficients => "final coefficients",
            PipelineStage::SurfaceReflectance => "surface reflectance",
        };
        write!(f, "{}", name)
    }
}

/// Error types for atmospheric correction
#[derive(Debug, thiserror::Error)]
pub enum AtmosError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Ancillary data error: {0}")]
    Ancillary(String),

    #[error("Radiative transfer table error: {0}")]
    Table(String),

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: Box<AtmosError>,
    },
}

impl AtmosError {
    /// Tag an error with the pipeline stage it aborted
    pub fn at_stage(self, stage: PipelineStage) -> Self {
        match self {
            AtmosError::Stage { .. } => self,
            other => AtmosError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Stage that produced this error, if tagged
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            AtmosError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type for atmospheric correction operations
pub type AtmosResult<T> = Result<T, AtmosError>;
