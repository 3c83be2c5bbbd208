//! End-to-end atmospheric correction of one scene.
//!
//! Stages run strictly in order, each consuming the complete output of the
//! previous one:
//!
//! 1. coarse grid geometry and atmosphere, background coefficients
//! 2. cloud screening pass 1 (clear-sky statistics)
//! 3. cloud screening pass 2 (mask, dilation, shadows) into the scratch file
//! 4. aerosol retrieval per coarse row, rewriting the dark target mask
//! 5. gap fill and final coefficients at the retrieved AOT
//! 6. surface reflectance and QA, line by line, to the output sink

use crate::core::aerosol::{
    AerosolGrid, AerosolParams, AerosolRetriever, AerosolStats, DarkTargetRetriever, GapFiller,
    RetrievalContext,
};
use crate::core::ancillary::AncillarySet;
use crate::core::atmos_coef::{AotField, AtmosCoefficientGrid, BACKGROUND_AOT550};
use crate::core::cloud_mask::{CloudScreeningParams, CloudShadowDetector, MaskSummary, ShadowGeometry};
use crate::core::coarse_grid::{scene_center, true_north_adjustment, CoarseGrid, CoarseGridInputs};
use crate::core::radiative_transfer::{RadiativeTransferTable, TableProvider, TableRequest};
use crate::core::surface_reflectance::{
    CorrectionLimits, OutputLine, QaThresholds, SrStats, SurfaceReflectanceCorrector,
};
use crate::core::terrain_pressure::TerrainPressureModel;
use crate::io::raster::{read_block, InputRaster, OutputSink, Projector};
use crate::io::scratch::ScratchMaskFile;
use crate::types::{
    AtmosError, AtmosResult, ImageSize, PipelineStage, RegionSize, SceneMetadata,
    NB_REFLECTIVE_BANDS,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Processing configuration of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionConfig {
    pub region: RegionSize,
    pub cloud: CloudScreeningParams,
    pub aerosol: AerosolParams,
    pub limits: CorrectionLimits,
    pub qa: QaThresholds,
    pub background_aot550: f32,
    /// Nominal view zenith of the coarse cells (degrees)
    pub view_zenith: f32,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            region: RegionSize::default(),
            cloud: CloudScreeningParams::default(),
            aerosol: AerosolParams::default(),
            limits: CorrectionLimits::default(),
            qa: QaThresholds::default(),
            background_aot550: BACKGROUND_AOT550,
            view_zenith: 3.5,
        }
    }
}

/// Collaborators and metadata of one scene
pub struct SceneInputs<'a> {
    pub raster: &'a mut dyn InputRaster,
    pub projector: &'a dyn Projector,
    pub scene: SceneMetadata,
    pub ancillary: &'a AncillarySet,
    pub terrain: Option<&'a TerrainPressureModel>,
    pub tables: &'a dyn TableProvider,
    /// Directory of the scratch mask file, system temp dir when `None`
    pub scratch_dir: Option<PathBuf>,
}

/// Statistics of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionReport {
    pub total_pixels: usize,
    pub gmt_hours: f32,
    pub adjust_north: f64,
    pub coarse_rows: usize,
    pub coarse_cols: usize,
    pub aerosol: AerosolStats,
    pub aerosol_gaps_filled: usize,
    pub mask: MaskSummary,
    pub reflectance: SrStats,
}

impl CorrectionReport {
    pub fn log_summary(&self) {
        log::info!("Total pixels: {}", self.total_pixels);
        log::info!(
            "Aerosol coarse grid: nfill {} min {} max {} ({} gaps filled)",
            self.aerosol.nfill,
            self.aerosol.aot_min,
            self.aerosol.aot_max,
            self.aerosol_gaps_filled
        );
        let sr = &self.reflectance;
        for ib in 0..sr.nfill.len() {
            log::info!(
                "Band {}: nfill {} nsatu {} nout_range {} min {} max {}",
                ib + 1,
                sr.nfill[ib],
                sr.nsatu[ib],
                sr.nout_range[ib],
                sr.sr_min[ib],
                sr.sr_max[ib]
            );
        }
    }
}

/// Scene-wide state built during setup
struct SceneSetup {
    size: ImageSize,
    gmt: f32,
    adjust_north: f64,
    table: RadiativeTransferTable,
}

/// Runs the whole correction for a scene
pub struct AtmosphericCorrector {
    config: CorrectionConfig,
    retriever: Box<dyn AerosolRetriever>,
}

impl AtmosphericCorrector {
    pub fn new(config: CorrectionConfig) -> Self {
        let retriever = Box::new(DarkTargetRetriever::new(config.aerosol.clone()));
        Self { config, retriever }
    }

    /// Corrector with the default configuration
    pub fn standard() -> Self {
        Self::new(CorrectionConfig::default())
    }

    /// Replace the dark target retriever
    pub fn with_retriever(mut self, retriever: Box<dyn AerosolRetriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    pub fn run(
        &self,
        inputs: &mut SceneInputs<'_>,
        sink: &mut dyn OutputSink,
    ) -> AtmosResult<CorrectionReport> {
        let start = std::time::Instant::now();
        log::info!(
            "Atmospheric correction of a {} scene acquired {}",
            inputs.scene.instrument,
            inputs.scene.acquisition_time
        );

        let setup = self
            .setup(inputs)
            .map_err(|e| e.at_stage(PipelineStage::Setup))?;
        let size = setup.size;
        let region = self.config.region;

        let grid = CoarseGrid::build(
            size,
            region,
            &CoarseGridInputs {
                projector: inputs.projector,
                ancillary: inputs.ancillary,
                terrain: inputs.terrain,
                scene: &inputs.scene,
                gmt: setup.gmt,
                view_zenith: self.config.view_zenith,
            },
        )
        .map_err(|e| e.at_stage(PipelineStage::CoarseGrid))?;

        let mut coefs = AtmosCoefficientGrid::for_grid(&grid, setup.table.nb_bands());
        coefs
            .update(&grid, &setup.table, AotField::Uniform(self.config.background_aot550))
            .map_err(|e| e.at_stage(PipelineStage::BackgroundCoefficients))?;
        if coefs.nb_computed() == 0 {
            return Err(AtmosError::Processing("no coarse cell could be geolocated".to_string())
                .at_stage(PipelineStage::BackgroundCoefficients));
        }

        let has_thermal = inputs.raster.has_thermal();
        let mut detector = CloudShadowDetector::new(
            self.config.cloud.clone(),
            size,
            region,
            inputs.raster.fill_value(),
            has_thermal,
        )
        .map_err(|e| e.at_stage(PipelineStage::CloudPass1))?;
        if has_thermal {
            self.cloud_pass1(inputs, &grid, &coefs, &setup, &mut detector)
                .map_err(|e| e.at_stage(PipelineStage::CloudPass1))?;
        }

        let mut scratch = match &inputs.scratch_dir {
            Some(dir) => ScratchMaskFile::create_in(dir, size),
            None => ScratchMaskFile::create(size),
        }
        .map_err(|e| e.at_stage(PipelineStage::CloudPass2))?;
        let mask = self
            .cloud_pass2(inputs, &coefs, &setup, &mut detector, &mut scratch)
            .map_err(|e| e.at_stage(PipelineStage::CloudPass2))?;

        let (mut aerosol, aerosol_stats) = self
            .retrieve_aerosol(inputs, &grid, &setup, &mut scratch)
            .map_err(|e| e.at_stage(PipelineStage::AerosolRetrieval))?;

        let filled = GapFiller
            .fill(&mut aerosol, 0)
            .map_err(|e| e.at_stage(PipelineStage::GapFill))?;

        let retrieved = AotField::Retrieved {
            grid: &aerosol,
            background: self.config.background_aot550,
        };
        coefs
            .update(&grid, &setup.table, retrieved)
            .map_err(|e| e.at_stage(PipelineStage::FinalCoefficients))?;

        let reflectance = self
            .correct(inputs, sink, &coefs, &aerosol, &mut scratch)
            .map_err(|e| e.at_stage(PipelineStage::SurfaceReflectance))?;

        let report = CorrectionReport {
            total_pixels: size.pixel_count(),
            gmt_hours: setup.gmt,
            adjust_north: setup.adjust_north,
            coarse_rows: grid.rows(),
            coarse_cols: grid.cols(),
            aerosol: aerosol_stats,
            aerosol_gaps_filled: filled,
            mask,
            reflectance,
        };
        report.log_summary();
        log::info!("Atmospheric correction completed in {:.2?}", start.elapsed());
        Ok(report)
    }

    fn setup(&self, inputs: &mut SceneInputs<'_>) -> AtmosResult<SceneSetup> {
        let size = inputs.raster.size();
        if size.lines == 0 || size.samples == 0 {
            return Err(AtmosError::InvalidInput("empty input raster".to_string()));
        }
        if inputs.raster.nb_bands() != NB_REFLECTIVE_BANDS {
            return Err(AtmosError::InvalidInput(format!(
                "expected {} reflective bands, raster has {}",
                NB_REFLECTIVE_BANDS,
                inputs.raster.nb_bands()
            )));
        }
        let region = self.config.region;
        if region.lines == 0 || region.samples == 0 {
            return Err(AtmosError::InvalidInput("region size must be positive".to_string()));
        }
        if !(inputs.scene.pixel_size > 0.0) {
            return Err(AtmosError::InvalidInput(format!(
                "pixel size must be positive, got {}",
                inputs.scene.pixel_size
            )));
        }
        inputs.ancillary.validate()?;

        let center = scene_center(inputs.projector, size)?;
        let gmt = inputs.scene.gmt_hours(center.lon);
        let adjust_north = true_north_adjustment(inputs.projector, size)?;
        log::debug!(
            "Scene centre ({:.4}, {:.4}), GMT {:.3} h, true north adjustment {:.4} degrees",
            center.lat,
            center.lon,
            gmt,
            adjust_north
        );

        let request = TableRequest::for_scene(
            inputs.scene.instrument,
            inputs.scene.sun_zenith,
            inputs.scene.corrected_sun_azimuth(),
            inputs.ancillary.water_vapor(center.lat, center.lon, gmt)?,
            inputs
                .ancillary
                .ozone(center.lat, center.lon, gmt, inputs.scene.day_of_year()),
        );
        let table = inputs.tables.build_table(&request)?;
        if table.nb_bands() != NB_REFLECTIVE_BANDS {
            return Err(AtmosError::Table(format!(
                "table holds {} bands, {} are corrected",
                table.nb_bands(),
                NB_REFLECTIVE_BANDS
            )));
        }
        log::info!(
            "Scene {}x{} pixels, radiative transfer table with {} AOT nodes",
            size.lines,
            size.samples,
            table.nb_aot()
        );
        Ok(SceneSetup {
            size,
            gmt,
            adjust_north,
            table,
        })
    }

    fn cloud_pass1(
        &self,
        inputs: &mut SceneInputs<'_>,
        grid: &CoarseGrid,
        coefs: &AtmosCoefficientGrid,
        setup: &SceneSetup,
        detector: &mut CloudShadowDetector,
    ) -> AtmosResult<()> {
        log::info!("Cloud screening pass 1: clear-sky statistics");
        let region = self.config.region;
        let size = setup.size;
        let airtemp = cell_air_temperature(grid, inputs.ancillary, setup.gmt)?;

        let mut line_airtemp = vec![0.0f32; size.samples];
        for row in 0..grid.rows() {
            let first = row * region.lines;
            let block = read_block(&mut *inputs.raster, first, region.lines_in_row(row, &size))?;
            for (sample, t) in line_airtemp.iter_mut().enumerate() {
                *t = airtemp[[row, sample / region.samples]];
            }
            let thermal = block
                .thermal
                .as_ref()
                .ok_or_else(|| AtmosError::InvalidInput("thermal band missing from block".to_string()))?;
            for i in 0..block.nb_lines() {
                detector.accumulate_line(
                    first + i,
                    block.line(i),
                    block.qa.row(i),
                    thermal.row(i),
                    &line_airtemp,
                    coefs,
                )?;
            }
        }

        let projector = inputs.projector;
        let ancillary = inputs.ancillary;
        let gmt = setup.gmt;
        detector.finish_pass1(|line, sample| {
            let geo = projector.to_geographic(line, sample)?;
            ancillary.air_temperature(geo.lat, geo.lon, gmt)
        })?;
        log::info!("Cloud screening pass 1 completed");
        Ok(())
    }

    fn cloud_pass2(
        &self,
        inputs: &mut SceneInputs<'_>,
        coefs: &AtmosCoefficientGrid,
        setup: &SceneSetup,
        detector: &mut CloudShadowDetector,
        scratch: &mut ScratchMaskFile,
    ) -> AtmosResult<MaskSummary> {
        log::info!("Cloud screening pass 2: cloud, shadow and dark target mask");
        let region = self.config.region;
        let size = setup.size;
        let (rows, _) = region.coarse_dims(&size);
        let geometry = ShadowGeometry {
            sun_zenith: inputs.scene.sun_zenith,
            sun_azimuth: inputs.scene.corrected_sun_azimuth(),
            adjust_north: setup.adjust_north,
            pixel_size: inputs.scene.pixel_size,
        };

        let mut writer = scratch.writer()?;
        for row in 0..rows {
            let block = read_block(&mut *inputs.raster, row * region.lines, region.lines_in_row(row, &size))?;
            detector.classify_block(&block, coefs)?;
            detector.end_block(&block, &geometry, &mut writer)?;
        }
        let summary = detector.finish(&mut writer)?;
        writer.finish()?;
        Ok(summary)
    }

    fn retrieve_aerosol(
        &self,
        inputs: &mut SceneInputs<'_>,
        grid: &CoarseGrid,
        setup: &SceneSetup,
        scratch: &mut ScratchMaskFile,
    ) -> AtmosResult<(AerosolGrid, AerosolStats)> {
        log::info!("Retrieving aerosol over {}x{} regions", grid.rows(), grid.cols());
        let region = self.config.region;
        let size = setup.size;
        let aerosol_fill = self.config.aerosol.aerosol_fill;
        let ctx = RetrievalContext {
            grid,
            table: &setup.table,
            input_fill: inputs.raster.fill_value(),
            background_aot550: self.config.background_aot550,
        };

        let mut aerosol = AerosolGrid::new(grid.rows(), grid.cols(), region, aerosol_fill);
        let mut stats = AerosolStats::default();
        let mut updater = scratch.updater()?;
        for row in 0..grid.rows() {
            let first = row * region.lines;
            let nb_lines = region.lines_in_row(row, &size);
            let block = read_block(&mut *inputs.raster, first, nb_lines)?;
            let mut mask = updater.read_lines(first, nb_lines)?;
            let cells = self.retriever.retrieve_row(row, &block, mask.view_mut(), &ctx)?;
            if cells.len() != grid.cols() {
                return Err(AtmosError::Processing(format!(
                    "aerosol retriever returned {} cells for a row of {}",
                    cells.len(),
                    grid.cols()
                )));
            }
            updater.write_lines(first, mask.view())?;
            for (col, cell) in cells.iter().enumerate() {
                aerosol.set_cell(row, col, cell);
                stats.add(cell.aot[0], aerosol_fill);
            }
        }
        updater.finish()?;

        if stats.nfill == grid.rows() * grid.cols() {
            log::warn!("No dark targets found in the scene");
        }
        log::info!(
            "Aerosol retrieved in {} of {} regions",
            grid.rows() * grid.cols() - stats.nfill,
            grid.rows() * grid.cols()
        );
        Ok((aerosol, stats))
    }

    fn correct(
        &self,
        inputs: &mut SceneInputs<'_>,
        sink: &mut dyn OutputSink,
        coefs: &AtmosCoefficientGrid,
        aerosol: &AerosolGrid,
        scratch: &mut ScratchMaskFile,
    ) -> AtmosResult<SrStats> {
        let size = inputs.raster.size();
        log::info!("Computing surface reflectance for {} lines", size.lines);
        let mut corrector = SurfaceReflectanceCorrector::new(
            coefs,
            self.config.limits.clone(),
            self.config.qa.clone(),
            inputs.raster.fill_value(),
            inputs.raster.saturation_value(),
            self.config.aerosol.aerosol_fill,
        );
        if !inputs.raster.has_thermal() {
            log::warn!("No thermal band: QA cloud band taken from the cloud mask");
        }

        let mut reader = scratch.reader()?;
        let mut mask_line = vec![0u8; size.samples];
        let mut out = OutputLine::new(coefs.nb_bands(), size.samples);
        for line in 0..size.lines {
            let block = read_block(&mut *inputs.raster, line, 1)?;
            corrector.correct_line(line, block.line(0), &mut out)?;
            reader.read_line(&mut mask_line)?;
            corrector.apply_qa(line, block.line(0), block.thermal_line(0), &mask_line, aerosol, &mut out)?;
            sink.put_line(line, &out)?;
            if line % 1000 == 0 {
                log::debug!("Surface reflectance line {}", line);
            }
        }
        Ok(corrector.into_stats())
    }
}

/// 2 m air temperature at each coarse cell; cells without geolocation take
/// the mean of the others
fn cell_air_temperature(grid: &CoarseGrid, ancillary: &AncillarySet, gmt: f32) -> AtmosResult<Array2<f32>> {
    let mut airtemp = Array2::zeros((grid.rows(), grid.cols()));
    let mut sum = 0.0f64;
    let mut n = 0usize;
    for ((row, col), cell) in grid.cells.indexed_iter() {
        if cell.valid {
            let t = ancillary.air_temperature(cell.lat, cell.lon, gmt)?;
            airtemp[[row, col]] = t;
            sum += t as f64;
            n += 1;
        }
    }
    if n > 0 {
        let mean = (sum / n as f64) as f32;
        for ((row, col), cell) in grid.cells.indexed_iter() {
            if !cell.valid {
                airtemp[[row, col]] = mean;
            }
        }
    }
    Ok(airtemp)
}
