use anyhow::Result;
use atmocorr::core::ancillary::{AncillaryField, AncillaryKind, AncillarySet, GridGeometry};
use atmocorr::core::atmos_coef::cell_coefficients;
use atmocorr::core::coarse_grid::{CoarseCell, CoarseGrid, CoarseGridInputs};
use atmocorr::core::radiative_transfer::{BandTable, RadiativeTransferTable, StaticTableProvider};
use atmocorr::io::{GeoPoint, GeographicProjector, MemoryRaster, MemorySink};
use atmocorr::types::{ImageSize, Instrument, PipelineStage, QaBand, RegionSize, SceneMetadata};
use atmocorr::{AtmosphericCorrector, CorrectionConfig, CorrectionReport, SceneInputs};
use chrono::{TimeZone, Utc};
use ndarray::{Array2, Array3};

const LINES: usize = 30;
const SAMPLES: usize = 30;
const FILL: i16 = -9999;
const SATURATION: i16 = 20000;
const SCENE_AOT: f32 = 0.2;

/// Dark vegetation: blue, green, red follow the band 7 ratios
const SURFACE: [f32; 6] = [0.0099, 0.0135, 0.015, 0.30, 0.15, 0.03];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small analytic table; band 7 carries no aerosol signal
fn test_table() -> RadiativeTransferTable {
    let aot = vec![0.01f32, 0.05, 0.1, 0.2, 0.4, 0.8, 1.6];
    let bands = (0..6)
        .map(|ib| {
            let k = if ib == 5 { 0.0 } else { 1.0 - 0.15 * ib as f32 };
            let rho_r = 0.05 / (1.0 + ib as f32);
            BandTable {
                tg_og: 0.98,
                tg_h2o: 0.97,
                rho_mol: rho_r,
                rho_r,
                td_r: 0.9,
                tu_r: 0.95,
                s_r: 0.1,
                rho_ra: aot.iter().map(|a| rho_r + 0.1 * k * a).collect(),
                td_ra: aot.iter().map(|a| 0.9 * (-0.3 * k * a).exp()).collect(),
                tu_ra: aot.iter().map(|a| 0.95 * (-0.25 * k * a).exp()).collect(),
                td_da: aot.iter().map(|a| (-0.3 * k * a).exp()).collect(),
                tu_da: aot.iter().map(|a| (-0.25 * k * a).exp()).collect(),
                s_ra: aot.iter().map(|a| 0.1 + 0.05 * k * a).collect(),
            }
        })
        .collect();
    RadiativeTransferTable::new(aot, bands).unwrap()
}

fn uniform_field(kind: AncillaryKind, value: f32) -> AncillaryField {
    let geometry = GridGeometry {
        lat_first: 60.0,
        lat_step: -10.0,
        lon_first: 0.0,
        lon_step: 10.0,
        rows: 4,
        cols: 4,
    };
    AncillaryField::new(kind, geometry, Array3::from_elem((1, 4, 4), value), vec![12.0], 6.0).unwrap()
}

fn ancillary() -> AncillarySet {
    AncillarySet {
        surface_pressure: Some(uniform_field(AncillaryKind::SurfacePressure, 1013.0)),
        water_vapor: Some(uniform_field(AncillaryKind::WaterVapor, 2.0)),
        air_temperature: Some(uniform_field(AncillaryKind::AirTemperature, 290.0)),
        ozone: None,
    }
}

fn scene() -> SceneMetadata {
    SceneMetadata {
        instrument: Instrument::Etm,
        acquisition_time: Utc.with_ymd_and_hms(2005, 7, 15, 15, 0, 0).unwrap(),
        sun_zenith: 30.0,
        sun_azimuth: 135.0,
        pixel_size: 30.0,
        south_up: false,
    }
}

fn config() -> CorrectionConfig {
    CorrectionConfig {
        region: RegionSize { lines: 10, samples: 10 },
        ..CorrectionConfig::default()
    }
}

/// TOA digital numbers of `surface` seen through the scene atmosphere
fn toa_dn(surface: &[f32; 6], aot550: f32) -> [i16; 6] {
    let config = config();
    let scene = scene();
    let cell = CoarseCell {
        sun_zenith: scene.sun_zenith,
        view_zenith: config.view_zenith,
        relative_azimuth: scene.sun_azimuth,
        surface_pressure: 1013.0,
        valid: true,
        ..CoarseCell::default()
    };
    let coefs = cell_coefficients(&cell, &test_table(), aot550).unwrap();
    let mut dn = [0i16; 6];
    for ib in 0..6 {
        dn[ib] = (coefs[ib].toa_reflectance(surface[ib]) * 10000.0).round() as i16;
    }
    dn
}

fn vegetation_raster(thermal: bool) -> MemoryRaster {
    vegetation_raster_at(SCENE_AOT, thermal)
}

fn vegetation_raster_at(aot550: f32, thermal: bool) -> MemoryRaster {
    let dn = toa_dn(&SURFACE, aot550);
    let mut bands = Array3::zeros((6, LINES, SAMPLES));
    for ib in 0..6 {
        bands.slice_mut(ndarray::s![ib, .., ..]).fill(dn[ib]);
    }
    let thermal = thermal.then(|| Array2::from_elem((LINES, SAMPLES), 2950i16)); // 295 K
    MemoryRaster::new(bands, Array2::zeros((LINES, SAMPLES)), thermal, FILL, SATURATION).unwrap()
}

fn add_cloud(raster: &mut MemoryRaster) {
    raster
        .bands
        .slice_mut(ndarray::s![.., 2..7, 2..7])
        .fill(6000);
    if let Some(t) = raster.thermal.as_mut() {
        t.slice_mut(ndarray::s![2..7, 2..7]).fill(2500); // 250 K
    }
}

fn projector() -> GeographicProjector {
    GeographicProjector::north_up(GeoPoint { lat: 45.0, lon: 10.0 }, 0.00027, 0.00038)
}

fn run(raster: &mut MemoryRaster) -> atmocorr::AtmosResult<(CorrectionReport, MemorySink)> {
    run_scene(raster, scene())
}

fn run_scene(raster: &mut MemoryRaster, scene: SceneMetadata) -> atmocorr::AtmosResult<(CorrectionReport, MemorySink)> {
    let projector = projector();
    let ancillary = ancillary();
    let tables = StaticTableProvider::new(test_table());
    let mut inputs = SceneInputs {
        raster,
        projector: &projector,
        scene,
        ancillary: &ancillary,
        terrain: None,
        tables: &tables,
        scratch_dir: None,
    };
    let mut sink = MemorySink::new(6, ImageSize::new(LINES, SAMPLES));
    let report = AtmosphericCorrector::new(config()).run(&mut inputs, &mut sink)?;
    Ok((report, sink))
}

#[test]
fn test_clear_scene_recovers_aerosol_and_surface() -> Result<()> {
    init_logging();
    let mut raster = vegetation_raster(true);
    let (report, sink) = run(&mut raster)?;

    assert_eq!(report.total_pixels, LINES * SAMPLES);
    assert_eq!((report.coarse_rows, report.coarse_cols), (3, 3));
    assert_eq!(sink.lines_written, LINES);
    assert_eq!(report.mask.cloud, 0);
    assert_eq!(report.mask.dark_target, LINES * SAMPLES);

    // Band 1 AOT is the 550 nm value scaled to 486 nm
    let expected_aot = (SCENE_AOT * 550.0 / 486.0 * 1000.0).round() as i16;
    assert_eq!(report.aerosol.nfill, 0);
    assert!((report.aerosol.aot_min - expected_aot).abs() <= 3);
    assert!((report.aerosol.aot_max - expected_aot).abs() <= 3);
    assert!((sink.aot[[14, 14]] - expected_aot).abs() <= 3);

    for ib in 0..6 {
        let expected = SURFACE[ib] * 10000.0;
        let sr = sink.reflectance[[ib, 14, 14]] as f32;
        assert!(
            (sr - expected).abs() <= 15.0 + 0.02 * expected,
            "band {}: {} vs {}",
            ib,
            sr,
            expected
        );
    }

    assert_eq!(sink.qa_band(QaBand::DarkTarget)[[14, 14]], 1);
    assert_eq!(sink.qa_band(QaBand::Cloud)[[14, 14]], 0);
    assert_eq!(sink.qa_band(QaBand::Fill)[[14, 14]], 0);
    assert_eq!(sink.dark_stats[[0, 14, 14]], 100);
    Ok(())
}

/// Sea level, 30 degree sun, AOT 0.05: pixel (15, 15) sits on the centre of
/// cell (1, 1), so its output is the cell's own coefficients applied to the
/// input counts
#[test]
fn test_reference_scene_centre_pixel() -> Result<()> {
    init_logging();
    let dn = toa_dn(&SURFACE, 0.05);
    assert_eq!(dn, [744, 477, 342, 2864, 1433, 286]);
    let mut raster = vegetation_raster_at(0.05, true);
    let (report, sink) = run(&mut raster)?;

    assert_eq!(report.mask.dark_target, LINES * SAMPLES);
    assert_eq!(report.aerosol.nfill, 0);
    assert_eq!(report.aerosol.aot_min, 56);
    assert_eq!(report.aerosol.aot_max, 56);
    assert_eq!(sink.aot[[15, 15]], 56);

    let projector = projector();
    let ancillary = ancillary();
    let scene = scene();
    let config = config();
    let grid = CoarseGrid::build(
        ImageSize::new(LINES, SAMPLES),
        config.region,
        &CoarseGridInputs {
            projector: &projector,
            ancillary: &ancillary,
            terrain: None,
            scene: &scene,
            gmt: report.gmt_hours,
            view_zenith: config.view_zenith,
        },
    )?;
    // band 1 AOT x 1000 back to 550 nm
    let aot550 = 56.0f32 / 1000.0 * 486.0 / 550.0;
    let coefs = cell_coefficients(grid.cell(1, 1), &test_table(), aot550)?;
    for ib in 0..6 {
        let golden = (coefs[ib].surface_reflectance(dn[ib] as f32 / 10000.0) * 10000.0).round() as i16;
        assert_eq!(sink.reflectance[[ib, 15, 15]], golden, "band {}", ib);
        let truth = SURFACE[ib] * 10000.0;
        assert!((golden as f32 - truth).abs() <= 15.0 + 0.02 * truth, "band {}: {} vs {}", ib, golden, truth);
    }
    Ok(())
}

#[test]
fn test_fill_pixel_propagates() -> Result<()> {
    init_logging();
    let mut raster = vegetation_raster(true);
    raster.bands.slice_mut(ndarray::s![.., 15, 15]).fill(FILL);
    let (report, sink) = run(&mut raster)?;

    for ib in 0..6 {
        assert_eq!(sink.reflectance[[ib, 15, 15]], -9999);
        assert_eq!(report.reflectance.nfill[ib], 1);
    }
    assert_eq!(sink.qa_band(QaBand::Fill)[[15, 15]], 1);
    assert_eq!(sink.qa_band(QaBand::DarkTarget)[[15, 15]], 0);
    assert_eq!(sink.aot[[15, 15]], -9999);
    assert_eq!(sink.dark_stats[[0, 15, 15]], 0);
    assert_eq!(sink.dark_stats[[1, 15, 15]], FILL);

    // The centre region loses one dark target
    assert_eq!(sink.dark_stats[[0, 14, 14]], 99);
    Ok(())
}

#[test]
fn test_runs_are_reproducible() -> Result<()> {
    init_logging();
    let mut first = vegetation_raster(true);
    add_cloud(&mut first);
    let mut second = first.clone();
    let (_, a) = run(&mut first)?;
    let (_, b) = run(&mut second)?;
    assert_eq!(a.reflectance, b.reflectance);
    assert_eq!(a.qa, b.qa);
    assert_eq!(a.aot, b.aot);
    Ok(())
}

#[test]
fn test_thermal_cloud_is_flagged() -> Result<()> {
    init_logging();
    let mut raster = vegetation_raster(true);
    add_cloud(&mut raster);
    let (report, sink) = run(&mut raster)?;

    assert_eq!(report.mask.cloud, 25);
    assert!(report.mask.adjacent_cloud > 0);
    let cloud = sink.qa_band(QaBand::Cloud);
    assert_eq!(cloud[[4, 4]], 1);
    assert_eq!(cloud[[25, 25]], 0);
    assert_eq!(sink.qa_band(QaBand::DarkTarget)[[4, 4]], 0);
    assert!(sink.reflectance[[2, 4, 4]] > 5000);
    Ok(())
}

#[test]
fn test_visible_only_scene_uses_mask_cloud_bit() -> Result<()> {
    init_logging();
    let mut raster = vegetation_raster(false);
    add_cloud(&mut raster);
    let (report, sink) = run(&mut raster)?;

    assert_eq!(report.mask.cloud, 25);
    assert_eq!(report.mask.adjacent_cloud, 0);
    assert_eq!(report.mask.shadow, 0);
    let cloud = sink.qa_band(QaBand::Cloud);
    assert_eq!(cloud[[4, 4]], 1);
    assert_eq!(cloud[[14, 14]], 0);
    Ok(())
}

#[test]
fn test_wrong_band_count_fails_in_setup() {
    init_logging();
    let bands = Array3::zeros((5, LINES, SAMPLES));
    let mut raster = MemoryRaster::new(bands, Array2::zeros((LINES, SAMPLES)), None, FILL, SATURATION).unwrap();
    let err = run(&mut raster).err().expect("five bands must be rejected");
    assert_eq!(err.stage(), Some(PipelineStage::Setup));
}

#[test]
fn test_zero_pixel_size_fails_in_setup() {
    init_logging();
    let mut raster = vegetation_raster(true);
    let scene = SceneMetadata {
        pixel_size: 0.0,
        ..scene()
    };
    let err = run_scene(&mut raster, scene).err().expect("zero pixel size must be rejected");
    assert_eq!(err.stage(), Some(PipelineStage::Setup));
    assert!(err.to_string().contains("pixel size"));
}

#[test]
fn test_missing_ancillary_fails_in_setup() {
    init_logging();
    let mut raster = vegetation_raster(true);
    let projector = projector();
    let ancillary = AncillarySet {
        water_vapor: None,
        ..ancillary()
    };
    let tables = StaticTableProvider::new(test_table());
    let mut inputs = SceneInputs {
        raster: &mut raster,
        projector: &projector,
        scene: scene(),
        ancillary: &ancillary,
        terrain: None,
        tables: &tables,
        scratch_dir: None,
    };
    let mut sink = MemorySink::new(6, ImageSize::new(LINES, SAMPLES));
    let err = AtmosphericCorrector::standard()
        .run(&mut inputs, &mut sink)
        .err()
        .expect("water vapour is required");
    assert_eq!(err.stage(), Some(PipelineStage::Setup));
    assert!(err.to_string().contains("water vapor"));
}

#[test]
fn test_scratch_mask_removed_after_run() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let mut raster = vegetation_raster(true);
    let projector = projector();
    let ancillary = ancillary();
    let tables = StaticTableProvider::new(test_table());
    let mut inputs = SceneInputs {
        raster: &mut raster,
        projector: &projector,
        scene: scene(),
        ancillary: &ancillary,
        terrain: None,
        tables: &tables,
        scratch_dir: Some(dir.path().to_path_buf()),
    };
    let mut sink = MemorySink::new(6, ImageSize::new(LINES, SAMPLES));
    AtmosphericCorrector::new(config()).run(&mut inputs, &mut sink)?;
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}
