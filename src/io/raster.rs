use crate::core::surface_reflectance::OutputLine;
use crate::types::{AtmosError, AtmosResult, ImageSize, QaBand};
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2};

/// Bit of the input QA byte flagging fill pixels
pub const INPUT_QA_FILL_BIT: u8 = 0x01;

/// Line-oriented source of calibrated TOA reflectance
pub trait InputRaster {
    fn size(&self) -> ImageSize;
    fn nb_bands(&self) -> usize;
    fn fill_value(&self) -> i16;
    fn saturation_value(&self) -> i16;
    fn has_thermal(&self) -> bool;

    fn read_band_line(&mut self, band: usize, line: usize, buf: &mut [i16]) -> AtmosResult<()>;
    fn read_qa_line(&mut self, line: usize, buf: &mut [u8]) -> AtmosResult<()>;

    /// Brightness temperature line, 0.1 K per count
    fn read_thermal_line(&mut self, line: usize, buf: &mut [i16]) -> AtmosResult<()>;
}

/// Destination of corrected lines
pub trait OutputSink {
    fn put_line(&mut self, line: usize, output: &OutputLine) -> AtmosResult<()>;
}

/// Geographic coordinate in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Mapping between image (line, sample) and geographic coordinates
pub trait Projector {
    fn to_geographic(&self, line: f64, sample: f64) -> AtmosResult<GeoPoint>;
    fn to_image(&self, point: GeoPoint) -> AtmosResult<(f64, f64)>;
}

/// A block of consecutive input lines, all bands
#[derive(Debug, Clone)]
pub struct LineBlock {
    pub first_line: usize,
    pub bands: Array3<i16>, // band x line x sample
    pub qa: Array2<u8>,
    pub thermal: Option<Array2<i16>>,
}

impl LineBlock {
    pub fn nb_lines(&self) -> usize {
        self.bands.dim().1
    }

    pub fn nb_samples(&self) -> usize {
        self.bands.dim().2
    }

    /// All bands of one line of the block (band x sample)
    pub fn line(&self, i: usize) -> ArrayView2<'_, i16> {
        self.bands.slice(s![.., i, ..])
    }

    pub fn thermal_line(&self, i: usize) -> Option<ArrayView1<'_, i16>> {
        self.thermal.as_ref().map(|t| t.row(i))
    }
}

/// Read `nb_lines` lines starting at `first_line`
pub fn read_block<R: InputRaster + ?Sized>(
    raster: &mut R,
    first_line: usize,
    nb_lines: usize,
) -> AtmosResult<LineBlock> {
    let size = raster.size();
    if first_line + nb_lines > size.lines {
        return Err(AtmosError::InvalidInput(format!(
            "block {}..{} is past the last line {}",
            first_line,
            first_line + nb_lines,
            size.lines
        )));
    }
    let nb_bands = raster.nb_bands();
    let mut bands = Array3::zeros((nb_bands, nb_lines, size.samples));
    let mut qa = Array2::zeros((nb_lines, size.samples));
    let mut thermal = raster
        .has_thermal()
        .then(|| Array2::zeros((nb_lines, size.samples)));
    let mut buf = vec![0i16; size.samples];
    let mut qa_buf = vec![0u8; size.samples];

    for i in 0..nb_lines {
        let line = first_line + i;
        for ib in 0..nb_bands {
            raster.read_band_line(ib, line, &mut buf)?;
            bands
                .slice_mut(s![ib, i, ..])
                .iter_mut()
                .zip(buf.iter())
                .for_each(|(d, v)| *d = *v);
        }
        raster.read_qa_line(line, &mut qa_buf)?;
        qa.row_mut(i).iter_mut().zip(qa_buf.iter()).for_each(|(d, v)| *d = *v);
        if let Some(t) = thermal.as_mut() {
            raster.read_thermal_line(line, &mut buf)?;
            t.row_mut(i).iter_mut().zip(buf.iter()).for_each(|(d, v)| *d = *v);
        }
    }

    Ok(LineBlock {
        first_line,
        bands,
        qa,
        thermal,
    })
}

/// Input raster held in memory
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    pub bands: Array3<i16>, // band x line x sample
    pub qa: Array2<u8>,
    pub thermal: Option<Array2<i16>>,
    pub fill: i16,
    pub saturation: i16,
}

impl MemoryRaster {
    pub fn new(
        bands: Array3<i16>,
        qa: Array2<u8>,
        thermal: Option<Array2<i16>>,
        fill: i16,
        saturation: i16,
    ) -> AtmosResult<Self> {
        let (_, lines, samples) = bands.dim();
        if qa.dim() != (lines, samples) {
            return Err(AtmosError::InvalidInput(format!(
                "QA band is {:?}, reflective bands are {}x{}",
                qa.dim(),
                lines,
                samples
            )));
        }
        if let Some(t) = &thermal {
            if t.dim() != (lines, samples) {
                return Err(AtmosError::InvalidInput(format!(
                    "thermal band is {:?}, reflective bands are {}x{}",
                    t.dim(),
                    lines,
                    samples
                )));
            }
        }
        Ok(Self {
            bands,
            qa,
            thermal,
            fill,
            saturation,
        })
    }

    fn check_line(&self, line: usize, len: usize) -> AtmosResult<()> {
        let size = self.size();
        if line >= size.lines || len != size.samples {
            return Err(AtmosError::InvalidInput(format!(
                "cannot read line {} into a buffer of {} (image {}x{})",
                line, len, size.lines, size.samples
            )));
        }
        Ok(())
    }
}

impl InputRaster for MemoryRaster {
    fn size(&self) -> ImageSize {
        let (_, lines, samples) = self.bands.dim();
        ImageSize::new(lines, samples)
    }

    fn nb_bands(&self) -> usize {
        self.bands.dim().0
    }

    fn fill_value(&self) -> i16 {
        self.fill
    }

    fn saturation_value(&self) -> i16 {
        self.saturation
    }

    fn has_thermal(&self) -> bool {
        self.thermal.is_some()
    }

    fn read_band_line(&mut self, band: usize, line: usize, buf: &mut [i16]) -> AtmosResult<()> {
        self.check_line(line, buf.len())?;
        if band >= self.nb_bands() {
            return Err(AtmosError::InvalidInput(format!("no band {}", band)));
        }
        for (d, v) in buf.iter_mut().zip(self.bands.slice(s![band, line, ..]).iter()) {
            *d = *v;
        }
        Ok(())
    }

    fn read_qa_line(&mut self, line: usize, buf: &mut [u8]) -> AtmosResult<()> {
        self.check_line(line, buf.len())?;
        for (d, v) in buf.iter_mut().zip(self.qa.row(line).iter()) {
            *d = *v;
        }
        Ok(())
    }

    fn read_thermal_line(&mut self, line: usize, buf: &mut [i16]) -> AtmosResult<()> {
        self.check_line(line, buf.len())?;
        let thermal = self
            .thermal
            .as_ref()
            .ok_or_else(|| AtmosError::InvalidInput("raster has no thermal band".to_string()))?;
        for (d, v) in buf.iter_mut().zip(thermal.row(line).iter()) {
            *d = *v;
        }
        Ok(())
    }
}

/// Output sink collecting every band in memory
#[derive(Debug, Clone)]
pub struct MemorySink {
    pub reflectance: Array3<i16>,  // band x line x sample
    pub aot: Array2<i16>,
    pub qa: Array3<u8>,            // QA band x line x sample
    pub dark_stats: Array3<i16>,   // (count, mean, stddev) x line x sample
    pub lines_written: usize,
}

impl MemorySink {
    pub fn new(nb_bands: usize, size: ImageSize) -> Self {
        Self {
            reflectance: Array3::zeros((nb_bands, size.lines, size.samples)),
            aot: Array2::zeros((size.lines, size.samples)),
            qa: Array3::zeros((QaBand::COUNT, size.lines, size.samples)),
            dark_stats: Array3::zeros((3, size.lines, size.samples)),
            lines_written: 0,
        }
    }

    pub fn qa_band(&self, band: QaBand) -> ArrayView2<'_, u8> {
        self.qa.slice(s![band.index(), .., ..])
    }
}

impl OutputSink for MemorySink {
    fn put_line(&mut self, line: usize, output: &OutputLine) -> AtmosResult<()> {
        let (nb_bands, lines, samples) = self.reflectance.dim();
        if line >= lines || output.nb_samples() != samples || output.nb_bands() != nb_bands {
            return Err(AtmosError::InvalidInput(format!(
                "output line {} does not fit a {}x{}x{} sink",
                line, nb_bands, lines, samples
            )));
        }
        self.reflectance
            .slice_mut(s![.., line, ..])
            .assign(&output.reflectance);
        self.aot.row_mut(line).assign(&output.aot);
        self.qa.slice_mut(s![.., line, ..]).assign(&output.qa);
        self.dark_stats.slice_mut(s![0, line, ..]).assign(&output.nb_dark);
        self.dark_stats.slice_mut(s![1, line, ..]).assign(&output.avg_dark);
        self.dark_stats.slice_mut(s![2, line, ..]).assign(&output.std_dark);
        self.lines_written += 1;
        Ok(())
    }
}

/// Regular lat/lon grid projection, optionally rotated against true north.
///
/// `rotation` is the clockwise angle (degrees) from image-up to true north.
#[derive(Debug, Clone, Copy)]
pub struct GeographicProjector {
    pub origin: GeoPoint,   // centre of pixel (0, 0)
    pub lat_step: f64,      // degrees per pixel along true north
    pub lon_step: f64,      // degrees per pixel along east
    pub rotation: f64,
}

impl GeographicProjector {
    pub fn north_up(origin: GeoPoint, lat_step: f64, lon_step: f64) -> Self {
        Self {
            origin,
            lat_step,
            lon_step,
            rotation: 0.0,
        }
    }
}

impl Projector for GeographicProjector {
    fn to_geographic(&self, line: f64, sample: f64) -> AtmosResult<GeoPoint> {
        let (sin_r, cos_r) = self.rotation.to_radians().sin_cos();
        let north = sample * sin_r - line * cos_r;
        let east = sample * cos_r + line * sin_r;
        Ok(GeoPoint {
            lat: self.origin.lat + north * self.lat_step,
            lon: self.origin.lon + east * self.lon_step,
        })
    }

    fn to_image(&self, point: GeoPoint) -> AtmosResult<(f64, f64)> {
        if self.lat_step == 0.0 || self.lon_step == 0.0 {
            return Err(AtmosError::Projection("degenerate pixel spacing".to_string()));
        }
        let (sin_r, cos_r) = self.rotation.to_radians().sin_cos();
        let north = (point.lat - self.origin.lat) / self.lat_step;
        let east = (point.lon - self.origin.lon) / self.lon_step;
        let sample = north * sin_r + east * cos_r;
        let line = -north * cos_r + east * sin_r;
        Ok((line, sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_projector_round_trip() {
        let proj = GeographicProjector {
            origin: GeoPoint { lat: 40.0, lon: -100.0 },
            lat_step: 0.001,
            lon_step: 0.0013,
            rotation: 12.0,
        };
        let p = proj.to_geographic(250.0, 75.0).unwrap();
        let (line, sample) = proj.to_image(p).unwrap();
        assert_abs_diff_eq!(line, 250.0, epsilon = 1e-9);
        assert_abs_diff_eq!(sample, 75.0, epsilon = 1e-9);
    }

    #[test]
    fn test_north_up_projector() {
        let proj = GeographicProjector::north_up(GeoPoint { lat: 10.0, lon: 20.0 }, 0.5, 0.25);
        let p = proj.to_geographic(2.0, 4.0).unwrap();
        assert_abs_diff_eq!(p.lat, 9.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.lon, 21.0, epsilon = 1e-12);
    }

    #[test]
    fn test_read_block() {
        let bands = Array3::from_shape_fn((2, 5, 3), |(b, l, s)| (100 * b + 10 * l + s) as i16);
        let qa = Array2::from_shape_fn((5, 3), |(l, _)| l as u8);
        let thermal = Array2::from_elem((5, 3), 2950i16);
        let mut raster = MemoryRaster::new(bands, qa, Some(thermal), -9999, 20000).unwrap();

        let block = read_block(&mut raster, 3, 2).unwrap();
        assert_eq!(block.nb_lines(), 2);
        assert_eq!(block.bands[[1, 0, 2]], 132);
        assert_eq!(block.qa[[1, 0]], 4);
        assert_eq!(block.thermal_line(1).unwrap()[0], 2950);
        assert!(read_block(&mut raster, 4, 2).is_err());
    }

    #[test]
    fn test_thermal_missing() {
        let mut raster = MemoryRaster::new(
            Array3::zeros((1, 2, 2)),
            Array2::zeros((2, 2)),
            None,
            -9999,
            20000,
        )
        .unwrap();
        let mut buf = vec![0i16; 2];
        assert!(raster.read_thermal_line(0, &mut buf).is_err());
        assert!(!raster.has_thermal());
    }
}
