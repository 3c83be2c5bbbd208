use crate::core::terrain_pressure::DemGrid;
use crate::types::{AtmosError, AtmosResult};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Byte order of a raw elevation file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

/// Digital Elevation Model reader
pub struct DemReader;

impl DemReader {
    /// Read the global 0.05 degree elevation grid stored as raw 16-bit integers
    pub fn read_global_cmg<P: AsRef<Path>>(dem_path: P, order: ByteOrder) -> AtmosResult<DemGrid> {
        log::info!("Reading DEM from: {}", dem_path.as_ref().display());
        let file = File::open(dem_path.as_ref())?;
        let elevations = Self::read_raw(
            BufReader::new(file),
            DemGrid::CMG_ROWS,
            DemGrid::CMG_COLS,
            order,
        )?;
        DemGrid::global_cmg(elevations)
    }

    /// Read `rows * cols` raw 16-bit elevations
    pub fn read_raw<R: Read>(
        mut reader: R,
        rows: usize,
        cols: usize,
        order: ByteOrder,
    ) -> AtmosResult<Array2<i16>> {
        let mut bytes = vec![0u8; rows * cols * 2];
        reader.read_exact(&mut bytes)?;

        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| match order {
                ByteOrder::BigEndian => i16::from_be_bytes([b[0], b[1]]),
                ByteOrder::LittleEndian => i16::from_le_bytes([b[0], b[1]]),
            })
            .collect();
        log::debug!("DEM size: {}x{}", rows, cols);

        Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| AtmosError::Processing(format!("Failed to reshape DEM data: {}", e)))
    }
}
