//! Input/output collaborators: raster sources and sinks, projection, DEM
//! reading and the scratch mask file

pub mod dem;
pub mod raster;
pub mod scratch;

pub use dem::{ByteOrder, DemReader};
pub use raster::{
    read_block, GeoPoint, GeographicProjector, InputRaster, LineBlock, MemoryRaster, MemorySink,
    OutputSink, Projector, INPUT_QA_FILL_BIT,
};
pub use scratch::{MaskReader, MaskUpdater, MaskWriter, ScratchMaskFile};
