//! Scratch storage of the full-resolution cloud / dark-target mask.
//!
//! The mask is the only full-image product kept between passes. It lives in
//! a private temporary file of `lines * samples` bytes, removed when the
//! [`ScratchMaskFile`] is dropped. Each pipeline phase reopens it through its
//! own handle, and every handle borrows the file mutably so two phases can
//! never hold it at once.

use crate::types::{AtmosError, AtmosResult, ImageSize};
use ndarray::{Array2, ArrayView2};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use tempfile::TempPath;

pub struct ScratchMaskFile {
    path: TempPath,
    size: ImageSize,
}

impl ScratchMaskFile {
    /// Create an empty scratch file in the system temporary directory
    pub fn create(size: ImageSize) -> AtmosResult<Self> {
        let file = tempfile::Builder::new()
            .prefix("dark_target_")
            .tempfile()?;
        let path = file.into_temp_path();
        log::debug!("Scratch mask file: {}", path.display());
        Ok(Self { path, size })
    }

    /// Create the scratch file inside `dir`
    pub fn create_in<P: AsRef<std::path::Path>>(dir: P, size: ImageSize) -> AtmosResult<Self> {
        let file = tempfile::Builder::new()
            .prefix("dark_target_")
            .tempfile_in(dir)?;
        Ok(Self {
            path: file.into_temp_path(),
            size,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// Sequential writer for the cloud screening pass (truncates the file)
    pub fn writer(&mut self) -> AtmosResult<MaskWriter<'_>> {
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(MaskWriter {
            out: BufWriter::new(file),
            size: self.size,
            lines_written: 0,
            _scratch: self,
        })
    }

    /// Random-access read/update handle for the aerosol retrieval pass
    pub fn updater(&mut self) -> AtmosResult<MaskUpdater<'_>> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.check_length(&file)?;
        Ok(MaskUpdater {
            file,
            size: self.size,
            _scratch: self,
        })
    }

    /// Sequential reader for the final correction pass
    pub fn reader(&mut self) -> AtmosResult<MaskReader<'_>> {
        let file = File::open(&self.path)?;
        self.check_length(&file)?;
        Ok(MaskReader {
            input: BufReader::new(file),
            size: self.size,
            next_line: 0,
            _scratch: self,
        })
    }

    fn check_length(&self, file: &File) -> AtmosResult<()> {
        let expected = self.size.pixel_count() as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(AtmosError::Processing(format!(
                "scratch mask holds {} bytes, expected {}",
                actual, expected
            )));
        }
        Ok(())
    }
}

/// Write-only phase handle; lines must arrive in image order
pub struct MaskWriter<'a> {
    out: BufWriter<File>,
    size: ImageSize,
    lines_written: usize,
    _scratch: &'a ScratchMaskFile,
}

impl MaskWriter<'_> {
    /// Append the rows of `block`
    pub fn write_lines(&mut self, block: ArrayView2<'_, u8>) -> AtmosResult<()> {
        let (nb_lines, samples) = block.dim();
        if samples != self.size.samples {
            return Err(AtmosError::InvalidInput(format!(
                "mask block has {} samples, image has {}",
                samples, self.size.samples
            )));
        }
        if self.lines_written + nb_lines > self.size.lines {
            return Err(AtmosError::Processing(format!(
                "mask write past line {}",
                self.size.lines
            )));
        }
        for row in block.rows() {
            match row.as_slice() {
                Some(bytes) => self.out.write_all(bytes)?,
                None => self.out.write_all(&row.to_vec())?,
            }
        }
        self.lines_written += nb_lines;
        Ok(())
    }

    pub fn lines_written(&self) -> usize {
        self.lines_written
    }

    /// Flush and check that the whole image was written
    pub fn finish(mut self) -> AtmosResult<()> {
        self.out.flush()?;
        if self.lines_written != self.size.lines {
            return Err(AtmosError::Processing(format!(
                "mask has {} of {} lines",
                self.lines_written, self.size.lines
            )));
        }
        Ok(())
    }
}

/// Read-then-rewrite phase handle
pub struct MaskUpdater<'a> {
    file: File,
    size: ImageSize,
    _scratch: &'a ScratchMaskFile,
}

impl MaskUpdater<'_> {
    fn seek_line(&mut self, line: usize, nb_lines: usize) -> AtmosResult<()> {
        if line + nb_lines > self.size.lines {
            return Err(AtmosError::InvalidInput(format!(
                "mask lines {}..{} past line {}",
                line,
                line + nb_lines,
                self.size.lines
            )));
        }
        self.file
            .seek(SeekFrom::Start((line * self.size.samples) as u64))?;
        Ok(())
    }

    pub fn read_lines(&mut self, first_line: usize, nb_lines: usize) -> AtmosResult<Array2<u8>> {
        self.seek_line(first_line, nb_lines)?;
        let mut buf = vec![0u8; nb_lines * self.size.samples];
        self.file.read_exact(&mut buf)?;
        Array2::from_shape_vec((nb_lines, self.size.samples), buf)
            .map_err(|e| AtmosError::Processing(format!("Failed to reshape mask block: {}", e)))
    }

    pub fn write_lines(&mut self, first_line: usize, block: ArrayView2<'_, u8>) -> AtmosResult<()> {
        let (nb_lines, samples) = block.dim();
        if samples != self.size.samples {
            return Err(AtmosError::InvalidInput(format!(
                "mask block has {} samples, image has {}",
                samples, self.size.samples
            )));
        }
        self.seek_line(first_line, nb_lines)?;
        let bytes: Vec<u8> = block.iter().copied().collect();
        self.file.write_all(&bytes)?;
        Ok(())
    }

    pub fn finish(mut self) -> AtmosResult<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Read-only replay phase handle
pub struct MaskReader<'a> {
    input: BufReader<File>,
    size: ImageSize,
    next_line: usize,
    _scratch: &'a ScratchMaskFile,
}

impl MaskReader<'_> {
    /// Read the next line into `buf`
    pub fn read_line(&mut self, buf: &mut [u8]) -> AtmosResult<usize> {
        if buf.len() != self.size.samples {
            return Err(AtmosError::InvalidInput(format!(
                "mask buffer has {} samples, image has {}",
                buf.len(),
                self.size.samples
            )));
        }
        if self.next_line >= self.size.lines {
            return Err(AtmosError::Processing("mask read past the last line".to_string()));
        }
        self.input.read_exact(buf)?;
        let line = self.next_line;
        self.next_line += 1;
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let size = ImageSize::new(3, 4);
        let mut scratch = ScratchMaskFile::create_in(dir.path(), size).unwrap();

        let block = Array2::from_shape_fn((3, 4), |(l, s)| (l * 4 + s) as u8);
        let mut writer = scratch.writer().unwrap();
        writer.write_lines(block.view()).unwrap();
        writer.finish().unwrap();

        let mut updater = scratch.updater().unwrap();
        let mut middle = updater.read_lines(1, 1).unwrap();
        assert_eq!(middle.row(0).to_vec(), vec![4, 5, 6, 7]);
        middle.mapv_inplace(|v| v | 0x80);
        updater.write_lines(1, middle.view()).unwrap();
        updater.finish().unwrap();

        let mut reader = scratch.reader().unwrap();
        let mut line = vec![0u8; 4];
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, vec![0, 1, 2, 3]);
        assert_eq!(reader.read_line(&mut line).unwrap(), 1);
        assert_eq!(line, vec![0x84, 0x85, 0x86, 0x87]);
    }

    #[test]
    fn test_incomplete_write_is_reported() {
        let mut scratch = ScratchMaskFile::create(ImageSize::new(2, 2)).unwrap();
        let mut writer = scratch.writer().unwrap();
        writer.write_lines(Array2::zeros((1, 2)).view()).unwrap();
        assert!(writer.finish().is_err());
        assert!(scratch.reader().is_err());
    }

    #[test]
    fn test_file_removed_on_drop() {
        let scratch = ScratchMaskFile::create(ImageSize::new(1, 1)).unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.exists());
        drop(scratch);
        assert!(!path.exists());
    }
}
