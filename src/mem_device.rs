//! Memory-backed device persistence: a logical device (an SLD, or one LD
//! of an MLD) that advertises type-3 memory backs its DPA space with a
//! sparse file rather than an in-memory buffer, so capacities in the
//! gigabyte range don't have to be resident. No memory-mapping, no
//! `unsafe` — reads and writes are a seek followed by a plain read/write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::CxlError;

/// One logical device's DPA-addressed backing store.
pub struct MemoryDevice {
    file: File,
    size: u64,
}

impl MemoryDevice {
    /// Opens (creating if absent) the backing file at `path` and sizes it
    /// to `declared_size` bytes, sparse: the file's apparent length is set
    /// without writing the intervening bytes.
    pub fn open(path: impl AsRef<Path>, declared_size: u64) -> Result<Self, CxlError> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path).map_err(CxlError::from)?;
        file.set_len(declared_size).map_err(CxlError::from)?;
        Ok(MemoryDevice { file, size: declared_size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_bounds(&self, dpa: u64, len: usize) -> Result<(), CxlError> {
        let end = dpa.checked_add(len as u64).ok_or_else(|| CxlError::Validation("dpa range overflows".into()))?;
        if end > self.size {
            return Err(CxlError::Validation(format!(
                "dpa range [{dpa:#x}, {end:#x}) exceeds device size {:#x}",
                self.size
            )));
        }
        Ok(())
    }

    /// Reads `len` bytes starting at `dpa`.
    pub fn read(&mut self, dpa: u64, len: usize) -> Result<Vec<u8>, CxlError> {
        self.check_bounds(dpa, len)?;
        self.file.seek(SeekFrom::Start(dpa)).map_err(CxlError::from)?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).map_err(CxlError::from)?;
        Ok(buf)
    }

    /// Writes `data` starting at `dpa`.
    pub fn write(&mut self, dpa: u64, data: &[u8]) -> Result<(), CxlError> {
        self.check_bounds(dpa, data.len())?;
        self.file.seek(SeekFrom::Start(dpa)).map_err(CxlError::from)?;
        self.file.write_all(data).map_err(CxlError::from)?;
        Ok(())
    }

    /// Flushes pending writes to disk.
    pub fn sync(&mut self) -> Result<(), CxlError> {
        self.file.sync_data().map_err(CxlError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("cxl-fabric-test-{name}-{:?}", std::thread::current().id()))
    }

    #[test]
    fn write_then_read_roundtrips() {
        let path = temp_path("roundtrip");
        let mut device = MemoryDevice::open(&path, 0x10000).unwrap();
        device.write(0x40, &[1, 2, 3, 4]).unwrap();
        let data = device.read(0x40, 4).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
        device.sync().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn out_of_bound_access_is_rejected() {
        let path = temp_path("bounds");
        let mut device = MemoryDevice::open(&path, 0x1000).unwrap();
        assert!(device.write(0x0FFE, &[0u8; 8]).is_err());
        assert!(device.read(0x2000, 1).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn declared_size_is_reported() {
        let path = temp_path("size");
        let device = MemoryDevice::open(&path, 0x2_0000).unwrap();
        assert_eq!(device.size(), 0x2_0000);
        std::fs::remove_file(&path).ok();
    }
}
