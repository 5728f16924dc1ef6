//! Filesystem array-store sink and its read-back accessor.
//!
//! [`DirectoryStore`] stages every write under `<dest>.partial` and renames
//! the staging directory onto the destination when `finalize` is invoked.
//! Until then a fresh read of the destination sees nothing, so an aborted
//! or failed run leaves the destination absent or in its pre-run state.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use super::{ArrayStoreSink, Result, StoreError, StoreMetadata};
use crate::core::granule::AttributeColumn;

/// Sidecar metadata file name inside the container.
const METADATA_FILE: &str = "metadata.json";

/// Suffix of the staging directory next to the destination.
const STAGING_SUFFIX: &str = ".partial";

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(STAGING_SUFFIX);
    dest.with_file_name(name)
}

/// Chunk-oriented store rooted at a destination directory.
pub struct DirectoryStore {
    dest: PathBuf,
    staging: PathBuf,
    finalized: AtomicBool,
}

impl DirectoryStore {
    /// Prepare a store for writing. A stale staging directory from a
    /// crashed run is removed; the destination itself is left untouched
    /// until `finalize`.
    pub fn create<P: AsRef<Path>>(dest: P) -> Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        let staging = staging_path(&dest);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        Ok(Self {
            dest,
            staging,
            finalized: AtomicBool::new(false),
        })
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }
}

impl ArrayStoreSink for DirectoryStore {
    fn create_chunk(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.staging.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(&target)?);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn write_attribute_metadata(&self, metadata: &serde_json::Value) -> Result<()> {
        let file = File::create(self.staging.join(METADATA_FILE))?;
        serde_json::to_writer_pretty(BufWriter::new(file), metadata)?;
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(StoreError::AlreadyFinalized {
                path: self.dest.clone(),
            });
        }
        // Replacing an existing container is a single rename after the old
        // tree is gone; a crash in between leaves the staging tree intact
        // for the next run to pick up or discard.
        if self.dest.exists() {
            fs::remove_dir_all(&self.dest)?;
        }
        fs::rename(&self.staging, &self.dest)?;
        debug!("finalized store at {}", self.dest.display());
        Ok(())
    }

    fn discard(&self) -> Result<()> {
        if self.staging.exists() {
            fs::remove_dir_all(&self.staging)?;
        }
        Ok(())
    }
}

/// Read-back accessor for a finalized [`DirectoryStore`] container.
pub struct StoreReader {
    root: PathBuf,
    metadata: StoreMetadata,
}

impl StoreReader {
    /// Open a finalized store. A destination that is absent or still
    /// staging fails with [`StoreError::NotFinalized`].
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(StoreError::NotFinalized { path: root });
        }
        let metadata_path = root.join(METADATA_FILE);
        if !metadata_path.is_file() {
            return Err(StoreError::NotFinalized { path: root });
        }
        let metadata: StoreMetadata =
            serde_json::from_reader(File::open(metadata_path)?).map_err(|e| {
                StoreError::Corrupt {
                    path: root.clone(),
                    reason: format!("unreadable metadata: {}", e),
                }
            })?;
        Ok(Self { root, metadata })
    }

    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Raw bytes of one chunk.
    pub fn read_chunk(&self, path: &str) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        File::open(self.root.join(path))?.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Interleaved lon/lat/alt triples of one location chunk.
    pub fn read_location_chunk(&self, chunk: usize) -> Result<Vec<[f64; 3]>> {
        let bytes = self.read_chunk(&format!("location/{}", chunk))?;
        let values = self.decode_f64(&bytes)?;
        if values.len() % 3 != 0 {
            return Err(self.corrupt(format!(
                "location chunk {} holds {} values, not a multiple of 3",
                chunk,
                values.len()
            )));
        }
        Ok(values.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
    }

    /// Epoch-relative second offsets of one time chunk.
    pub fn read_time_chunk(&self, chunk: usize) -> Result<Vec<i32>> {
        let bytes = self.read_chunk(&format!("time/{}", chunk))?;
        self.decode_i32(&bytes)
    }

    /// One attribute chunk, decoded per the metadata dtype.
    pub fn read_attribute_chunk(&self, name: &str, chunk: usize) -> Result<AttributeColumn> {
        let array = self.metadata.arrays.get(name).ok_or_else(|| {
            self.corrupt(format!("attribute '{}' missing from metadata", name))
        })?;
        let bytes = self.read_chunk(&format!("{}/{}", name, chunk))?;
        match array.dtype.as_str() {
            "float32" => {
                if bytes.len() % 4 != 0 {
                    return Err(self.corrupt(format!("misaligned float32 chunk '{}'", name)));
                }
                Ok(AttributeColumn::Float(
                    bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ))
            }
            "int32" => Ok(AttributeColumn::Int(self.decode_i32(&bytes)?)),
            other => Err(self.corrupt(format!("unknown dtype '{}' for '{}'", other, name))),
        }
    }

    fn decode_f64(&self, bytes: &[u8]) -> Result<Vec<f64>> {
        if bytes.len() % 8 != 0 {
            return Err(self.corrupt("misaligned float64 chunk".to_string()));
        }
        Ok(bytes
            .chunks_exact(8)
            .map(|c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            })
            .collect())
    }

    fn decode_i32(&self, bytes: &[u8]) -> Result<Vec<i32>> {
        if bytes.len() % 4 != 0 {
            return Err(self.corrupt("misaligned int32 chunk".to_string()));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::Corrupt {
            path: self.root.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_staging_invisible_until_finalize() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.store");

        let sink = DirectoryStore::create(&dest).unwrap();
        sink.create_chunk("time/0", &[0, 0, 0, 0]).unwrap();
        sink.write_attribute_metadata(&json!({"format": "point-cloud"}))
            .unwrap();

        assert!(!dest.exists());
        assert!(matches!(
            StoreReader::open(&dest),
            Err(StoreError::NotFinalized { .. })
        ));

        sink.finalize().unwrap();
        assert!(dest.join("time/0").is_file());
        assert!(dest.join("metadata.json").is_file());
        assert!(!staging_path(&dest).exists());
    }

    #[test]
    fn test_finalize_is_exactly_once() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.store");
        let sink = DirectoryStore::create(&dest).unwrap();
        sink.write_attribute_metadata(&json!({})).unwrap();
        sink.finalize().unwrap();
        assert!(matches!(
            sink.finalize(),
            Err(StoreError::AlreadyFinalized { .. })
        ));
    }

    #[test]
    fn test_discard_removes_staging() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.store");
        let sink = DirectoryStore::create(&dest).unwrap();
        sink.create_chunk("location/0", &[0; 24]).unwrap();

        sink.discard().unwrap();
        assert!(!staging_path(&dest).exists());
        assert!(!dest.exists());
    }

    #[test]
    fn test_finalize_replaces_previous_container() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.store");

        let first = DirectoryStore::create(&dest).unwrap();
        first.create_chunk("time/0", &[1, 0, 0, 0]).unwrap();
        first.write_attribute_metadata(&json!({"run": 1})).unwrap();
        first.finalize().unwrap();

        let second = DirectoryStore::create(&dest).unwrap();
        second.create_chunk("time/0", &[2, 0, 0, 0]).unwrap();
        second.write_attribute_metadata(&json!({"run": 2})).unwrap();
        second.finalize().unwrap();

        let raw = fs::read(dest.join("time/0")).unwrap();
        assert_eq!(raw, vec![2, 0, 0, 0]);
    }

    #[test]
    fn test_stale_staging_is_cleared_on_create() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.store");
        let stale = staging_path(&dest);
        fs::create_dir_all(stale.join("time")).unwrap();
        fs::write(stale.join("time/0"), [9u8; 4]).unwrap();

        let sink = DirectoryStore::create(&dest).unwrap();
        assert!(!staging_path(&dest).join("time/0").exists());
        sink.discard().unwrap();
    }
}
