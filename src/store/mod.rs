//! Chunked array-store writer strategies.
//!
//! The array store is a hierarchical, chunk-oriented container for
//! analysis-ready data. Strategies are selected on the granule's payload
//! variant alone and drive an opaque [`ArrayStoreSink`]: contiguous point
//! ranges become fixed-size chunks, the attribute schema becomes sidecar
//! metadata, and `finalize` seals the store. A failed chunk write aborts
//! the whole store write; the sink is discarded so no partial container is
//! ever visible to readers.
//!
//! Layout written by the point-cloud strategy:
//!
//! ```text
//! <dest>/
//!   metadata.json          # format, epoch, chunking, schema, provenance
//!   location/0 .. k-1      # interleaved lon,lat,alt as little-endian f64
//!   time/0 .. k-1          # seconds since epoch as little-endian i32
//!   <attribute>/0 .. k-1   # one series per attribute (f32 or i32)
//! ```

pub mod dir;

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::granule::{
    AttributeColumn, Granule, Payload, PointCloud, GEODETIC_FRAME,
};
use crate::core::timeutils::iso8601;

pub use dir::{DirectoryStore, StoreReader};

/// Default number of points per chunk, bounding the in-memory working set.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Errors that can occur while writing or reading an array store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no array-store strategy accepts payload '{payload}'")]
    UnsupportedPayload { payload: String },

    #[error("store '{path}' was never finalized")]
    NotFinalized { path: PathBuf },

    #[error("store '{path}' is already finalized")]
    AlreadyFinalized { path: PathBuf },

    #[error("corrupt store '{path}': {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("time delta {delta}s from epoch does not fit the time array")]
    UnrepresentableTime { delta: i64 },

    #[error("attribute name '{name}' collides with a reserved array name")]
    ReservedAttribute { name: String },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Opaque chunk-oriented sink for one array-store container.
///
/// Implementations stage writes so that nothing becomes visible to readers
/// until [`finalize`](ArrayStoreSink::finalize) succeeds. Chunk writes for
/// disjoint paths may arrive concurrently from worker threads.
pub trait ArrayStoreSink: Send + Sync {
    /// Write one chunk at a hierarchical path such as `location/0`.
    fn create_chunk(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Write the sidecar metadata document (attribute schema included).
    fn write_attribute_metadata(&self, metadata: &serde_json::Value) -> Result<()>;

    /// Seal the store, making its contents durable and queryable. Must be
    /// invoked exactly once, after every chunk write has succeeded.
    fn finalize(&self) -> Result<()>;

    /// Roll back: leave the destination absent or in its pre-run state.
    fn discard(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-array entry in the store metadata document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArrayMeta {
    pub dtype: String,
    /// Values per point (3 for interleaved location triples, else 1).
    pub width: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Sidecar metadata describing one finalized store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub format: String,
    pub frame: String,
    pub point_count: usize,
    pub chunk_size: usize,
    pub num_chunks: usize,
    /// Unix-seconds epoch that the time array is relative to.
    pub epoch: i64,
    pub epoch_iso: String,
    pub arrays: BTreeMap<String, ArrayMeta>,
    pub provenance: BTreeMap<String, String>,
}

/// Handle returned from a successful store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    pub point_count: usize,
    pub chunk_count: usize,
    pub chunk_size: usize,
    pub epoch: i64,
}

/// Strategy interface for serializing one payload variant into a store.
pub trait StoreStrategy: Send + Sync + std::fmt::Debug {
    /// Whether this strategy can serialize the payload variant.
    fn accepts(&self, payload: &Payload) -> bool;

    /// Write every chunk and the sidecar metadata. Does not finalize; the
    /// [`ArrayStoreWriter`] owns the finalize/discard decision.
    fn write(
        &self,
        granule: &Granule,
        sink: &dyn ArrayStoreSink,
        chunk_size: usize,
    ) -> Result<StoreSummary>;
}

/// Strategy for point-cloud payloads.
///
/// Chunks are contiguous ranges of the ordered point sequence, preserving
/// the source's temporal locality. Chunk ranges are pre-assigned and
/// written in parallel; any failure aborts the write.
#[derive(Debug, Default)]
pub struct PointCloudStoreStrategy;

impl PointCloudStoreStrategy {
    fn metadata(cloud: &PointCloud, granule: &Granule, chunk_size: usize, epoch: i64) -> StoreMetadata {
        let num_chunks = cloud.len().div_ceil(chunk_size);

        let mut arrays = BTreeMap::new();
        arrays.insert(
            "location".to_string(),
            ArrayMeta {
                dtype: "float64".to_string(),
                width: 3,
                units: Some("degrees,degrees,meters".to_string()),
            },
        );
        arrays.insert(
            "time".to_string(),
            ArrayMeta {
                dtype: "int32".to_string(),
                width: 1,
                units: Some(format!("seconds since {}", iso8601(epoch))),
            },
        );
        for (name, spec) in cloud.schema.iter() {
            let dtype = match spec.dtype {
                crate::core::granule::AttributeType::Float => "float32",
                crate::core::granule::AttributeType::Int => "int32",
            };
            arrays.insert(
                name.to_string(),
                ArrayMeta {
                    dtype: dtype.to_string(),
                    width: 1,
                    units: spec.units.clone(),
                },
            );
        }

        let provenance = granule
            .provenance()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        StoreMetadata {
            format: granule.payload().kind().to_string(),
            frame: GEODETIC_FRAME.to_string(),
            point_count: cloud.len(),
            chunk_size,
            num_chunks,
            epoch,
            epoch_iso: iso8601(epoch),
            arrays,
            provenance,
        }
    }

    fn write_range(
        cloud: &PointCloud,
        sink: &dyn ArrayStoreSink,
        epoch: i64,
        chunk_idx: usize,
        start: usize,
        end: usize,
    ) -> Result<()> {
        let mut location = Vec::with_capacity((end - start) * 3 * 8);
        for i in start..end {
            location.extend_from_slice(&cloud.lon[i].to_le_bytes());
            location.extend_from_slice(&cloud.lat[i].to_le_bytes());
            location.extend_from_slice(&cloud.alt[i].to_le_bytes());
        }
        sink.create_chunk(&format!("location/{}", chunk_idx), &location)?;

        let mut time = Vec::with_capacity((end - start) * 4);
        for i in start..end {
            let delta = cloud.time[i] - epoch;
            let delta = i32::try_from(delta)
                .map_err(|_| StoreError::UnrepresentableTime { delta })?;
            time.extend_from_slice(&delta.to_le_bytes());
        }
        sink.create_chunk(&format!("time/{}", chunk_idx), &time)?;

        for (name, column) in &cloud.attributes {
            let bytes = match column {
                AttributeColumn::Float(v) => encode_f32(&v[start..end]),
                AttributeColumn::Int(v) => encode_i32(&v[start..end]),
            };
            sink.create_chunk(&format!("{}/{}", name, chunk_idx), &bytes)?;
        }

        Ok(())
    }
}

impl StoreStrategy for PointCloudStoreStrategy {
    fn accepts(&self, payload: &Payload) -> bool {
        matches!(payload, Payload::PointCloud(_))
    }

    fn write(
        &self,
        granule: &Granule,
        sink: &dyn ArrayStoreSink,
        chunk_size: usize,
    ) -> Result<StoreSummary> {
        let Payload::PointCloud(cloud) = granule.payload();
        let n = cloud.len();
        let (epoch, _) = cloud.time_range().expect("granule payloads are non-empty");

        for (name, _) in cloud.schema.iter() {
            if name == "location" || name == "time" {
                return Err(StoreError::ReservedAttribute {
                    name: name.to_string(),
                });
            }
        }

        let metadata = Self::metadata(cloud, granule, chunk_size, epoch);
        sink.write_attribute_metadata(&serde_json::to_value(&metadata)?)?;

        // Pre-assigned disjoint chunk ranges, written in parallel. Any
        // failure short-circuits and aborts the whole write.
        let ranges: Vec<(usize, usize, usize)> = (0..n)
            .step_by(chunk_size)
            .enumerate()
            .map(|(idx, start)| (idx, start, (start + chunk_size).min(n)))
            .collect();

        ranges
            .par_iter()
            .try_for_each(|&(chunk_idx, start, end)| {
                Self::write_range(cloud, sink, epoch, chunk_idx, start, end)
            })?;

        debug!(
            "wrote {} points in {} chunks (chunk_size {})",
            n,
            ranges.len(),
            chunk_size
        );

        Ok(StoreSummary {
            point_count: n,
            chunk_count: ranges.len(),
            chunk_size,
            epoch,
        })
    }
}

/// Dispatches granules to array-store strategies and owns the
/// finalize/discard decision.
pub struct ArrayStoreWriter {
    strategies: Vec<Box<dyn StoreStrategy>>,
    chunk_size: usize,
}

impl ArrayStoreWriter {
    /// Writer with the production strategy set.
    pub fn new(chunk_size: usize) -> Self {
        Self::with_strategies(vec![Box::new(PointCloudStoreStrategy)], chunk_size)
    }

    pub fn with_strategies(strategies: Vec<Box<dyn StoreStrategy>>, chunk_size: usize) -> Self {
        Self {
            strategies,
            chunk_size,
        }
    }

    /// Select the strategy for the granule's payload variant.
    pub fn select_strategy(&self, granule: &Granule) -> Result<&dyn StoreStrategy> {
        self.strategies
            .iter()
            .find(|s| s.accepts(granule.payload()))
            .map(Box::as_ref)
            .ok_or_else(|| StoreError::UnsupportedPayload {
                payload: granule.payload().kind().to_string(),
            })
    }

    /// Write the granule into the sink and seal it.
    ///
    /// On success the sink is finalized exactly once. On any failure the
    /// sink is discarded instead, leaving the destination absent or in its
    /// pre-run state.
    pub fn write(&self, granule: &Granule, sink: &dyn ArrayStoreSink) -> Result<StoreSummary> {
        let strategy = self.select_strategy(granule)?;
        match strategy.write(granule, sink, self.chunk_size) {
            Ok(summary) => {
                sink.finalize()?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(discard_err) = sink.discard() {
                    warn!("failed to discard partial store: {}", discard_err);
                }
                Err(err)
            }
        }
    }
}

pub(crate) fn encode_f32(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub(crate) fn encode_i32(values: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::granule::{
        AttributeColumn, AttributeSpec, Payload, PointCloud, Provenance,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn test_granule(points: usize) -> Granule {
        let mut cloud = PointCloud::with_capacity(points);
        for i in 0..points {
            cloud.push(
                i as f64 * 0.001,
                45.0 + i as f64 * 0.001,
                1000.0 + i as f64,
                1_494_979_200 + i as i64,
            );
        }
        cloud
            .schema
            .declare("ref", AttributeSpec::float(Some("dBZ")))
            .unwrap();
        cloud.attributes.insert(
            "ref".to_string(),
            AttributeColumn::Float((0..points).map(|i| i as f32 * 0.5).collect()),
        );
        Granule::new(Payload::PointCloud(cloud), "point-csv", Provenance::new()).unwrap()
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("granule.store");
        let granule = test_granule(25);

        let writer = ArrayStoreWriter::new(10);
        let sink = DirectoryStore::create(&dest).unwrap();
        let summary = writer.write(&granule, &sink).unwrap();

        assert_eq!(summary.point_count, 25);
        assert_eq!(summary.chunk_count, 3);
        assert_eq!(summary.epoch, 1_494_979_200);

        let reader = StoreReader::open(&dest).unwrap();
        let meta = reader.metadata();
        assert_eq!(meta.point_count, 25);
        assert_eq!(meta.num_chunks, 3);
        assert_eq!(meta.arrays["ref"].dtype, "float32");
        assert_eq!(meta.arrays["location"].width, 3);

        // Full-cloud read-back: coordinates, times, attribute values.
        let cloud = granule.point_cloud().unwrap();
        let mut seen = 0usize;
        for chunk in 0..meta.num_chunks {
            let locations = reader.read_location_chunk(chunk).unwrap();
            let times = reader.read_time_chunk(chunk).unwrap();
            assert_eq!(locations.len(), times.len());
            for (i, (loc, dt)) in locations.iter().zip(times.iter()).enumerate() {
                let idx = seen + i;
                assert!((loc[0] - cloud.lon[idx]).abs() < 1e-12);
                assert!((loc[1] - cloud.lat[idx]).abs() < 1e-12);
                assert!((loc[2] - cloud.alt[idx]).abs() < 1e-12);
                assert_eq!(meta.epoch + i64::from(*dt), cloud.time[idx]);
            }
            seen += locations.len();
        }
        assert_eq!(seen, 25);
    }

    /// Sink that fails on the nth chunk write, for atomicity tests.
    struct FailingSink {
        inner: DirectoryStore,
        fail_at: usize,
        writes: AtomicUsize,
    }

    impl ArrayStoreSink for FailingSink {
        fn create_chunk(&self, path: &str, bytes: &[u8]) -> Result<()> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if n == self.fail_at {
                return Err(StoreError::Io(std::io::Error::other("injected failure")));
            }
            self.inner.create_chunk(path, bytes)
        }

        fn write_attribute_metadata(&self, metadata: &serde_json::Value) -> Result<()> {
            self.inner.write_attribute_metadata(metadata)
        }

        fn finalize(&self) -> Result<()> {
            panic!("finalize must not be called after a failed chunk write");
        }

        fn discard(&self) -> Result<()> {
            self.inner.discard()
        }
    }

    #[test]
    fn test_chunk_failure_leaves_no_partial_store() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("granule.store");
        let granule = test_granule(25);

        let sink = FailingSink {
            inner: DirectoryStore::create(&dest).unwrap(),
            fail_at: 4,
            writes: AtomicUsize::new(0),
        };

        let writer = ArrayStoreWriter::new(10);
        let err = writer.write(&granule, &sink).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        // Destination is absent and a fresh read sees no partial chunks.
        assert!(!dest.exists());
        assert!(matches!(
            StoreReader::open(&dest),
            Err(StoreError::NotFinalized { .. })
        ));
    }

    #[test]
    fn test_unsupported_payload() {
        let writer = ArrayStoreWriter::with_strategies(Vec::new(), DEFAULT_CHUNK_SIZE);
        let err = writer.select_strategy(&test_granule(1)).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedPayload { .. }));
    }

    #[test]
    fn test_single_chunk_store() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("small.store");
        let granule = test_granule(3);

        let writer = ArrayStoreWriter::new(DEFAULT_CHUNK_SIZE);
        let sink = DirectoryStore::create(&dest).unwrap();
        let summary = writer.write(&granule, &sink).unwrap();
        assert_eq!(summary.chunk_count, 1);

        let reader = StoreReader::open(&dest).unwrap();
        assert_eq!(reader.read_time_chunk(0).unwrap(), vec![0, 1, 2]);
    }
}
