//! Time-tagged visualization packet writers.
//!
//! Visualization strategies read a *finalized* array store, never the
//! granule directly (the store path decouples packet generation from
//! converter internals), and emit a temporally ordered packet stream for a
//! 4D-globe client. Each packet tags a time interval and one renderable
//! primitive. Output order is the contract: packets are emitted in store
//! order, and a regression in interval starts is an error rather than a
//! silent re-sort.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::ser::SerializeSeq;
use serde::Serialize;
use thiserror::Error;

use crate::config::{PacketMode, VizConfig};
use crate::core::timeutils::iso8601;
use crate::store::{StoreError, StoreMetadata, StoreReader};

/// Errors that can occur during visualization writing.
#[derive(Debug, Error)]
pub enum VizError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no visualization strategy accepts store format '{format}'")]
    UnsupportedPayload { format: String },

    #[error("array store '{path}' was never finalized")]
    IncompleteSource { path: PathBuf },

    #[error("packet {index} starts at {start}, before the previous packet at {prev}")]
    NonMonotonicTime {
        index: usize,
        start: String,
        prev: String,
    },

    #[error("visualization sink '{path}' is already finalized")]
    AlreadyFinalized { path: PathBuf },

    #[error("array store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for VizError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFinalized { path } => VizError::IncompleteSource { path },
            other => VizError::Store(other),
        }
    }
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VizError>;

/// Closed time interval in unix seconds, serialized as a two-element array
/// of RFC 3339 strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    pub start: i64,
    pub end: i64,
}

impl Serialize for TimeInterval {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&iso8601(self.start))?;
        seq.serialize_element(&iso8601(self.end))?;
        seq.end()
    }
}

/// Geodetic position of a renderable primitive.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
    pub alt: f64,
}

/// Styling applied to a primitive.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Style {
    pub rgba: [u8; 4],
    #[serde(rename = "pixelSize")]
    pub pixel_size: u32,
}

/// Renderable primitive carried by one packet.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Primitive {
    /// A single styled point.
    Point { position: Position, style: Style },
    /// A path of epoch-relative samples, flattened as
    /// `[dt, lon, lat, alt, dt, lon, lat, alt, ...]`.
    Path {
        epoch: String,
        samples: Vec<f64>,
        style: Style,
    },
}

/// One time-tagged visualization packet.
#[derive(Debug, Clone, Serialize)]
pub struct VizPacket {
    pub id: String,
    #[serde(rename = "timeInterval")]
    pub time_interval: TimeInterval,
    pub primitive: Primitive,
}

/// Handle returned from a successful visualization write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VizSummary {
    pub packet_count: usize,
    pub start: i64,
    pub end: i64,
}

/// Append-only packet sink.
pub trait VizSink {
    fn append_packet(&mut self, packet: &VizPacket) -> Result<()>;

    /// Seal the container, making the packet stream durable.
    fn finalize(&mut self) -> Result<()>;

    /// Roll back a failed write, leaving the destination untouched.
    fn discard(&mut self) -> Result<()> {
        Ok(())
    }
}

/// JSON-array file sink. Packets stream into `<dest>.partial`; the file is
/// renamed onto the destination at finalize, so failed runs leave the
/// destination in its pre-run state.
pub struct JsonVizSink {
    dest: PathBuf,
    staging: PathBuf,
    writer: Option<BufWriter<File>>,
    count: usize,
}

impl JsonVizSink {
    pub fn create<P: AsRef<Path>>(dest: P) -> Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        let mut name = dest
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".partial");
        let staging = dest.with_file_name(name);
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let writer = BufWriter::new(File::create(&staging)?);
        Ok(Self {
            dest,
            staging,
            writer: Some(writer),
            count: 0,
        })
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| VizError::AlreadyFinalized {
                path: self.dest.clone(),
            })
    }
}

impl VizSink for JsonVizSink {
    fn append_packet(&mut self, packet: &VizPacket) -> Result<()> {
        let count = self.count;
        let writer = self.writer()?;
        if count == 0 {
            writer.write_all(b"[\n")?;
        } else {
            writer.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut *writer, packet)?;
        self.count += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let count = self.count;
        {
            let writer = self.writer()?;
            if count == 0 {
                writer.write_all(b"[")?;
            }
            writer.write_all(b"\n]\n")?;
            writer.flush()?;
        }
        self.writer = None;
        fs::rename(&self.staging, &self.dest)?;
        debug!("finalized {} packets at {}", self.count, self.dest.display());
        Ok(())
    }

    fn discard(&mut self) -> Result<()> {
        self.writer = None;
        if self.staging.exists() {
            fs::remove_file(&self.staging)?;
        }
        Ok(())
    }
}

/// Strategy interface for one store format.
pub trait VizStrategy: Send + Sync {
    fn accepts(&self, metadata: &StoreMetadata) -> bool;

    fn write(
        &self,
        reader: &StoreReader,
        sink: &mut dyn VizSink,
        config: &VizConfig,
    ) -> Result<VizSummary>;
}

/// Packet strategy for point-cloud stores.
///
/// `points` mode emits one packet per point with a zero-length interval at
/// the point's timestamp; `path` mode emits a single packet spanning the
/// granule's time coverage with epoch-relative position samples. When a
/// style attribute is configured and present in the store, packet alpha is
/// ramped over the attribute's value range.
#[derive(Debug, Default)]
pub struct PointCloudVizStrategy;

impl PointCloudVizStrategy {
    /// Min/max of the styling attribute across all chunks, when configured.
    fn attribute_range(
        reader: &StoreReader,
        config: &VizConfig,
    ) -> Result<Option<(String, f64, f64)>> {
        let Some(name) = config.style_attribute.as_ref() else {
            return Ok(None);
        };
        if !reader.metadata().arrays.contains_key(name) {
            return Ok(None);
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for chunk in 0..reader.metadata().num_chunks {
            let column = reader.read_attribute_chunk(name, chunk)?;
            for i in 0..column.len() {
                let v = column.value_as_f64(i);
                min = min.min(v);
                max = max.max(v);
            }
        }
        if min.is_finite() && max.is_finite() {
            Ok(Some((name.clone(), min, max)))
        } else {
            Ok(None)
        }
    }

    fn styled(config: &VizConfig, ramp: Option<(f64, f64)>, value: Option<f64>) -> Style {
        let mut rgba = config.rgba;
        if let (Some((min, max)), Some(v)) = (ramp, value) {
            if max > min {
                let t = ((v - min) / (max - min)).clamp(0.0, 1.0);
                rgba[3] = (64.0 + t * 191.0) as u8;
            }
        }
        Style {
            rgba,
            pixel_size: config.pixel_size,
        }
    }

    fn check_order(prev: &mut Option<i64>, start: i64, index: usize) -> Result<()> {
        if let Some(p) = *prev {
            if start < p {
                return Err(VizError::NonMonotonicTime {
                    index,
                    start: iso8601(start),
                    prev: iso8601(p),
                });
            }
        }
        *prev = Some(start);
        Ok(())
    }

    fn write_points(
        reader: &StoreReader,
        sink: &mut dyn VizSink,
        config: &VizConfig,
    ) -> Result<VizSummary> {
        let meta = reader.metadata();
        let ramp = Self::attribute_range(reader, config)?;

        let mut prev: Option<i64> = None;
        let mut emitted = 0usize;
        let (mut first, mut last) = (0i64, 0i64);

        for chunk in 0..meta.num_chunks {
            let locations = reader.read_location_chunk(chunk)?;
            let times = reader.read_time_chunk(chunk)?;
            let styles = match &ramp {
                Some((name, _, _)) => Some(reader.read_attribute_chunk(name, chunk)?),
                None => None,
            };

            for (i, (loc, dt)) in locations.iter().zip(times.iter()).enumerate() {
                let t = meta.epoch + i64::from(*dt);
                Self::check_order(&mut prev, t, emitted)?;

                let value = styles.as_ref().map(|c| c.value_as_f64(i));
                let packet = VizPacket {
                    id: format!("point-{:06}", emitted),
                    time_interval: TimeInterval { start: t, end: t },
                    primitive: Primitive::Point {
                        position: Position {
                            lon: loc[0],
                            lat: loc[1],
                            alt: loc[2],
                        },
                        style: Self::styled(config, ramp.as_ref().map(|r| (r.1, r.2)), value),
                    },
                };
                sink.append_packet(&packet)?;

                if emitted == 0 {
                    first = t;
                }
                last = t;
                emitted += 1;
            }
        }

        Ok(VizSummary {
            packet_count: emitted,
            start: first,
            end: last,
        })
    }

    fn write_path(
        reader: &StoreReader,
        sink: &mut dyn VizSink,
        config: &VizConfig,
    ) -> Result<VizSummary> {
        let meta = reader.metadata();
        let stride = config.path_stride.max(1);

        let mut samples = Vec::new();
        let mut prev: Option<i64> = None;
        let (mut first, mut last) = (meta.epoch, meta.epoch);
        let mut seen = 0usize;

        for chunk in 0..meta.num_chunks {
            let locations = reader.read_location_chunk(chunk)?;
            let times = reader.read_time_chunk(chunk)?;
            for (loc, dt) in locations.iter().zip(times.iter()) {
                let t = meta.epoch + i64::from(*dt);
                Self::check_order(&mut prev, t, seen)?;
                if seen == 0 {
                    first = t;
                }
                last = t;
                if seen % stride == 0 {
                    samples.extend_from_slice(&[f64::from(*dt), loc[0], loc[1], loc[2]]);
                }
                seen += 1;
            }
        }

        let packet = VizPacket {
            id: "granule-path".to_string(),
            time_interval: TimeInterval {
                start: first,
                end: last,
            },
            primitive: Primitive::Path {
                epoch: iso8601(meta.epoch),
                samples,
                style: Self::styled(config, None, None),
            },
        };
        sink.append_packet(&packet)?;

        Ok(VizSummary {
            packet_count: 1,
            start: first,
            end: last,
        })
    }
}

impl VizStrategy for PointCloudVizStrategy {
    fn accepts(&self, metadata: &StoreMetadata) -> bool {
        metadata.format == "point-cloud"
    }

    fn write(
        &self,
        reader: &StoreReader,
        sink: &mut dyn VizSink,
        config: &VizConfig,
    ) -> Result<VizSummary> {
        match config.mode {
            PacketMode::Points => Self::write_points(reader, sink, config),
            PacketMode::Path => Self::write_path(reader, sink, config),
        }
    }
}

/// Dispatches finalized stores to visualization strategies and owns the
/// sink finalize/discard decision.
pub struct VizWriter {
    strategies: Vec<Box<dyn VizStrategy>>,
    config: VizConfig,
}

impl VizWriter {
    /// Writer with the production strategy set.
    pub fn new(config: VizConfig) -> Self {
        Self::with_strategies(vec![Box::new(PointCloudVizStrategy)], config)
    }

    pub fn with_strategies(strategies: Vec<Box<dyn VizStrategy>>, config: VizConfig) -> Self {
        Self { strategies, config }
    }

    /// Select the strategy for a finalized store.
    pub fn select_strategy(&self, metadata: &StoreMetadata) -> Result<&dyn VizStrategy> {
        self.strategies
            .iter()
            .find(|s| s.accepts(metadata))
            .map(Box::as_ref)
            .ok_or_else(|| VizError::UnsupportedPayload {
                format: metadata.format.clone(),
            })
    }

    /// Read the finalized store at `store_path` and write the packet
    /// stream. Opening a store that was never finalized fails with
    /// [`VizError::IncompleteSource`]; the sink is finalized on success and
    /// discarded on any failure.
    pub fn write(&self, store_path: &Path, sink: &mut dyn VizSink) -> Result<VizSummary> {
        match self.write_inner(store_path, sink) {
            Ok(summary) => {
                sink.finalize()?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(discard_err) = sink.discard() {
                    log::warn!("failed to discard partial packet stream: {}", discard_err);
                }
                Err(err)
            }
        }
    }

    fn write_inner(&self, store_path: &Path, sink: &mut dyn VizSink) -> Result<VizSummary> {
        let reader = StoreReader::open(store_path)?;
        let strategy = self.select_strategy(reader.metadata())?;
        strategy.write(&reader, sink, &self.config)
    }
}
