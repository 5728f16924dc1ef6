//! Converter strategies for raw campaign sources.
//!
//! Each converter reads one raw source file, validates its structure, and
//! normalizes it into a [`Granule`] holding a point-cloud payload in the
//! geodetic frame. Conversion is a pure read-and-transform step: no
//! converter writes to any sink.
//!
//! Production formats:
//! - `point-csv`: geodetic point CSV with lon/lat/alt/time columns plus
//!   arbitrary numeric attribute columns
//! - `sweep-csv`: rotating-sensor polar sweep CSV
//!   (`Status,Scale,Range,Gain,Angle,Echo_0..Echo_N`)
//! - `ply`: ASCII PLY with x/y/z vertex properties in local east/north/up
//!   meters and a per-point time property

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use thiserror::Error;

use crate::config::{SiteConfig, SweepConfig};
use crate::core::granule::{
    AttributeColumn, AttributeSchema, AttributeSpec, AttributeType, Granule, GranuleError,
    Payload, PointCloud, Provenance, GEODETIC_FRAME, PROV_FRAME, PROV_INSTRUMENT,
    PROV_SOURCE_PATH, PROV_TIME_COVERAGE_END, PROV_TIME_COVERAGE_START,
};
use crate::core::timeutils::{self, iso8601};

/// Approximate meters per degree of latitude, used to project local
/// east/north offsets onto the geodetic frame around a site origin.
const METERS_PER_DEGREE: f64 = 111_000.0;

/// Errors that can occur during format detection and conversion.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("no registered converter matches '{detail}'")]
    UnknownFormat { detail: String },

    #[error("format '{format}' is already registered")]
    DuplicateFormat { format: String },

    #[error("malformed source '{path}': {reason}")]
    MalformedSource { path: PathBuf, reason: String },

    #[error("unsupported {format} schema in '{path}': {reason}")]
    UnsupportedSchema {
        format: String,
        path: PathBuf,
        reason: String,
    },

    #[error("invalid granule from '{path}': {source}")]
    InvalidGranule {
        path: PathBuf,
        #[source]
        source: GranuleError,
    },
}

impl ConvertError {
    pub(crate) fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        ConvertError::MalformedSource {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(format: &str, path: &Path, reason: impl Into<String>) -> Self {
        ConvertError::UnsupportedSchema {
            format: format.to_string(),
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Result type for conversion operations.
pub type Result<T> = std::result::Result<T, ConvertError>;

/// A raw input file plus an optional explicit format hint.
///
/// When the hint is absent the registry detects the format from the file
/// extension, magic bytes, or embedded header metadata, in that order.
#[derive(Debug, Clone)]
pub struct RawSource {
    path: PathBuf,
    format_hint: Option<String>,
}

impl RawSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format_hint: None,
        }
    }

    pub fn with_hint<P: AsRef<Path>>(path: P, hint: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format_hint: Some(hint.to_string()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format_hint(&self) -> Option<&str> {
        self.format_hint.as_deref()
    }

    /// Lowercased file extension, if any.
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    /// File name component, used for date hints.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Read up to `n` leading bytes for magic-number checks.
    pub fn read_prefix(&self, n: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = file.read(&mut buf[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn open(&self) -> std::io::Result<BufReader<File>> {
        Ok(BufReader::new(File::open(&self.path)?))
    }
}

/// Strategy interface: one raw source format in, one granule out.
pub trait Converter: Send + Sync + std::fmt::Debug {
    /// Stable identifier used for registry dispatch.
    fn format_id(&self) -> &'static str;

    /// File extensions this format claims (lowercase, without the dot).
    fn extensions(&self) -> &'static [&'static str];

    /// Leading magic bytes, for formats that have them.
    fn magic(&self) -> Option<&'static [u8]> {
        None
    }

    /// Content probe inspecting embedded metadata (e.g. a CSV header row).
    /// Must be cheap and side-effect free.
    fn sniff(&self, _source: &RawSource) -> Result<bool> {
        Ok(false)
    }

    /// Validate and convert the raw source into a granule.
    fn convert(&self, source: &RawSource) -> Result<Granule>;
}

fn build_granule(
    format_id: &str,
    source: &RawSource,
    cloud: PointCloud,
    instrument: Option<&str>,
) -> Result<Granule> {
    let mut provenance = Provenance::new();
    provenance.set(PROV_SOURCE_PATH, source.path().display().to_string());
    provenance.set(PROV_FRAME, GEODETIC_FRAME);
    if let Some(instrument) = instrument {
        provenance.set(PROV_INSTRUMENT, instrument);
    }
    if let Some((start, end)) = cloud.time_range() {
        provenance.set(PROV_TIME_COVERAGE_START, iso8601(start));
        provenance.set(PROV_TIME_COVERAGE_END, iso8601(end));
    }
    Granule::new(Payload::PointCloud(cloud), format_id, provenance).map_err(|source_err| {
        ConvertError::InvalidGranule {
            path: source.path().to_path_buf(),
            source: source_err,
        }
    })
}

/// Project a local east/north/up offset in meters onto geodetic coordinates
/// around the site origin. Sufficient for site-scale offsets; the longitude
/// scale uses the origin latitude.
fn enu_to_geodetic(site: &SiteConfig, east: f64, north: f64, up: f64) -> (f64, f64, f64) {
    let lat = site.origin_lat + north / METERS_PER_DEGREE;
    let lon =
        site.origin_lon + east / (METERS_PER_DEGREE * site.origin_lat.to_radians().cos());
    (lon, lat, site.origin_alt + up)
}

// ---------------------------------------------------------------------------
// point-csv
// ---------------------------------------------------------------------------

/// Converter for geodetic point CSVs.
///
/// Expects a header row naming lon/lat (or longitude/latitude), alt (or
/// altitude/height), and time (or t) columns. Every other numeric column
/// becomes a typed attribute: all-integer columns are stored as Int,
/// anything else as Float.
#[derive(Debug, Default)]
pub struct GeodeticCsvConverter;

impl GeodeticCsvConverter {
    pub const FORMAT_ID: &'static str = "point-csv";

    fn find_column(headers: &[String], names: &[&str]) -> Option<usize> {
        headers
            .iter()
            .position(|h| names.contains(&h.to_lowercase().as_str()))
    }
}

impl Converter for GeodeticCsvConverter {
    fn format_id(&self) -> &'static str {
        Self::FORMAT_ID
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["csv"]
    }

    fn sniff(&self, source: &RawSource) -> Result<bool> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_reader(source.open()?);
        let headers = match reader.headers() {
            Ok(h) => h,
            Err(_) => return Ok(false),
        };
        let lower: Vec<String> = headers.iter().map(|h| h.to_lowercase()).collect();
        let has_lon = lower.iter().any(|h| h == "lon" || h == "longitude");
        let has_lat = lower.iter().any(|h| h == "lat" || h == "latitude");
        let has_time = lower.iter().any(|h| h == "time" || h == "t");
        Ok(has_lon && has_lat && has_time)
    }

    fn convert(&self, source: &RawSource) -> Result<Granule> {
        let path = source.path();
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(source.open()?);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| ConvertError::malformed(path, format!("unreadable header row: {}", e)))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if headers.is_empty() {
            return Err(ConvertError::malformed(path, "missing header row"));
        }

        let lon_idx = Self::find_column(&headers, &["lon", "longitude"]).ok_or_else(|| {
            ConvertError::unsupported(Self::FORMAT_ID, path, "no longitude column")
        })?;
        let lat_idx = Self::find_column(&headers, &["lat", "latitude"]).ok_or_else(|| {
            ConvertError::unsupported(Self::FORMAT_ID, path, "no latitude column")
        })?;
        let alt_idx =
            Self::find_column(&headers, &["alt", "altitude", "height"]).ok_or_else(|| {
                ConvertError::unsupported(Self::FORMAT_ID, path, "no altitude column")
            })?;
        let time_idx = Self::find_column(&headers, &["time", "t"]).ok_or_else(|| {
            ConvertError::unsupported(Self::FORMAT_ID, path, "no time column")
        })?;

        // Remaining columns are candidate attributes, keyed by position so
        // duplicate names can be reconciled after parsing.
        let coordinate_cols = [lon_idx, lat_idx, alt_idx, time_idx];
        let attr_cols: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| !coordinate_cols.contains(i))
            .map(|(i, name)| (i, name.to_lowercase()))
            .collect();

        let mut lon = Vec::new();
        let mut lat = Vec::new();
        let mut alt = Vec::new();
        let mut raw_time = Vec::new();
        // Per attribute column: raw values plus whether every cell parsed as
        // an integer (decides Int vs Float once the file is read).
        let mut attr_values: Vec<Vec<f64>> = vec![Vec::new(); attr_cols.len()];
        let mut attr_integral: Vec<bool> = vec![true; attr_cols.len()];

        for (row_idx, record) in reader.records().enumerate() {
            let record = record?;
            let cell = |idx: usize, what: &str| -> Result<f64> {
                let raw = record.get(idx).ok_or_else(|| {
                    ConvertError::malformed(
                        path,
                        format!("row {}: missing {} value", row_idx + 1, what),
                    )
                })?;
                raw.trim().parse().map_err(|_| {
                    ConvertError::malformed(
                        path,
                        format!("row {}: invalid {} value '{}'", row_idx + 1, what, raw),
                    )
                })
            };

            lon.push(cell(lon_idx, "longitude")?);
            lat.push(cell(lat_idx, "latitude")?);
            alt.push(cell(alt_idx, "altitude")?);
            raw_time.push(cell(time_idx, "time")?);

            for (slot, (col_idx, name)) in attr_cols.iter().enumerate() {
                let raw = record.get(*col_idx).unwrap_or("").trim();
                if raw.parse::<i64>().is_err() {
                    attr_integral[slot] = false;
                }
                let value: f64 = raw.parse().map_err(|_| {
                    ConvertError::malformed(
                        path,
                        format!("row {}: invalid '{}' value '{}'", row_idx + 1, name, raw),
                    )
                })?;
                attr_values[slot].push(value);
            }
        }

        if raw_time.is_empty() {
            return Err(ConvertError::malformed(path, "no data rows"));
        }

        let hint = timeutils::date_hint(None, &source.file_name());
        let time = timeutils::normalize_timestamps(&raw_time, None, hint)
            .map_err(|e| ConvertError::unsupported(Self::FORMAT_ID, path, e.to_string()))?;

        // Fold positional columns into named attributes. Duplicate names with
        // the same dtype dedupe to the first occurrence; a dtype conflict is
        // an unsupported schema.
        let mut schema = AttributeSchema::new();
        let mut attributes: BTreeMap<String, AttributeColumn> = BTreeMap::new();
        for (slot, (_, name)) in attr_cols.iter().enumerate() {
            let column = if attr_integral[slot] {
                AttributeColumn::Int(attr_values[slot].iter().map(|&v| v as i32).collect())
            } else {
                AttributeColumn::Float(attr_values[slot].iter().map(|&v| v as f32).collect())
            };
            let spec = match column.dtype() {
                AttributeType::Int => AttributeSpec::int(None),
                AttributeType::Float => AttributeSpec::float(None),
            };
            schema.declare(name, spec).map_err(|conflict| {
                ConvertError::unsupported(Self::FORMAT_ID, path, conflict.to_string())
            })?;
            attributes.entry(name.clone()).or_insert(column);
        }

        let cloud = PointCloud {
            lon,
            lat,
            alt,
            time,
            attributes,
            schema,
        };
        build_granule(Self::FORMAT_ID, source, cloud, None)
    }
}

// ---------------------------------------------------------------------------
// sweep-csv
// ---------------------------------------------------------------------------

/// Converter for rotating-sensor sweep CSVs in polar coordinates.
///
/// Each row is one sweep line: `Status,Scale,Range,Gain,Angle,Echo_0..N`.
/// Echo bins above the intensity threshold are projected to local
/// east/north meters and then onto the geodetic frame around the site
/// origin. Timestamps are the acquisition date from the file name plus a
/// rotation-phase offset per sweep line.
#[derive(Debug)]
pub struct SweepCsvConverter {
    site: SiteConfig,
    sweep: SweepConfig,
}

impl SweepCsvConverter {
    pub const FORMAT_ID: &'static str = "sweep-csv";

    /// Fixed leading columns before the echo bins.
    const HEADER_PREFIX: [&'static str; 5] = ["status", "scale", "range", "gain", "angle"];

    pub fn new(site: SiteConfig, sweep: SweepConfig) -> Self {
        Self { site, sweep }
    }
}

impl Converter for SweepCsvConverter {
    fn format_id(&self) -> &'static str {
        Self::FORMAT_ID
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["csv"]
    }

    fn sniff(&self, source: &RawSource) -> Result<bool> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_reader(source.open()?);
        let headers = match reader.headers() {
            Ok(h) => h,
            Err(_) => return Ok(false),
        };
        let lower: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        Ok(lower.len() >= Self::HEADER_PREFIX.len()
            && lower
                .iter()
                .zip(Self::HEADER_PREFIX.iter())
                .all(|(have, want)| have == want))
    }

    fn convert(&self, source: &RawSource) -> Result<Granule> {
        let path = source.path();

        let base_time = timeutils::date_hint(None, &source.file_name())
            .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is valid"))
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(|| {
                ConvertError::unsupported(
                    Self::FORMAT_ID,
                    path,
                    "no acquisition date in file name",
                )
            })?;

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(source.open()?);

        let mut rows: Vec<(f64, f64, Vec<f64>)> = Vec::new(); // (angle_rad, scale, echoes)
        for record in reader.records() {
            let record = record?;
            if record.len() < 5 {
                continue;
            }

            let scale: f64 = record
                .get(1)
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| ConvertError::malformed(path, "invalid Scale value"))?;
            let angle_raw: f64 = record
                .get(4)
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| ConvertError::malformed(path, "invalid Angle value"))?;
            let angle_rad = (angle_raw * self.sweep.angle_scale).to_radians();

            let num_bins = record.len().saturating_sub(5).min(self.sweep.num_echo_columns);
            let mut echoes = Vec::with_capacity(num_bins);
            for i in 0..num_bins {
                let value: f64 = record
                    .get(5 + i)
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(0.0);
                echoes.push(value);
            }

            rows.push((angle_rad, scale, echoes));
        }

        if rows.is_empty() {
            return Err(ConvertError::malformed(path, "no sweep rows"));
        }

        let num_rows = rows.len();
        let mut cloud = PointCloud::with_capacity(num_rows * 8);
        let mut intensity = Vec::new();

        for (row_idx, (angle_rad, scale, echoes)) in rows.iter().enumerate() {
            if echoes.is_empty() {
                continue;
            }
            let range_step = scale / echoes.len() as f64;
            let time = base_time
                + (row_idx as f64 / num_rows as f64 * self.sweep.rotation_period_secs) as i64;
            let (sin_a, cos_a) = angle_rad.sin_cos();

            for (bin_idx, &echo) in echoes.iter().enumerate() {
                if echo <= self.sweep.intensity_threshold {
                    continue;
                }
                let range = range_step * bin_idx as f64;
                let east = range * cos_a;
                let north = range * sin_a;
                let (lon, lat, alt) = enu_to_geodetic(&self.site, east, north, 0.0);
                cloud.push(lon, lat, alt, time);
                intensity.push(echo as f32);
            }
        }

        if cloud.is_empty() {
            return Err(ConvertError::malformed(
                path,
                "no echoes above the intensity threshold",
            ));
        }

        cloud
            .schema
            .declare("intensity", AttributeSpec::float(None))
            .expect("fresh schema cannot conflict");
        cloud
            .attributes
            .insert("intensity".to_string(), AttributeColumn::Float(intensity));

        build_granule(Self::FORMAT_ID, source, cloud, Some("sweep-sensor"))
    }
}

// ---------------------------------------------------------------------------
// ply
// ---------------------------------------------------------------------------

/// Converter for ASCII PLY point clouds.
///
/// Vertex x/y/z properties are local east/north/up meters projected around
/// the site origin. A per-point time property (`time`, `t`, or `gps_time`)
/// is required; remaining scalar properties become attributes typed from
/// the declared PLY property type.
#[derive(Debug)]
pub struct PlyConverter {
    site: SiteConfig,
}

impl PlyConverter {
    pub const FORMAT_ID: &'static str = "ply";

    const TIME_PROPERTIES: [&'static str; 3] = ["time", "t", "gps_time"];

    pub fn new(site: SiteConfig) -> Self {
        Self { site }
    }

    fn dtype_for(ply_type: &str) -> Option<AttributeType> {
        match ply_type {
            "float" | "float32" | "double" | "float64" => Some(AttributeType::Float),
            "char" | "uchar" | "int8" | "uint8" | "short" | "ushort" | "int16" | "uint16"
            | "int" | "uint" | "int32" | "uint32" => Some(AttributeType::Int),
            _ => None,
        }
    }
}

impl Converter for PlyConverter {
    fn format_id(&self) -> &'static str {
        Self::FORMAT_ID
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ply"]
    }

    fn magic(&self) -> Option<&'static [u8]> {
        Some(b"ply")
    }

    fn convert(&self, source: &RawSource) -> Result<Granule> {
        let path = source.path();
        let reader = source.open()?;
        let mut lines = reader.lines();

        let first = lines
            .next()
            .transpose()?
            .ok_or_else(|| ConvertError::malformed(path, "empty file"))?;
        if first.trim() != "ply" {
            return Err(ConvertError::malformed(path, "missing ply magic"));
        }

        // Header: element vertex count plus ordered (type, name) properties.
        let mut num_vertices: Option<usize> = None;
        let mut properties: Vec<(String, String)> = Vec::new();
        let mut header_done = false;
        for line in &mut lines {
            let line = line?;
            let stripped = line.trim();
            if stripped.starts_with("element vertex") {
                num_vertices = stripped.split_whitespace().last().and_then(|s| s.parse().ok());
            } else if stripped.starts_with("property") {
                let parts: Vec<&str> = stripped.split_whitespace().collect();
                if parts.len() >= 3 {
                    properties.push((parts[1].to_lowercase(), parts[2].to_lowercase()));
                }
            } else if stripped == "end_header" {
                header_done = true;
                break;
            }
        }
        if !header_done {
            return Err(ConvertError::malformed(path, "missing end_header"));
        }
        let num_vertices = num_vertices
            .ok_or_else(|| ConvertError::malformed(path, "no vertex count in header"))?;

        let index_of = |name: &str| properties.iter().position(|(_, n)| n == name);
        let x_idx = index_of("x")
            .ok_or_else(|| ConvertError::unsupported(Self::FORMAT_ID, path, "no x property"))?;
        let y_idx = index_of("y")
            .ok_or_else(|| ConvertError::unsupported(Self::FORMAT_ID, path, "no y property"))?;
        let z_idx = index_of("z")
            .ok_or_else(|| ConvertError::unsupported(Self::FORMAT_ID, path, "no z property"))?;
        let time_idx = Self::TIME_PROPERTIES
            .iter()
            .find_map(|name| index_of(name))
            .ok_or_else(|| {
                ConvertError::unsupported(
                    Self::FORMAT_ID,
                    path,
                    "no per-point time property (expected time, t, or gps_time)",
                )
            })?;

        let skip = [x_idx, y_idx, z_idx, time_idx];
        let attr_props: Vec<(usize, String, AttributeType)> = properties
            .iter()
            .enumerate()
            .filter(|(i, _)| !skip.contains(i))
            .filter_map(|(i, (ply_type, name))| {
                Self::dtype_for(ply_type).map(|dtype| (i, name.clone(), dtype))
            })
            .collect();

        let mut cloud = PointCloud::with_capacity(num_vertices);
        let mut raw_time = Vec::with_capacity(num_vertices);
        let mut attr_data: Vec<AttributeColumn> = attr_props
            .iter()
            .map(|(_, _, dtype)| match dtype {
                AttributeType::Float => AttributeColumn::Float(Vec::with_capacity(num_vertices)),
                AttributeType::Int => AttributeColumn::Int(Vec::with_capacity(num_vertices)),
            })
            .collect();

        let mut count = 0;
        for line in lines {
            if count >= num_vertices {
                break;
            }
            let line = line?;
            let values: Vec<&str> = line.split_whitespace().collect();
            if values.len() < properties.len() {
                continue;
            }

            let field = |idx: usize, what: &str| -> Result<f64> {
                values[idx].parse().map_err(|_| {
                    ConvertError::malformed(
                        path,
                        format!("vertex {}: invalid {} value '{}'", count, what, values[idx]),
                    )
                })
            };

            let east = field(x_idx, "x")?;
            let north = field(y_idx, "y")?;
            let up = field(z_idx, "z")?;
            raw_time.push(field(time_idx, "time")?);

            let (lon, lat, alt) = enu_to_geodetic(&self.site, east, north, up);
            // Timestamp is patched in after normalization below.
            cloud.push(lon, lat, alt, 0);

            for (slot, (idx, name, _)) in attr_props.iter().enumerate() {
                match &mut attr_data[slot] {
                    AttributeColumn::Float(v) => v.push(field(*idx, name)? as f32),
                    AttributeColumn::Int(v) => v.push(field(*idx, name)? as i32),
                }
            }
            count += 1;
        }

        if count < num_vertices {
            return Err(ConvertError::malformed(
                path,
                format!("expected {} vertices, found {}", num_vertices, count),
            ));
        }

        let hint = timeutils::date_hint(None, &source.file_name());
        cloud.time = timeutils::normalize_timestamps(&raw_time, None, hint)
            .map_err(|e| ConvertError::unsupported(Self::FORMAT_ID, path, e.to_string()))?;

        for (slot, (_, name, dtype)) in attr_props.iter().enumerate() {
            let spec = match dtype {
                AttributeType::Float => AttributeSpec::float(None),
                AttributeType::Int => AttributeSpec::int(None),
            };
            cloud.schema.declare(name, spec).map_err(|conflict| {
                ConvertError::unsupported(Self::FORMAT_ID, path, conflict.to_string())
            })?;
            cloud
                .attributes
                .entry(name.clone())
                .or_insert_with(|| attr_data[slot].clone());
        }

        build_granule(Self::FORMAT_ID, source, cloud, None)
    }
}
