//! The uniform in-memory granule abstraction.
//!
//! A [`Granule`] wraps exactly one typed [`Payload`] together with the
//! source-format identifier that produced it and immutable provenance
//! metadata. Converters construct granules; writer strategies consume them
//! read-only. Callers dispatch on [`Payload`] variants without knowing the
//! original source format.

use std::collections::BTreeMap;

use thiserror::Error;

/// Coordinate reference frame shared by every point-cloud payload.
///
/// All converters normalize into geodetic longitude/latitude degrees with
/// altitude in meters above the ellipsoid.
pub const GEODETIC_FRAME: &str = "EPSG:4979";

/// Well-known provenance keys.
pub const PROV_SOURCE_PATH: &str = "source_path";
pub const PROV_INSTRUMENT: &str = "instrument";
pub const PROV_TIME_COVERAGE_START: &str = "time_coverage_start";
pub const PROV_TIME_COVERAGE_END: &str = "time_coverage_end";
pub const PROV_FRAME: &str = "frame";

/// Errors raised by granule construction and validation.
#[derive(Debug, Error)]
pub enum GranuleError {
    #[error("column length mismatch: {column} has {actual} values, expected {expected}")]
    LengthMismatch {
        column: String,
        actual: usize,
        expected: usize,
    },

    #[error("attribute '{name}' has values but no schema entry")]
    UndeclaredAttribute { name: String },

    #[error("attribute '{name}' stored as {actual:?} but declared {declared:?}")]
    DtypeMismatch {
        name: String,
        actual: AttributeType,
        declared: AttributeType,
    },

    #[error("granule payload must contain at least one point")]
    EmptyPayload,
}

/// Conflict between two declarations of the same attribute name.
#[derive(Debug, Error)]
#[error("attribute '{name}' declared as both {existing:?} and {conflicting:?}")]
pub struct AttributeConflict {
    pub name: String,
    pub existing: AttributeType,
    pub conflicting: AttributeType,
}

/// Scalar value type of a point attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    Float,
    Int,
}

/// Schema entry for one named attribute.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AttributeSpec {
    pub dtype: AttributeType,
    /// Unit string when the source declares one (e.g. "dBZ", "meters").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl AttributeSpec {
    pub fn float(units: Option<&str>) -> Self {
        Self {
            dtype: AttributeType::Float,
            units: units.map(str::to_string),
        }
    }

    pub fn int(units: Option<&str>) -> Self {
        Self {
            dtype: AttributeType::Int,
            units: units.map(str::to_string),
        }
    }
}

/// Mapping from attribute name to value type and unit, shared across all
/// points of a payload. Fixed once the converter finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AttributeSchema {
    fields: BTreeMap<String, AttributeSpec>,
}

impl AttributeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an attribute. Re-declaring with the same dtype is a no-op
    /// (the first declaration wins); a different dtype is a conflict.
    pub fn declare(&mut self, name: &str, spec: AttributeSpec) -> Result<(), AttributeConflict> {
        if let Some(existing) = self.fields.get(name) {
            if existing.dtype != spec.dtype {
                return Err(AttributeConflict {
                    name: name.to_string(),
                    existing: existing.dtype,
                    conflicting: spec.dtype,
                });
            }
            return Ok(());
        }
        self.fields.insert(name.to_string(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSpec> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Columnar storage for one named attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeColumn {
    Float(Vec<f32>),
    Int(Vec<i32>),
}

impl AttributeColumn {
    pub fn dtype(&self) -> AttributeType {
        match self {
            AttributeColumn::Float(_) => AttributeType::Float,
            AttributeColumn::Int(_) => AttributeType::Int,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AttributeColumn::Float(v) => v.len(),
            AttributeColumn::Int(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `idx` widened to f64, for styling and inspection.
    pub fn value_as_f64(&self, idx: usize) -> f64 {
        match self {
            AttributeColumn::Float(v) => f64::from(v[idx]),
            AttributeColumn::Int(v) => f64::from(v[idx]),
        }
    }
}

/// Container for normalized point-cloud data.
///
/// Columns are parallel: index `i` across `lon`, `lat`, `alt`, `time`, and
/// every attribute column describes one point. Source ordering is preserved;
/// downstream chunking relies on it for temporal locality.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    /// Longitude in degrees east.
    pub lon: Vec<f64>,
    /// Latitude in degrees north.
    pub lat: Vec<f64>,
    /// Altitude in meters.
    pub alt: Vec<f64>,
    /// UTC unix seconds per point.
    pub time: Vec<i64>,
    /// Named attribute columns, keyed in name order.
    pub attributes: BTreeMap<String, AttributeColumn>,
    /// Shared attribute schema.
    pub schema: AttributeSchema,
}

impl PointCloud {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lon: Vec::with_capacity(capacity),
            lat: Vec::with_capacity(capacity),
            alt: Vec::with_capacity(capacity),
            time: Vec::with_capacity(capacity),
            attributes: BTreeMap::new(),
            schema: AttributeSchema::new(),
        }
    }

    /// Number of points in the cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Append one point's coordinates and timestamp.
    #[inline]
    pub fn push(&mut self, lon: f64, lat: f64, alt: f64, time: i64) {
        self.lon.push(lon);
        self.lat.push(lat);
        self.alt.push(alt);
        self.time.push(time);
    }

    /// Minimum and maximum timestamp, or None for an empty cloud.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        let first = *self.time.first()?;
        let (mut min, mut max) = (first, first);
        for &t in &self.time[1..] {
            if t < min {
                min = t;
            }
            if t > max {
                max = t;
            }
        }
        Some((min, max))
    }

    /// Check the structural invariants: non-empty, parallel columns of equal
    /// length, every attribute declared in the schema with a matching dtype.
    pub fn validate(&self) -> Result<(), GranuleError> {
        let n = self.time.len();
        if n == 0 {
            return Err(GranuleError::EmptyPayload);
        }
        for (name, len) in [
            ("lon", self.lon.len()),
            ("lat", self.lat.len()),
            ("alt", self.alt.len()),
        ] {
            if len != n {
                return Err(GranuleError::LengthMismatch {
                    column: name.to_string(),
                    actual: len,
                    expected: n,
                });
            }
        }
        for (name, column) in &self.attributes {
            if column.len() != n {
                return Err(GranuleError::LengthMismatch {
                    column: name.clone(),
                    actual: column.len(),
                    expected: n,
                });
            }
            match self.schema.get(name) {
                None => {
                    return Err(GranuleError::UndeclaredAttribute { name: name.clone() });
                }
                Some(spec) if spec.dtype != column.dtype() => {
                    return Err(GranuleError::DtypeMismatch {
                        name: name.clone(),
                        actual: column.dtype(),
                        declared: spec.dtype,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Payload variant identifier, used for writer-strategy dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    PointCloud,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadKind::PointCloud => write!(f, "point-cloud"),
        }
    }
}

/// The typed data held by a granule.
///
/// A closed tagged-variant set: adding a new campaign data type means adding
/// a variant here plus its converter and writer strategies.
#[derive(Debug, Clone)]
pub enum Payload {
    PointCloud(PointCloud),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::PointCloud(_) => PayloadKind::PointCloud,
        }
    }

    pub fn validate(&self) -> Result<(), GranuleError> {
        match self {
            Payload::PointCloud(cloud) => cloud.validate(),
        }
    }
}

/// Immutable provenance metadata attached to a granule at construction.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    entries: BTreeMap<String, String>,
}

impl Provenance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key during construction. Converters call this before the
    /// granule is built; afterwards the map is only read.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One normalized source file: a typed payload, the format that produced it,
/// and provenance metadata. Read-only after construction.
#[derive(Debug, Clone)]
pub struct Granule {
    payload: Payload,
    source_format: String,
    provenance: Provenance,
}

impl Granule {
    /// Build a granule, enforcing the payload invariants up front.
    pub fn new(
        payload: Payload,
        source_format: &str,
        provenance: Provenance,
    ) -> Result<Self, GranuleError> {
        payload.validate()?;
        Ok(Self {
            payload,
            source_format: source_format.to_string(),
            provenance,
        })
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn source_format(&self) -> &str {
        &self.source_format
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// The point cloud payload, if that is this granule's variant.
    pub fn point_cloud(&self) -> Option<&PointCloud> {
        match &self.payload {
            Payload::PointCloud(cloud) => Some(cloud),
        }
    }
}
