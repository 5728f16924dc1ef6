//! Core granule abstraction: data model, converters, and format detection.

pub mod converters;
pub mod granule;
pub mod registry;
pub mod timeutils;

pub use converters::{ConvertError, Converter, RawSource};
pub use granule::{Granule, Payload, PayloadKind, PointCloud, Provenance};
pub use registry::ConverterRegistry;
