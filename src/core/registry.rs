//! Converter registry and format auto-detection.
//!
//! The registry maps format identifiers to converter strategies and detects
//! which converter applies to a raw source. Detection rules run in priority
//! order: file extension, magic bytes, then embedded metadata probes.
//! Converters are kept in a `BTreeMap`, so detection is deterministic and
//! independent of registration order.
//!
//! The registry is populated once at startup and read-only afterwards;
//! concurrent lookups from worker tasks are safe.

use std::collections::BTreeMap;

use log::debug;

use crate::config::PipelineConfig;
use crate::core::converters::{
    ConvertError, Converter, GeodeticCsvConverter, PlyConverter, RawSource, Result,
    SweepCsvConverter,
};

/// Maps `format_id` to its converter. Keys are unique.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: BTreeMap<String, Box<dyn Converter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the production converters, wired to the
    /// pipeline configuration.
    pub fn with_builtin(config: &PipelineConfig) -> Self {
        let mut registry = Self::new();
        registry
            .register(Box::new(GeodeticCsvConverter))
            .expect("empty registry cannot conflict");
        registry
            .register(Box::new(SweepCsvConverter::new(
                config.site.clone(),
                config.sweep.clone(),
            )))
            .expect("builtin format ids are distinct");
        registry
            .register(Box::new(PlyConverter::new(config.site.clone())))
            .expect("builtin format ids are distinct");
        registry
    }

    /// Register a converter under its format id.
    pub fn register(&mut self, converter: Box<dyn Converter>) -> Result<()> {
        let format = converter.format_id();
        if self.converters.contains_key(format) {
            return Err(ConvertError::DuplicateFormat {
                format: format.to_string(),
            });
        }
        self.converters.insert(format.to_string(), converter);
        Ok(())
    }

    /// Look up a converter by exact format id.
    pub fn get(&self, format_id: &str) -> Result<&dyn Converter> {
        self.converters
            .get(format_id)
            .map(Box::as_ref)
            .ok_or_else(|| ConvertError::UnknownFormat {
                detail: format!("format id '{}'", format_id),
            })
    }

    /// Registered format ids, in sorted order.
    pub fn format_ids(&self) -> Vec<&str> {
        self.converters.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Detect which converter applies to the raw source.
    ///
    /// An explicit format hint bypasses detection. Otherwise the detection
    /// rules narrow the candidate set in priority order: a uniquely claimed
    /// file extension wins outright; magic bytes break extension ties and
    /// cover unknown extensions; embedded metadata probes run last, in
    /// format-id order. Identical input always resolves identically.
    pub fn resolve(&self, source: &RawSource) -> Result<&dyn Converter> {
        if let Some(hint) = source.format_hint() {
            return self.get(hint);
        }

        let all: Vec<&Box<dyn Converter>> = self.converters.values().collect();

        // 1. File extension.
        let extension = source.extension();
        let by_ext: Vec<&Box<dyn Converter>> = match &extension {
            Some(ext) => all
                .iter()
                .filter(|c| c.extensions().contains(&ext.as_str()))
                .copied()
                .collect(),
            None => Vec::new(),
        };
        if by_ext.len() == 1 {
            debug!(
                "resolved '{}' to {} by extension",
                source.path().display(),
                by_ext[0].format_id()
            );
            return Ok(by_ext[0].as_ref());
        }

        // 2. Magic bytes, over the extension ties or the full set.
        let pool: &[&Box<dyn Converter>] = if by_ext.is_empty() { &all } else { &by_ext };
        let prefix = source.read_prefix(16)?;
        let by_magic: Vec<&Box<dyn Converter>> = pool
            .iter()
            .filter(|c| c.magic().is_some_and(|m| prefix.starts_with(m)))
            .copied()
            .collect();
        if by_magic.len() == 1 {
            debug!(
                "resolved '{}' to {} by magic bytes",
                source.path().display(),
                by_magic[0].format_id()
            );
            return Ok(by_magic[0].as_ref());
        }

        // 3. Embedded metadata probes, first match in format-id order.
        let pool: &[&Box<dyn Converter>] = if by_magic.is_empty() { pool } else { &by_magic };
        for converter in pool {
            let converter: &Box<dyn Converter> = *converter;
            if converter.sniff(source)? {
                debug!(
                    "resolved '{}' to {} by metadata probe",
                    source.path().display(),
                    converter.format_id()
                );
                return Ok(converter.as_ref());
            }
        }

        Err(ConvertError::UnknownFormat {
            detail: source.path().display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry() -> ConverterRegistry {
        ConverterRegistry::with_builtin(&PipelineConfig::default())
    }

    #[test]
    fn test_builtin_formats() {
        let registry = registry();
        assert_eq!(registry.format_ids(), vec!["ply", "point-csv", "sweep-csv"]);
        assert!(registry.get("ply").is_ok());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = registry();
        let err = registry.register(Box::new(GeodeticCsvConverter)).unwrap_err();
        assert!(matches!(err, ConvertError::DuplicateFormat { format } if format == "point-csv"));
    }

    #[test]
    fn test_get_unknown_format() {
        let err = registry().get("grib2").unwrap_err();
        assert!(matches!(err, ConvertError::UnknownFormat { .. }));
    }

    #[test]
    fn test_resolve_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".ply").tempfile().unwrap();
        writeln!(file, "ply\nformat ascii 1.0\nend_header").unwrap();
        file.flush().unwrap();

        let registry = registry();
        let converter = registry.resolve(&RawSource::new(file.path())).unwrap();
        assert_eq!(converter.format_id(), "ply");
    }

    #[test]
    fn test_resolve_by_magic_with_unknown_extension() {
        let mut file = tempfile::Builder::new().suffix(".dat").tempfile().unwrap();
        writeln!(file, "ply\nformat ascii 1.0\nend_header").unwrap();
        file.flush().unwrap();

        let converter = registry();
        let resolved = converter.resolve(&RawSource::new(file.path())).unwrap();
        assert_eq!(resolved.format_id(), "ply");
    }

    #[test]
    fn test_resolve_csv_by_header_probe() {
        let mut point = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(point, "lon,lat,alt,time\n1.0,2.0,3.0,4").unwrap();
        point.flush().unwrap();

        let mut sweep = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(sweep, "Status,Scale,Range,Gain,Angle,Echo_0\n0,100,50,40,0,5").unwrap();
        sweep.flush().unwrap();

        let registry = registry();
        assert_eq!(
            registry.resolve(&RawSource::new(point.path())).unwrap().format_id(),
            "point-csv"
        );
        assert_eq!(
            registry.resolve(&RawSource::new(sweep.path())).unwrap().format_id(),
            "sweep-csv"
        );
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "lon,lat,alt,time\n1.0,2.0,3.0,4").unwrap();
        file.flush().unwrap();

        let registry = registry();
        let source = RawSource::new(file.path());
        let first = registry.resolve(&source).unwrap().format_id();
        let second = registry.resolve(&source).unwrap().format_id();
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_unknown_format() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "a,b,c\n1,2,3").unwrap();
        file.flush().unwrap();

        let registry = registry();
        let err = registry.resolve(&RawSource::new(file.path())).unwrap_err();
        assert!(matches!(err, ConvertError::UnknownFormat { .. }));
    }

    #[test]
    fn test_resolve_honors_explicit_hint() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "lon,lat,alt,time\n1.0,2.0,3.0,4").unwrap();
        file.flush().unwrap();

        let registry = registry();
        let hinted = RawSource::with_hint(file.path(), "point-csv");
        assert_eq!(registry.resolve(&hinted).unwrap().format_id(), "point-csv");

        let bad_hint = RawSource::with_hint(file.path(), "grib2");
        assert!(matches!(
            registry.resolve(&bad_hint),
            Err(ConvertError::UnknownFormat { .. })
        ));
    }
}
