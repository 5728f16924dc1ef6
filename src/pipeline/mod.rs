//! Pipeline driver: detect format, convert, write the array store, then
//! write the visualization packets.
//!
//! Sequencing is strict. Conversion must fully complete before the array
//! store is touched; the store must finalize before packet generation
//! starts; a failure at any stage aborts the run and later stages are
//! never attempted. Independent granules run in parallel worker tasks that
//! share only the read-only converter registry.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use rayon::prelude::*;

use crate::config::PipelineConfig;
use crate::core::{ConverterRegistry, RawSource};
use crate::store::{ArrayStoreWriter, DirectoryStore, StoreSummary};
use crate::visualization::{JsonVizSink, VizSummary, VizWriter};

/// Handles returned from one successful pipeline run.
#[derive(Debug)]
pub struct RunOutput {
    pub source: PathBuf,
    pub format: String,
    pub store_path: PathBuf,
    pub viz_path: PathBuf,
    pub store: StoreSummary,
    pub viz: VizSummary,
}

/// Orchestrates one conversion pipeline over shared, read-only writers.
pub struct Pipeline {
    registry: ConverterRegistry,
    store_writer: ArrayStoreWriter,
    viz_writer: VizWriter,
}

impl Pipeline {
    /// Pipeline wired with the production converter and strategy sets.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            registry: ConverterRegistry::with_builtin(config),
            store_writer: ArrayStoreWriter::new(config.store.chunk_size),
            viz_writer: VizWriter::new(config.viz.clone()),
        }
    }

    pub fn registry(&self) -> &ConverterRegistry {
        &self.registry
    }

    /// Run the full pipeline for one raw source.
    pub fn run(
        &self,
        source: &RawSource,
        store_dest: &Path,
        viz_dest: &Path,
    ) -> Result<RunOutput> {
        let display = source.path().display().to_string();

        let converter = self
            .registry
            .resolve(source)
            .with_context(|| format!("detecting format of '{}'", display))?;
        let format = converter.format_id().to_string();
        info!("{}: detected format '{}'", display, format);

        let granule = converter
            .convert(source)
            .with_context(|| format!("converting '{}' as '{}'", display, format))?;

        let sink = DirectoryStore::create(store_dest).with_context(|| {
            format!("preparing array store at '{}'", store_dest.display())
        })?;
        let store = self
            .store_writer
            .write(&granule, &sink)
            .with_context(|| format!("writing array store for '{}' ({})", display, format))?;
        info!(
            "{}: stored {} points in {} chunks",
            display, store.point_count, store.chunk_count
        );

        let mut viz_sink = JsonVizSink::create(viz_dest).with_context(|| {
            format!("preparing visualization output at '{}'", viz_dest.display())
        })?;
        let viz = self
            .viz_writer
            .write(store_dest, &mut viz_sink)
            .with_context(|| format!("writing visualization for '{}' ({})", display, format))?;
        info!("{}: emitted {} packets", display, viz.packet_count);

        Ok(RunOutput {
            source: source.path().to_path_buf(),
            format,
            store_path: store_dest.to_path_buf(),
            viz_path: viz_dest.to_path_buf(),
            store,
            viz,
        })
    }

    /// Process independent granules in parallel.
    ///
    /// Each input gets its own destinations under `output_dir`, derived
    /// from the input file stem. One granule's failure is reported in its
    /// result slot and never affects the others.
    pub fn run_batch(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
    ) -> Vec<(PathBuf, Result<RunOutput>)> {
        inputs
            .par_iter()
            .map(|input| {
                let stem = input
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "granule".to_string());
                let store_dest = output_dir.join(format!("{}.store", stem));
                let viz_dest = output_dir.join(format!("{}.viz.json", stem));
                let result = self.run(&RawSource::new(input), &store_dest, &viz_dest);
                if let Err(err) = &result {
                    warn!("{}: pipeline failed: {:#}", input.display(), err);
                }
                (input.clone(), result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::converters::ConvertError;

    fn pipeline() -> Pipeline {
        Pipeline::new(&PipelineConfig::default())
    }

    #[test]
    fn test_run_point_csv_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("points.csv");
        std::fs::write(
            &input,
            "lon,lat,alt,time,ref\n\
             10.0,45.0,1000.0,100,5.0\n\
             10.1,45.1,1100.0,101,7.0\n",
        )
        .unwrap();

        let store_dest = dir.path().join("points.store");
        let viz_dest = dir.path().join("points.viz.json");
        let output = pipeline()
            .run(&RawSource::new(&input), &store_dest, &viz_dest)
            .unwrap();

        assert_eq!(output.format, "point-csv");
        assert_eq!(output.store.point_count, 2);
        assert_eq!(output.viz.packet_count, 2);
        assert!(store_dest.join("metadata.json").is_file());
        assert!(viz_dest.is_file());
    }

    #[test]
    fn test_unknown_format_aborts_before_any_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mystery.csv");
        std::fs::write(&input, "a,b,c\n1,2,3\n").unwrap();

        let store_dest = dir.path().join("mystery.store");
        let viz_dest = dir.path().join("mystery.viz.json");
        let err = pipeline()
            .run(&RawSource::new(&input), &store_dest, &viz_dest)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::UnknownFormat { .. })
        ));
        assert!(!store_dest.exists());
        assert!(!viz_dest.exists());
    }

    #[test]
    fn test_batch_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.csv");
        std::fs::write(&good, "lon,lat,alt,time\n1.0,2.0,3.0,4\n").unwrap();
        let bad = dir.path().join("bad.csv");
        std::fs::write(&bad, "lon,lat,alt,time\n1.0,oops,3.0,4\n").unwrap();

        let out_dir = dir.path().join("out");
        let results = pipeline().run_batch(&[good.clone(), bad.clone()], &out_dir);
        assert_eq!(results.len(), 2);

        let by_input = |p: &Path| {
            results
                .iter()
                .find(|(input, _)| input == p)
                .map(|(_, r)| r)
                .unwrap()
        };
        assert!(by_input(&good).is_ok());
        assert!(by_input(&bad).is_err());
        assert!(out_dir.join("good.store").join("metadata.json").is_file());
        assert!(!out_dir.join("bad.store").exists());
    }
}
