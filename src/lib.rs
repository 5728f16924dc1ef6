//! Field-campaign granule conversion pipeline.
//!
//! This crate normalizes heterogeneous scientific field-campaign files
//! (point-cloud granules) into a uniform in-memory representation and
//! re-serializes it for downstream consumers:
//! - Auto-detecting which converter applies to a raw source file
//! - Normalizing source schemas into a [`core::Granule`] with a typed
//!   payload and provenance metadata
//! - Writing chunked array stores for analysis backends (parallelized)
//! - Emitting time-tagged visualization packets for a 4D-globe client
//!
//! # Example
//!
//! ```no_run
//! use campaign_pipeline::{core::RawSource, pipeline::Pipeline, PipelineConfig};
//! use std::path::Path;
//!
//! let pipeline = Pipeline::new(&PipelineConfig::default());
//! let output = pipeline
//!     .run(
//!         &RawSource::new("granule_20170517.csv"),
//!         Path::new("out/granule.store"),
//!         Path::new("out/granule.viz.json"),
//!     )
//!     .unwrap();
//! println!("{} points, {} packets", output.store.point_count, output.viz.packet_count);
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod store;
pub mod visualization;

pub use crate::config::{
    PacketMode, PipelineConfig, SiteConfig, StoreConfig, SweepConfig, VizConfig,
};
pub use crate::core::{ConverterRegistry, Granule, Payload, RawSource};
pub use crate::pipeline::{Pipeline, RunOutput};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
