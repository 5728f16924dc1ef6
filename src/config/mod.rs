//! Configuration types for the campaign pipeline.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Site origin used to project local sensor coordinates onto the geodetic
/// frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Origin longitude in degrees east.
    #[serde(default)]
    pub origin_lon: f64,

    /// Origin latitude in degrees north.
    #[serde(default)]
    pub origin_lat: f64,

    /// Origin altitude in meters.
    #[serde(default)]
    pub origin_alt: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            origin_lon: 0.0,
            origin_lat: 0.0,
            origin_alt: 0.0,
        }
    }
}

/// Geometry and filtering parameters for sweep CSV sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Scale factor converting raw angle counts to degrees.
    #[serde(default = "default_angle_scale")]
    pub angle_scale: f64,

    /// Maximum number of echo columns to read per sweep line.
    #[serde(default = "default_num_echo_columns")]
    pub num_echo_columns: usize,

    /// Minimum echo intensity for a bin to become a point.
    #[serde(default)]
    pub intensity_threshold: f64,

    /// Seconds per full sensor rotation, used to spread sweep-line
    /// timestamps across the acquisition.
    #[serde(default = "default_rotation_period")]
    pub rotation_period_secs: f64,
}

fn default_angle_scale() -> f64 {
    360.0 / 8196.0
}

fn default_num_echo_columns() -> usize {
    1024
}

fn default_rotation_period() -> f64 {
    2.0
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            angle_scale: default_angle_scale(),
            num_echo_columns: default_num_echo_columns(),
            intensity_threshold: 0.0,
            rotation_period_secs: default_rotation_period(),
        }
    }
}

/// Chunking parameters for the array-store writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Points per chunk; bounds the in-memory working set per write.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    10_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Packet layout emitted by the visualization writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketMode {
    /// One packet per point with a zero-length availability interval.
    Points,
    /// A single packet carrying epoch-relative position samples.
    Path,
}

/// Styling and layout for the visualization writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VizConfig {
    #[serde(default = "default_packet_mode")]
    pub mode: PacketMode,

    /// Base packet color.
    #[serde(default = "default_rgba")]
    pub rgba: [u8; 4],

    #[serde(default = "default_pixel_size")]
    pub pixel_size: u32,

    /// Attribute whose value range drives the alpha ramp, when present in
    /// the store.
    #[serde(default)]
    pub style_attribute: Option<String>,

    /// Keep every nth sample in path mode.
    #[serde(default = "default_path_stride")]
    pub path_stride: usize,
}

fn default_packet_mode() -> PacketMode {
    PacketMode::Points
}

fn default_rgba() -> [u8; 4] {
    [255, 0, 0, 255]
}

fn default_pixel_size() -> u32 {
    4
}

fn default_path_stride() -> usize {
    1
}

impl Default for VizConfig {
    fn default() -> Self {
        Self {
            mode: default_packet_mode(),
            rgba: default_rgba(),
            pixel_size: default_pixel_size(),
            style_attribute: None,
            path_stride: default_path_stride(),
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub site: SiteConfig,

    #[serde(default)]
    pub sweep: SweepConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub viz: VizConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.store.chunk_size, 10_000);
        assert_eq!(config.sweep.num_echo_columns, 1024);
        assert_eq!(config.viz.mode, PacketMode::Points);
        assert_eq!(config.viz.rgba, [255, 0, 0, 255]);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "store:\n  chunk_size: 500\nviz:\n  mode: path\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.chunk_size, 500);
        assert_eq!(config.viz.mode, PacketMode::Path);
        // Untouched sections keep their defaults.
        assert_eq!(config.viz.pixel_size, 4);
        assert_eq!(config.sweep.rotation_period_secs, 2.0);
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");

        let mut config = PipelineConfig::default();
        config.site.origin_lat = 38.5;
        config.viz.style_attribute = Some("intensity".to_string());
        config.to_yaml(&path).unwrap();

        let loaded = PipelineConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.site.origin_lat, 38.5);
        assert_eq!(loaded.viz.style_attribute.as_deref(), Some("intensity"));
    }
}
