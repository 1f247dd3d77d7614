//! Explicit configuration threaded into each component.
//!
//! Nothing here reads files or the environment; callers deserialize or construct these
//! structures and pass them in.
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pyramid::DownsampleMethod;

/// Top-level settings for a conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the local disk cache; pyramids live under `<cache_root>/zarr`.
    pub cache_root: PathBuf,
    pub endpoint_url: String,
    pub bucket_name: String,
    pub converter: ConverterSettings,
    pub pyramid: PyramidSettings,
    pub render: RenderSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let cache_root = dirs::cache_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("bia-converter");
        Self {
            cache_root,
            endpoint_url: "https://uk1s3.embassy.ebi.ac.uk".into(),
            bucket_name: "bia-integrator-data".into(),
            converter: ConverterSettings::default(),
            pyramid: PyramidSettings::default(),
            render: RenderSettings::default(),
        }
    }
}

impl Settings {
    /// Directory holding finished pyramids, keyed by image identity.
    pub fn zarr_cache_dir(&self) -> PathBuf {
        self.cache_root.join("zarr")
    }

    /// Directory holding raw output of the external converter, keyed by image identity.
    pub fn converter_cache_dir(&self) -> PathBuf {
        self.cache_root.join("bf2raw")
    }

    pub fn pyramid_path(&self, image_id: &str) -> PathBuf {
        self.zarr_cache_dir().join(format!("{image_id}.zarr"))
    }

    pub fn transposed_pyramid_path(&self, image_id: &str) -> PathBuf {
        self.zarr_cache_dir().join(format!("{image_id}-transposed.zarr"))
    }

    pub fn converter_output_path(&self, image_id: &str) -> PathBuf {
        self.converter_cache_dir().join(format!("{image_id}.zarr"))
    }

    /// Where the converter writes before its output is moved to
    /// [`Settings::converter_output_path`].
    pub fn converter_partial_path(&self, image_id: &str) -> PathBuf {
        self.converter_cache_dir().join(format!("{image_id}.zarr.partial"))
    }
}

/// How to invoke the external bioformats-to-zarr converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterSettings {
    pub bin: PathBuf,
    /// Exported as `JAVA_HOME` for the child process if set.
    pub java_home: Option<PathBuf>,
    /// Path of the base-resolution array inside the converter output.
    pub base_array_path: String,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            bin: "bioformats2raw".into(),
            java_home: None,
            base_array_path: "0/0".into(),
        }
    }
}

/// Shape of the generated pyramid.
///
/// All vectors are in `t, c, z, y, x` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidSettings {
    pub target_chunks: Vec<u64>,
    pub downsample_factors: Vec<u64>,
    pub n_levels: usize,
    /// Region copied per read/write during rechunk and downsample; bounds peak memory.
    pub processing_block: Vec<u64>,
    pub downsample_method: DownsampleMethod,
    /// Physical scale of the base level, used when the converter output has none.
    pub default_coordinate_scales: Vec<f64>,
    /// Gzip level for written chunks; `None` stores them raw.
    pub compression_level: Option<u32>,
}

impl Default for PyramidSettings {
    fn default() -> Self {
        Self {
            target_chunks: vec![1, 1, 64, 64, 64],
            downsample_factors: vec![1, 1, 2, 2, 2],
            n_levels: 3,
            processing_block: vec![1, 1, 128, 128, 128],
            downsample_method: DownsampleMethod::Mean,
            default_coordinate_scales: vec![1.0, 1.0, 2e-8, 1e-8, 1e-8],
            compression_level: Some(5),
        }
    }
}

/// Output of derived 2D representations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Width and height of `thumbnail` representations.
    pub thumbnail_size: (u32, u32),
    /// Width and height of `static_display` representations.
    pub static_display_size: (u32, u32),
    pub autocontrast: bool,
    /// Color of the padding around images that do not fill the target size.
    pub fill: [u8; 3],
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            thumbnail_size: (256, 256),
            static_display_size: (512, 512),
            autocontrast: true,
            fill: [0, 0, 0],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    pub transpose_t_z: bool,
}

/// One image a study wants converted.
///
/// With a `pattern` the image is a structured fileset; without one, `name` is the
/// name of the single source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageToConvert {
    pub label: Option<String>,
    pub name: Option<String>,
    pub pattern: Option<String>,
    #[serde(default)]
    pub options: ConversionOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    pub convert_all: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StudySettings {
    pub representative_image: Option<ImageToConvert>,
    pub images_to_convert: Vec<ImageToConvert>,
    pub conversion_settings: ConversionSettings,
}

/// Per-study conversion configuration, keyed by accession id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub studies: BTreeMap<String, StudySettings>,
}
