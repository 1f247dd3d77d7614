//! Building a multiresolution pyramid from a base-resolution array.
//!
//! Levels are stored as arrays `"0"`, `"1"`, ... of a zarr group, finest first.
//! A level is only considered complete once its array metadata exists and declares the
//! expected shape; metadata is written after the last block, so an interrupted level is
//! erased and rebuilt on the next run while earlier levels are kept.
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zarrs::array::codec::GzipCodec;
use zarrs::array::{Array, ArrayBuilder, ArrayBytes, ArraySubset, DataType, FillValue};
use zarrs::storage::{
    ReadableStorageTraits, ReadableWritableListableStorage, ReadableWritableListableStorageTraits,
    StorePrefix, WritableStorageTraits,
};
use zarrs_codec::BytesToBytesCodecTraits;

use crate::config::PyramidSettings;
use crate::sample::{Sample, dispatch_sample};

mod downsample;

pub use downsample::downsample;

/// Array type for levels written by this module.
pub type LevelArray = Array<dyn ReadableWritableListableStorageTraits>;

/// Canonical dimension names of a 5D level.
pub const DIMENSION_NAMES: [&str; 5] = ["t", "c", "z", "y", "x"];

/// Reduction applied over each downsampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownsampleMethod {
    /// Take the first element of each window.
    Stride,
    #[default]
    Mean,
    /// Lower median.
    Median,
    /// Most frequent value, ties to the smallest.
    Mode,
    Min,
    Max,
}

impl DownsampleMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownsampleMethod::Stride => "stride",
            DownsampleMethod::Mean => "mean",
            DownsampleMethod::Median => "median",
            DownsampleMethod::Mode => "mode",
            DownsampleMethod::Min => "min",
            DownsampleMethod::Max => "max",
        }
    }
}

impl fmt::Display for DownsampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownsampleMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s {
            "stride" => DownsampleMethod::Stride,
            "mean" => DownsampleMethod::Mean,
            "median" => DownsampleMethod::Median,
            "mode" => DownsampleMethod::Mode,
            "min" => DownsampleMethod::Min,
            "max" => DownsampleMethod::Max,
            other => return Err(format!("unknown downsample method {other:?}")),
        };
        Ok(method)
    }
}

/// Chunking and processing granularity of a written level.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkLayout {
    pub chunks: Vec<u64>,
    /// Region read and written at once.
    pub processing_block: Vec<u64>,
    pub compression_level: Option<u32>,
}

impl ChunkLayout {
    pub fn new(chunks: Vec<u64>, processing_block: Vec<u64>) -> Self {
        Self {
            chunks,
            processing_block,
            compression_level: None,
        }
    }

    pub fn with_compression_level(mut self, level: Option<u32>) -> Self {
        self.compression_level = level;
        self
    }
}

impl From<&PyramidSettings> for ChunkLayout {
    fn from(settings: &PyramidSettings) -> Self {
        Self {
            chunks: settings.target_chunks.clone(),
            processing_block: settings.processing_block.clone(),
            compression_level: settings.compression_level,
        }
    }
}

/// Zarr node path of a level label.
pub fn node_path(label: &str) -> String {
    format!("/{}", label.trim_start_matches('/'))
}

/// Fit a per-axis setting to an array's rank, keeping the trailing (fastest) axes
/// and padding leading axes with `fill`.
pub(crate) fn fit_to_rank(values: &[u64], rank: usize, fill: u64) -> Vec<u64> {
    if values.len() >= rank {
        values[values.len() - rank..].to_vec()
    } else {
        std::iter::repeat_n(fill, rank - values.len())
            .chain(values.iter().copied())
            .collect()
    }
}

/// Iterates over a shape in fixed-size blocks, C order, clipping the last block of each axis.
#[derive(Debug, Clone)]
pub(crate) struct BlockGrid {
    shape: Vec<u64>,
    block: Vec<u64>,
    counts: Vec<u64>,
    next: Option<Vec<u64>>,
}

impl BlockGrid {
    pub(crate) fn new(shape: &[u64], block: &[u64]) -> Self {
        let block: Vec<u64> = fit_to_rank(block, shape.len(), 1)
            .into_iter()
            .map(|b| b.max(1))
            .collect();
        let counts: Vec<u64> = shape
            .iter()
            .zip(&block)
            .map(|(s, b)| s.div_ceil(*b))
            .collect();
        let next = (!counts.contains(&0)).then(|| vec![0; shape.len()]);
        Self {
            shape: shape.to_vec(),
            block,
            counts,
            next,
        }
    }

    /// Number of blocks along each axis.
    pub(crate) fn counts(&self) -> &[u64] {
        &self.counts
    }
}

impl Iterator for BlockGrid {
    type Item = Vec<Range<u64>>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let ranges = current
            .iter()
            .zip(&self.block)
            .zip(&self.shape)
            .map(|((i, b), s)| i * b..((i + 1) * b).min(*s))
            .collect();

        let mut following = current;
        for axis in (0..following.len()).rev() {
            following[axis] += 1;
            if following[axis] < self.counts[axis] {
                self.next = Some(following);
                break;
            }
            following[axis] = 0;
        }
        Some(ranges)
    }
}

/// Row-major strides of a shape, in elements.
pub(crate) fn c_strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Visit every index of a shape in C order.
pub(crate) fn for_each_index(shape: &[u64], mut f: impl FnMut(&[u64])) {
    if shape.contains(&0) {
        return;
    }
    let mut index = vec![0u64; shape.len()];
    loop {
        f(&index);
        let mut axis = shape.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

fn bytes_to_bytes_codecs(
    compression_level: Option<u32>,
) -> crate::Result<Vec<Arc<dyn BytesToBytesCodecTraits>>> {
    let Some(level) = compression_level else {
        return Ok(vec![]);
    };
    let codec: Arc<dyn BytesToBytesCodecTraits> =
        Arc::new(GzipCodec::new(level).map_err(crate::Error::wrap)?);
    Ok(vec![codec])
}

/// Create (but do not store metadata for) a level array.
pub(crate) fn create_level_array(
    store: &ReadableWritableListableStorage,
    label: &str,
    shape: Vec<u64>,
    data_type: DataType,
    fill_value: FillValue,
    layout: &ChunkLayout,
) -> crate::Result<LevelArray> {
    let chunks: Vec<u64> = fit_to_rank(&layout.chunks, shape.len(), 1)
        .into_iter()
        .map(|c| c.max(1))
        .collect();
    let mut builder = ArrayBuilder::new(shape.clone(), chunks, data_type, fill_value);
    builder.bytes_to_bytes_codecs(bytes_to_bytes_codecs(layout.compression_level)?);
    if shape.len() == DIMENSION_NAMES.len() {
        builder.dimension_names(DIMENSION_NAMES.into());
    }
    Ok(builder.build(store.clone(), &node_path(label))?)
}

/// Remove whatever an interrupted run left under a level.
pub(crate) fn erase_level(
    store: &ReadableWritableListableStorage,
    label: &str,
) -> crate::Result<()> {
    let prefix =
        StorePrefix::new(format!("{}/", label.trim_matches('/'))).map_err(crate::Error::wrap)?;
    store.erase_prefix(&prefix)?;
    Ok(())
}

/// Whether a level has been completely written with the expected shape.
pub fn level_is_complete(
    store: &ReadableWritableListableStorage,
    label: &str,
    expected_shape: &[u64],
) -> bool {
    match Array::open(store.clone(), &node_path(label)) {
        Ok(array) => array.shape() == expected_shape,
        Err(_) => false,
    }
}

/// Copy `source` into a new level with a different chunk layout.
///
/// Data is streamed one processing block at a time, so values are bit-identical and peak
/// memory is bounded by the block size.
pub fn rechunk<TStorage: ?Sized + ReadableStorageTraits + 'static>(
    source: &Array<TStorage>,
    store: &ReadableWritableListableStorage,
    label: &str,
    layout: &ChunkLayout,
) -> crate::Result<LevelArray> {
    let dest = create_level_array(
        store,
        label,
        source.shape().to_vec(),
        source.data_type().clone(),
        source.fill_value().clone(),
        layout,
    )?;

    let grid = BlockGrid::new(source.shape(), &layout.processing_block);
    let counts = grid.counts().to_vec();
    for (n, ranges) in grid.enumerate() {
        let subset = ArraySubset::new_with_ranges(&ranges);
        let block: ArrayBytes<'_> = source.retrieve_array_subset(&subset)?;
        dest.store_array_subset(&subset, block)?;
        log::debug!("rechunk {label}: block {n} of grid {counts:?}");
    }

    dest.store_metadata()?;
    Ok(dest)
}

/// Which levels a [`PyramidBuilder::build`] call produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    /// All level labels, finest first.
    pub levels: Vec<String>,
    /// Labels written by this call.
    pub built: Vec<String>,
    /// Labels already complete and left untouched.
    pub skipped: Vec<String>,
}

/// Builds the levels of a pyramid, resuming after the last complete one.
#[derive(Debug, Clone)]
pub struct PyramidBuilder {
    settings: PyramidSettings,
}

impl PyramidBuilder {
    pub fn new(settings: PyramidSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PyramidSettings {
        &self.settings
    }

    /// Level labels, finest first.
    pub fn labels(&self) -> Vec<String> {
        (0..self.settings.n_levels.max(1))
            .map(|i| i.to_string())
            .collect()
    }

    /// Expected shape of each level given the base shape.
    pub fn level_shapes(&self, base_shape: &[u64]) -> Vec<Vec<u64>> {
        let factors = fit_to_rank(&self.settings.downsample_factors, base_shape.len(), 1);
        let mut shapes = vec![base_shape.to_vec()];
        for _ in 1..self.settings.n_levels.max(1) {
            let previous = &shapes[shapes.len() - 1];
            let next = previous
                .iter()
                .zip(&factors)
                .map(|(s, f)| s.div_ceil((*f).max(1)))
                .collect();
            shapes.push(next);
        }
        shapes
    }

    /// Rechunk `base` into level `"0"` of `store` and downsample each following level
    /// from its predecessor. Complete levels are never rewritten.
    pub fn build<TStorage: ?Sized + ReadableStorageTraits + 'static>(
        &self,
        base: &Array<TStorage>,
        store: &ReadableWritableListableStorage,
    ) -> crate::Result<BuildReport> {
        let layout = ChunkLayout::from(&self.settings);
        let labels = self.labels();
        let shapes = self.level_shapes(base.shape());
        let mut report = BuildReport {
            levels: labels.clone(),
            ..Default::default()
        };

        for (i, (label, shape)) in labels.iter().zip(&shapes).enumerate() {
            if level_is_complete(store, label, shape) {
                log::info!("level {label} already complete, skipping");
                report.skipped.push(label.clone());
                continue;
            }
            erase_level(store, label)?;
            if i == 0 {
                log::info!("rechunking base to level {label} with chunks {:?}", layout.chunks);
                rechunk(base, store, label, &layout)?;
            } else {
                let previous = Array::open(store.clone(), &node_path(&labels[i - 1]))?;
                log::info!(
                    "downsampling level {} to level {label} with factors {:?}",
                    labels[i - 1],
                    self.settings.downsample_factors
                );
                downsample(
                    &previous,
                    store,
                    label,
                    &self.settings.downsample_factors,
                    &layout,
                    self.settings.downsample_method,
                )?;
            }
            report.built.push(label.clone());
        }
        Ok(report)
    }
}

/// Copy the given levels of a pyramid into `dest` with two axes swapped.
pub fn transpose_levels(
    source: &ReadableWritableListableStorage,
    dest: &ReadableWritableListableStorage,
    labels: &[String],
    axes: (usize, usize),
    layout: &ChunkLayout,
) -> crate::Result<()> {
    for label in labels {
        let array = Array::open(source.clone(), &node_path(label))?;
        let rank = array.dimensionality();
        if axes.0 >= rank || axes.1 >= rank {
            return Err(crate::Error::UnsupportedArrayShape {
                shape: array.shape().to_vec(),
            });
        }
        let mut shape = array.shape().to_vec();
        shape.swap(axes.0, axes.1);
        if level_is_complete(dest, label, &shape) {
            log::info!("transposed level {label} already complete, skipping");
            continue;
        }
        erase_level(dest, label)?;
        let out = create_level_array(
            dest,
            label,
            shape,
            array.data_type().clone(),
            array.fill_value().clone(),
            layout,
        )?;
        dispatch_sample!(
            array.data_type(),
            transpose_blocks::<T, _>(&array, &out, axes, &layout.processing_block)
        )?;
        out.store_metadata()?;
        log::info!("transposed level {label}");
    }
    Ok(())
}

fn transpose_blocks<T: Sample, TStorage: ?Sized + ReadableStorageTraits + 'static>(
    source: &Array<TStorage>,
    dest: &LevelArray,
    axes: (usize, usize),
    block: &[u64],
) -> crate::Result<()> {
    for dest_ranges in BlockGrid::new(dest.shape(), block) {
        let mut source_ranges = dest_ranges.clone();
        source_ranges.swap(axes.0, axes.1);
        let values: Vec<T> =
            source.retrieve_array_subset(&ArraySubset::new_with_ranges(&source_ranges))?;

        let source_shape: Vec<u64> = source_ranges.iter().map(|r| r.end - r.start).collect();
        let dest_shape: Vec<u64> = dest_ranges.iter().map(|r| r.end - r.start).collect();
        let strides = c_strides(&source_shape);
        let mut out = Vec::with_capacity(values.len());
        for_each_index(&dest_shape, |index| {
            let mut offset = 0;
            for (axis, i) in index.iter().enumerate() {
                let source_axis = if axis == axes.0 {
                    axes.1
                } else if axis == axes.1 {
                    axes.0
                } else {
                    axis
                };
                offset += i * strides[source_axis];
            }
            out.push(values[offset as usize]);
        });
        dest.store_array_subset(&ArraySubset::new_with_ranges(&dest_ranges), &out)?;
    }
    Ok(())
}
