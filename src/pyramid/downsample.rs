use std::cmp::Ordering;
use std::ops::Range;

use zarrs::array::{Array, ArraySubset};
use zarrs::storage::{ReadableStorageTraits, ReadableWritableListableStorage};

use super::{
    BlockGrid, ChunkLayout, DownsampleMethod, LevelArray, c_strides, create_level_array,
    fit_to_rank, for_each_index,
};
use crate::sample::{Sample, dispatch_sample};

/// Write a coarser copy of `source` as a new level.
///
/// Each output element reduces a window of `factors` source elements. Output extents are
/// `ceil(extent / factor)`, so windows on the trailing edge may be partial.
pub fn downsample<TStorage: ?Sized + ReadableStorageTraits + 'static>(
    source: &Array<TStorage>,
    store: &ReadableWritableListableStorage,
    label: &str,
    factors: &[u64],
    layout: &ChunkLayout,
    method: DownsampleMethod,
) -> crate::Result<LevelArray> {
    let factors: Vec<u64> = fit_to_rank(factors, source.dimensionality(), 1)
        .into_iter()
        .map(|f| f.max(1))
        .collect();
    let shape = source
        .shape()
        .iter()
        .zip(&factors)
        .map(|(s, f)| s.div_ceil(*f))
        .collect();
    let dest = create_level_array(
        store,
        label,
        shape,
        source.data_type().clone(),
        source.fill_value().clone(),
        layout,
    )?;
    dispatch_sample!(
        source.data_type(),
        downsample_blocks::<T, _>(source, &dest, &factors, &layout.processing_block, method)
    )?;
    dest.store_metadata()?;
    Ok(dest)
}

fn downsample_blocks<T: Sample, TStorage: ?Sized + ReadableStorageTraits + 'static>(
    source: &Array<TStorage>,
    dest: &LevelArray,
    factors: &[u64],
    block: &[u64],
    method: DownsampleMethod,
) -> crate::Result<()> {
    for out_ranges in BlockGrid::new(dest.shape(), block) {
        let source_ranges: Vec<Range<u64>> = out_ranges
            .iter()
            .zip(factors)
            .zip(source.shape())
            .map(|((r, f), s)| r.start * f..(r.end * f).min(*s))
            .collect();
        let values: Vec<T> =
            source.retrieve_array_subset(&ArraySubset::new_with_ranges(&source_ranges))?;
        let source_shape: Vec<u64> = source_ranges.iter().map(|r| r.end - r.start).collect();
        let out_shape: Vec<u64> = out_ranges.iter().map(|r| r.end - r.start).collect();
        let out = reduce_block(&values, &source_shape, &out_shape, factors, method);
        dest.store_array_subset(&ArraySubset::new_with_ranges(&out_ranges), &out)?;
    }
    Ok(())
}

/// Reduce a C-ordered block whose origin is aligned to the window grid.
pub(crate) fn reduce_block<T: Sample>(
    values: &[T],
    shape: &[u64],
    out_shape: &[u64],
    factors: &[u64],
    method: DownsampleMethod,
) -> Vec<T> {
    let strides = c_strides(shape);
    let mut out = Vec::with_capacity(out_shape.iter().product::<u64>() as usize);
    let mut window = Vec::with_capacity(factors.iter().product::<u64>() as usize);
    let mut window_shape = vec![0; shape.len()];
    for_each_index(out_shape, |out_index| {
        let origin: Vec<u64> = out_index.iter().zip(factors).map(|(i, f)| i * f).collect();
        for axis in 0..shape.len() {
            window_shape[axis] = factors[axis].min(shape[axis] - origin[axis]);
        }
        window.clear();
        for_each_index(&window_shape, |offset| {
            let index: u64 = origin
                .iter()
                .zip(offset)
                .zip(&strides)
                .map(|((o, w), s)| (o + w) * s)
                .sum();
            window.push(values[index as usize]);
        });
        out.push(reduce_window(&mut window, method));
    });
    out
}

fn compare<T: PartialOrd>(a: &T, b: &T) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

/// Reduce one non-empty window. The window may be reordered.
pub(crate) fn reduce_window<T: Sample>(window: &mut [T], method: DownsampleMethod) -> T {
    match method {
        DownsampleMethod::Stride => window[0],
        DownsampleMethod::Mean => {
            let sum: f64 = window.iter().map(|v| v.to_f64()).sum();
            T::from_f64(sum / window.len() as f64)
        }
        DownsampleMethod::Median => {
            window.sort_unstable_by(compare);
            window[(window.len() - 1) / 2]
        }
        DownsampleMethod::Mode => {
            window.sort_unstable_by(compare);
            let mut best = window[0];
            let mut best_count = 0;
            let mut run_start = 0;
            for i in 1..=window.len() {
                if i == window.len() || compare(&window[i], &window[run_start]) != Ordering::Equal {
                    if i - run_start > best_count {
                        best = window[run_start];
                        best_count = i - run_start;
                    }
                    run_start = i;
                }
            }
            best
        }
        DownsampleMethod::Min => window[1..]
            .iter()
            .fold(window[0], |acc, v| if compare(v, &acc) == Ordering::Less { *v } else { acc }),
        DownsampleMethod::Max => window[1..]
            .iter()
            .fold(window[0], |acc, v| if compare(v, &acc) == Ordering::Greater { *v } else { acc }),
    }
}
