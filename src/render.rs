//! Rendering 2D RGB previews from a multichannel pyramid.
//!
//! The coarsest level that still covers the requested size is read, one plane per channel.
//! Each channel is mapped through a black-to-color gradient, the channels are summed, and the
//! composite is normalised to the full 8-bit range.
use std::collections::BTreeMap;
use std::ops::Range;

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use zarrs::array::{Array, ArraySubset};
use zarrs::storage::{ReadableStorageTraits, ReadableWritableListableStorage};

use crate::config::RenderSettings;
use crate::metadata::tczyx;
use crate::proxy::NgffImage;
use crate::sample::{Sample, dispatch_sample};

/// Channels beyond this many are not rendered.
pub const MAX_CHANNELS: usize = 6;

/// Gradient end colors for multichannel images, by channel index.
pub const DEFAULT_COLORS: [[f64; 3]; MAX_CHANNELS] = [
    [1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 1.0],
    [0.0, 1.0, 1.0],
    [1.0, 0.0, 1.0],
    [1.0, 1.0, 0.0],
];

/// A region of a plane in relative coordinates, where 1.0 is the full width or height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox2DRel {
    pub x: f64,
    pub y: f64,
    pub xsize: f64,
    pub ysize: f64,
}

impl Default for BoundingBox2DRel {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            xsize: 1.0,
            ysize: 1.0,
        }
    }
}

impl BoundingBox2DRel {
    /// Pixel ranges (y, x) of this region in a plane of the given extent.
    pub fn pixel_ranges(&self, ydim: u64, xdim: u64) -> (Range<u64>, Range<u64>) {
        let to_pixels = |offset: f64, size: f64, extent: u64| {
            let lo = ((offset * extent as f64) as u64).min(extent);
            let hi = (((offset + size) * extent as f64) as u64).clamp(lo, extent);
            lo..hi
        };
        (
            to_pixels(self.y, self.ysize, ydim),
            to_pixels(self.x, self.xsize, xdim),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRenderingSettings {
    #[serde(default)]
    pub label: Option<String>,
    /// RGB color, in `[0, 1]`, that the channel's maximum maps to.
    pub colormap_end: [f64; 3],
    #[serde(default)]
    pub window_start: Option<f64>,
    #[serde(default)]
    pub window_end: Option<f64>,
}

impl ChannelRenderingSettings {
    pub fn new(colormap_end: [f64; 3]) -> Self {
        Self {
            label: None,
            colormap_end,
            window_start: None,
            window_end: None,
        }
    }

    pub fn with_window(mut self, start: f64, end: f64) -> Self {
        self.window_start = Some(start);
        self.window_end = Some(end);
        self
    }

    pub fn window(&self) -> Option<(f64, f64)> {
        self.window_start.zip(self.window_end)
    }
}

/// Which plane, region and channel mapping to render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderingView {
    /// Defaults to the image's default T, or the middle time point.
    pub t: Option<u64>,
    /// Defaults to the image's default Z scaled to the rendered level, or its middle plane.
    pub z: Option<u64>,
    pub region: BoundingBox2DRel,
    /// Empty means [`default_channel_settings`].
    pub channel_settings: BTreeMap<usize, ChannelRenderingSettings>,
}

/// White for a single channel, otherwise [`DEFAULT_COLORS`] for up to [`MAX_CHANNELS`].
pub fn default_channel_settings(n_channels: u64) -> BTreeMap<usize, ChannelRenderingSettings> {
    let n = (n_channels as usize).min(MAX_CHANNELS);
    if n == 1 {
        return BTreeMap::from([(0, ChannelRenderingSettings::new([1.0, 1.0, 1.0]))]);
    }
    DEFAULT_COLORS
        .iter()
        .take(n)
        .enumerate()
        .map(|(c, color)| (c, ChannelRenderingSettings::new(*color)))
        .collect()
}

/// Index of the coarsest level whose Y and X extents are at least the target size divided
/// by the region's relative size, or the finest level if none is.
pub fn select_level(
    level_shapes: &[Vec<u64>],
    (width, height): (u32, u32),
    region: &BoundingBox2DRel,
) -> crate::Result<usize> {
    let min_y = f64::from(height) / region.ysize;
    let min_x = f64::from(width) / region.xsize;
    for (index, shape) in level_shapes.iter().enumerate().rev() {
        let [_, _, _, y, x] = tczyx(shape)?;
        if y as f64 >= min_y && x as f64 >= min_x {
            return Ok(index);
        }
    }
    Ok(0)
}

fn read_plane<T: Sample, TStorage: ?Sized + ReadableStorageTraits + 'static>(
    array: &Array<TStorage>,
    [t, c, z]: [u64; 3],
    y: Range<u64>,
    x: Range<u64>,
) -> crate::Result<Vec<f64>> {
    let ranges = match array.dimensionality() {
        5 => vec![t..t + 1, c..c + 1, z..z + 1, y, x],
        3 => vec![z..z + 1, y, x],
        _ => {
            return Err(crate::Error::UnsupportedArrayShape {
                shape: array.shape().to_vec(),
            });
        }
    };
    let values: Vec<T> = array.retrieve_array_subset(&ArraySubset::new_with_ranges(&ranges))?;
    Ok(values.into_iter().map(Sample::to_f64).collect())
}

/// Map `[start, end]` linearly to `[0, 1]`, clipping values outside the window.
pub fn apply_window(values: &mut [f64], start: f64, end: f64) {
    let width = end - start;
    for v in values.iter_mut() {
        *v = if width > 0.0 {
            ((*v - start) / width).clamp(0.0, 1.0)
        } else if *v >= end {
            1.0
        } else {
            0.0
        };
    }
}

fn finite_range(values: &[f64]) -> Option<(f64, f64)> {
    values
        .iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Sum black-to-color gradients of each channel into interleaved RGB in `[0, 1]`.
///
/// A channel spans its gradient from its own minimum to its own maximum; a constant channel
/// contributes nothing.
pub fn composite(channels: &[(Vec<f64>, [f64; 3])], n_pixels: usize) -> Vec<f64> {
    let mut rgb = vec![0.0; n_pixels * 3];
    for (values, color) in channels {
        let Some((lo, hi)) = finite_range(values) else {
            continue;
        };
        if hi <= lo {
            continue;
        }
        for (pixel, v) in values.iter().enumerate().take(n_pixels) {
            let level = if v.is_finite() { (v - lo) / (hi - lo) } else { 0.0 };
            for band in 0..3 {
                rgb[pixel * 3 + band] += level * color[band];
            }
        }
    }
    for v in rgb.iter_mut() {
        *v = v.clamp(0.0, 1.0);
    }
    rgb
}

/// Stretch values so the minimum maps to 0 and the maximum to 255.
///
/// Constant input gives all zeros.
pub fn scale_to_uint8(values: &[f64]) -> Vec<u8> {
    match finite_range(values) {
        Some((lo, hi)) if hi > lo => values
            .iter()
            .map(|v| {
                if v.is_finite() {
                    (255.0 * (v - lo) / (hi - lo)) as u8
                } else {
                    0
                }
            })
            .collect(),
        _ => vec![0; values.len()],
    }
}

/// Render the composite of a view at the resolution of the selected level.
pub fn render_view(
    store: &ReadableWritableListableStorage,
    image: &NgffImage,
    view: &RenderingView,
    dims: (u32, u32),
) -> crate::Result<RgbImage> {
    let level = select_level(&image.level_shapes, dims, &view.region)?;
    let array = image.level(store, level)?;
    let [_, _, level_z, ydim, xdim] = tczyx(array.shape())?;
    let (default_t, default_z) = image.default_t_z();

    let t = view
        .t
        .or(default_t)
        .unwrap_or(image.size_t / 2)
        .min(image.size_t.saturating_sub(1));
    let z = view
        .z
        .or_else(|| default_z.map(|z| z * level_z / image.size_z.max(1)))
        .unwrap_or(level_z / 2)
        .min(level_z.saturating_sub(1));

    let (y, x) = view.region.pixel_ranges(ydim, xdim);
    let (height, width) = (y.end - y.start, x.end - x.start);
    if height == 0 || width == 0 {
        return Err(crate::Error::general(format!(
            "region {:?} selects no pixels of a {ydim}x{xdim} plane",
            view.region
        )));
    }

    let settings = if view.channel_settings.is_empty() {
        default_channel_settings(image.size_c)
    } else {
        view.channel_settings.clone()
    };
    let mut channels = Vec::new();
    for (c, setting) in settings
        .iter()
        .filter(|(c, _)| (**c as u64) < image.size_c)
        .take(MAX_CHANNELS)
    {
        let mut plane = dispatch_sample!(
            array.data_type(),
            read_plane::<T, _>(&array, [t, *c as u64, z], y.clone(), x.clone())
        )?;
        if let Some((start, end)) = setting.window() {
            apply_window(&mut plane, start, end);
        }
        channels.push((plane, setting.colormap_end));
    }
    log::debug!(
        "rendering {} channels at t={t} z={z} from level {}",
        channels.len(),
        image.path_keys[level]
    );

    let n_pixels = (height * width) as usize;
    let pixels = scale_to_uint8(&composite(&channels, n_pixels));
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| crate::Error::general("rendered buffer does not match its dimensions"))
}

/// Shrink to fit within `dims`, preserving aspect ratio. Smaller images are left as they are.
pub fn thumbnail(image: RgbImage, (width, height): (u32, u32)) -> RgbImage {
    if image.width() <= width && image.height() <= height {
        return image;
    }
    DynamicImage::ImageRgb8(image)
        .resize(width, height, FilterType::CatmullRom)
        .to_rgb8()
}

/// Stretch each band so its darkest value maps to 0 and its brightest to 255, ignoring the
/// brightest `cutoff_high` percent of pixels.
pub fn autocontrast(image: &mut RgbImage, cutoff_high: f64) {
    let n_pixels = u64::from(image.width()) * u64::from(image.height());
    let mut luts = [[0u8; 256]; 3];
    for (band, lut) in luts.iter_mut().enumerate() {
        let mut histogram = [0u64; 256];
        for pixel in image.pixels() {
            histogram[pixel[band] as usize] += 1;
        }
        let mut cut = (n_pixels as f64 * cutoff_high / 100.0) as u64;
        for count in histogram.iter_mut().rev() {
            if cut > *count {
                cut -= *count;
                *count = 0;
            } else {
                *count -= cut;
                break;
            }
        }
        let lo = histogram.iter().position(|&n| n != 0);
        let hi = histogram.iter().rposition(|&n| n != 0);
        match lo.zip(hi) {
            Some((lo, hi)) if hi > lo => {
                let span = (hi - lo) as f64;
                for (i, v) in lut.iter_mut().enumerate() {
                    *v = ((i as f64 - lo as f64) * 255.0 / span).clamp(0.0, 255.0) as u8;
                }
            }
            _ => {
                for (i, v) in lut.iter_mut().enumerate() {
                    *v = i as u8;
                }
            }
        }
    }
    for pixel in image.pixels_mut() {
        for band in 0..3 {
            pixel[band] = luts[band][pixel[band] as usize];
        }
    }
}

/// Center `image` on a canvas of exactly `dims`, filled with `fill`.
pub fn pad_to_target_dims(
    image: &RgbImage,
    (width, height): (u32, u32),
    fill: [u8; 3],
) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(width, height, Rgb(fill));
    let left = (i64::from(width) - i64::from(image.width())) / 2;
    let top = (i64::from(height) - i64::from(image.height())) / 2;
    imageops::overlay(&mut canvas, image, left, top);
    canvas
}

/// Render a view and finish it to exactly `dims`.
pub fn render_padded(
    store: &ReadableWritableListableStorage,
    image: &NgffImage,
    view: &RenderingView,
    dims: (u32, u32),
    settings: &RenderSettings,
) -> crate::Result<RgbImage> {
    let mut rendered = thumbnail(render_view(store, image, view, dims)?, dims);
    if settings.autocontrast {
        autocontrast(&mut rendered, 1.0);
    }
    Ok(pad_to_target_dims(&rendered, dims, settings.fill))
}

/// Render the default view of an image, finished to exactly `dims`.
pub fn render_thumbnail(
    store: &ReadableWritableListableStorage,
    image: &NgffImage,
    dims: (u32, u32),
    settings: &RenderSettings,
) -> crate::Result<RgbImage> {
    render_padded(store, image, &RenderingView::default(), dims, settings)
}
