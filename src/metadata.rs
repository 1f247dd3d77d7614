//! OME-NGFF multiscale metadata: types, synthesis for new pyramids and interpretation of
//! existing ones.
use serde::{Deserialize, Serialize};
use zarrs::array::Array;
use zarrs::group::{Group, GroupMetadata, GroupMetadataV3};
use zarrs::storage::{ReadableStorageTraits, ReadableWritableListableStorage};

use crate::pyramid::node_path;
use crate::sample::{Sample, dispatch_sample};

/// NGFF version written by this crate.
pub const NGFF_VERSION: &str = "0.5";

/// Canonical axis order of written pyramids.
pub const CANONICAL_AXIS_ORDER: &str = "tczyx";

/// Significant figures kept in generated scales.
const SCALE_SIGFIGS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisKind {
    Time,
    Channel,
    Space,
    #[serde(other)]
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AxisKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Axis {
    pub fn new(name: impl Into<String>, kind: AxisKind, unit: Option<&str>) -> Self {
        Self {
            name: name.into(),
            kind: Some(kind),
            unit: unit.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum CoordinateTransformation {
    Identity,
    Scale { scale: Vec<f64> },
    Translation { translation: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub path: String,
    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

impl Dataset {
    /// The first scale transform, if any.
    pub fn scale(&self) -> Option<&[f64]> {
        self.coordinate_transformations.iter().find_map(|ct| match ct {
            CoordinateTransformation::Scale { scale } => Some(scale.as_slice()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multiscale {
    /// Present in NGFF 0.4; in 0.5 the version lives on the enclosing block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub axes: Vec<Axis>,
    /// Finest first.
    pub datasets: Vec<Dataset>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub downscaling_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub min: f64,
    pub max: f64,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Hex RGB without a leading `#`.
    pub color: String,
    #[serde(default = "default_coefficient")]
    pub coefficient: f64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub label: String,
    pub window: Window,
    #[serde(default = "default_family")]
    pub family: String,
    #[serde(default)]
    pub inverted: bool,
}

fn default_coefficient() -> f64 {
    1.0
}

fn default_active() -> bool {
    true
}

fn default_family() -> String {
    "linear".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RDefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_t: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_z: Option<u64>,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    "color".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Omero {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub channels: Vec<Channel>,
    pub rdefs: RDefs,
}

/// The NGFF block of an image group's attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NgffMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub multiscales: Vec<Multiscale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omero: Option<Omero>,
}

impl NgffMetadata {
    /// Parse group attributes holding NGFF 0.5 (nested under `"ome"`) or 0.4 (top-level)
    /// metadata.
    pub fn from_attributes(
        attributes: &serde_json::Map<String, serde_json::Value>,
    ) -> crate::Result<Self> {
        let value = match attributes.get("ome") {
            Some(ome) => ome.clone(),
            None => serde_json::Value::Object(attributes.clone()),
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Group attributes in NGFF 0.5 layout.
    pub fn to_attributes(&self) -> crate::Result<serde_json::Map<String, serde_json::Value>> {
        let mut attributes = serde_json::Map::new();
        attributes.insert("ome".into(), serde_json::to_value(self)?);
        Ok(attributes)
    }

    fn first_multiscale(&self) -> crate::Result<&Multiscale> {
        self.multiscales
            .first()
            .ok_or_else(|| crate::Error::general("metadata has no multiscales"))
    }

    /// The scale vector of the finest dataset of the first multiscale.
    pub fn base_scale(&self) -> crate::Result<&[f64]> {
        self.first_multiscale()?
            .datasets
            .first()
            .and_then(Dataset::scale)
            .ok_or_else(|| crate::Error::general("base dataset has no scale transform"))
    }
}

/// Ratios of each level's shape to the largest level's.
///
/// Levels are ordered by their last dimension, largest first; the first entry is all ones.
pub fn dimension_ratios(shapes: &[Vec<u64>]) -> crate::Result<Vec<Vec<f64>>> {
    let Some(first) = shapes.first() else {
        return Ok(vec![]);
    };
    if shapes.iter().any(|s| s.len() != first.len()) {
        return Err(crate::Error::RankMismatch {
            ranks: shapes.iter().map(Vec::len).collect(),
        });
    }
    let mut sorted: Vec<&Vec<u64>> = shapes.iter().collect();
    sorted.sort_by_key(|s| std::cmp::Reverse(s.last().copied().unwrap_or(0)));
    let reference = sorted[0];
    Ok(sorted
        .iter()
        .map(|shape| {
            shape
                .iter()
                .zip(reference)
                .map(|(d, r)| *d as f64 / *r as f64)
                .collect()
        })
        .collect())
}

/// Round to a number of significant figures. Zero stays zero.
pub fn round_to_sigfigs(x: f64, sigfigs: usize) -> f64 {
    if x == 0.0 || !x.is_finite() {
        return x;
    }
    let precision = sigfigs.max(1) - 1;
    format!("{x:.precision$e}").parse().unwrap_or(x)
}

/// One dataset per level, whose scale is the base scale divided by the level's ratio.
pub fn generate_datasets(
    base_scales: &[f64],
    ratios: &[Vec<f64>],
    labels: &[String],
) -> Vec<Dataset> {
    labels
        .iter()
        .zip(ratios)
        .map(|(label, ratio)| Dataset {
            path: label.clone(),
            coordinate_transformations: vec![CoordinateTransformation::Scale {
                scale: base_scales
                    .iter()
                    .zip(ratio)
                    .map(|(s, r)| round_to_sigfigs(s / r, SCALE_SIGFIGS))
                    .collect(),
            }],
        })
        .collect()
}

/// Axes for an order such as `"tczyx"`; spatial axes are in meters.
pub fn generate_axes(order: &str) -> crate::Result<Vec<Axis>> {
    order
        .chars()
        .map(|name| match name {
            't' => Ok(Axis::new("t", AxisKind::Time, None)),
            'c' => Ok(Axis::new("c", AxisKind::Channel, None)),
            'z' | 'y' | 'x' => Ok(Axis::new(name.to_string(), AxisKind::Space, Some("meter"))),
            other => Err(crate::Error::general(format!("unknown axis {other:?}"))),
        })
        .collect()
}

/// Default channel colors: white for a single channel, otherwise primaries then secondaries.
pub fn default_channel_colors(n_channels: usize) -> Vec<&'static str> {
    const PALETTE: [&str; 6] = ["FF0000", "00FF00", "0000FF", "00FFFF", "FF00FF", "FFFF00"];
    if n_channels == 1 {
        return vec!["FFFFFF"];
    }
    PALETTE.iter().copied().cycle().take(n_channels).collect()
}

/// Shape interpreted as (t, c, z, y, x).
pub(crate) fn tczyx(shape: &[u64]) -> crate::Result<[u64; 5]> {
    match *shape {
        [t, c, z, y, x] => Ok([t, c, z, y, x]),
        [z, y, x] => Ok([1, 1, z, y, x]),
        _ => Err(crate::Error::UnsupportedArrayShape {
            shape: shape.to_vec(),
        }),
    }
}

fn channel_extrema<T: Sample, TStorage: ?Sized + ReadableStorageTraits + 'static>(
    array: &Array<TStorage>,
) -> crate::Result<Vec<(f64, f64)>> {
    let [_, n_channels, z, y, x] = tczyx(array.shape())?;
    let values: Vec<T> = array.retrieve_array_subset(&array.subset_all())?;
    let plane = (z * y * x).max(1) as usize;
    let mut extrema = vec![(f64::INFINITY, f64::NEG_INFINITY); n_channels as usize];
    for (i, value) in values.iter().enumerate() {
        let channel = (i / plane) % n_channels as usize;
        let v = value.to_f64();
        let (lo, hi) = &mut extrema[channel];
        *lo = lo.min(v);
        *hi = hi.max(v);
    }
    Ok(extrema
        .into_iter()
        .map(|(lo, hi)| if lo > hi { (0.0, 0.0) } else { (lo, hi) })
        .collect())
}

/// Display defaults: per-channel windows spanning the values of the coarsest level and
/// default T/Z at the middle of the base level.
pub fn create_omero(
    store: &ReadableWritableListableStorage,
    labels: &[String],
) -> crate::Result<Omero> {
    let (Some(finest), Some(coarsest)) = (labels.first(), labels.last()) else {
        return Err(crate::Error::general("pyramid has no levels"));
    };
    let base = Array::open(store.clone(), &node_path(finest))?;
    let [t, _, z, _, _] = tczyx(base.shape())?;

    let smallest = Array::open(store.clone(), &node_path(coarsest))?;
    let extrema = dispatch_sample!(smallest.data_type(), channel_extrema::<T, _>(&smallest))?;
    let colors = default_channel_colors(extrema.len());
    let channels = extrema
        .iter()
        .zip(colors)
        .enumerate()
        .map(|(i, ((lo, hi), color))| Channel {
            color: color.to_string(),
            coefficient: 1.0,
            active: true,
            label: format!("Channel {i}"),
            window: Window {
                min: 0.0,
                max: 255.0,
                start: *lo,
                end: *hi,
            },
            family: default_family(),
            inverted: false,
        })
        .collect::<Vec<_>>();

    Ok(Omero {
        name: None,
        rdefs: RDefs {
            default_t: Some(t / 2),
            default_z: Some(z / 2),
            model: if channels.len() == 1 { "greyscale" } else { "color" }.into(),
        },
        channels,
    })
}

/// Metadata describing the levels `labels` of the pyramid in `store`.
pub fn create_ome_zarr_metadata(
    store: &ReadableWritableListableStorage,
    labels: &[String],
    name: &str,
    base_scales: &[f64],
) -> crate::Result<NgffMetadata> {
    let shapes = labels
        .iter()
        .map(|label| Ok(Array::open(store.clone(), &node_path(label))?.shape().to_vec()))
        .collect::<crate::Result<Vec<_>>>()?;
    let ratios = dimension_ratios(&shapes)?;
    let rank = shapes.first().map_or(0, Vec::len);
    let order = &CANONICAL_AXIS_ORDER[CANONICAL_AXIS_ORDER.len().saturating_sub(rank)..];
    let base_scales = fit_scales_to_rank(base_scales, rank);

    let multiscale = Multiscale {
        version: None,
        name: Some(name.to_string()),
        axes: generate_axes(order)?,
        datasets: generate_datasets(&base_scales, &ratios, labels),
        downscaling_type: None,
        metadata: Some(serde_json::json!({
            "method": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    };
    Ok(NgffMetadata {
        version: Some(NGFF_VERSION.into()),
        multiscales: vec![multiscale],
        omero: Some(create_omero(store, labels)?),
    })
}

fn fit_scales_to_rank(scales: &[f64], rank: usize) -> Vec<f64> {
    if scales.len() >= rank {
        scales[scales.len() - rank..].to_vec()
    } else {
        std::iter::repeat_n(1.0, rank - scales.len())
            .chain(scales.iter().copied())
            .collect()
    }
}

/// Write the root group of a pyramid with its NGFF attributes.
pub fn write_group_metadata(
    store: &ReadableWritableListableStorage,
    metadata: &NgffMetadata,
) -> crate::Result<()> {
    let group_metadata = GroupMetadataV3::default().with_attributes(metadata.to_attributes()?);
    let group = Group::new_with_metadata(store.clone(), "/", GroupMetadata::V3(group_metadata))?;
    group.store_metadata()?;
    Ok(())
}

/// Read the NGFF block from the group at `path` of `store`.
pub fn read_group_metadata<TStorage: ?Sized + ReadableStorageTraits + 'static>(
    store: &std::sync::Arc<TStorage>,
    path: &str,
) -> crate::Result<NgffMetadata> {
    let group = Group::open(store.clone(), &node_path(path))?;
    NgffMetadata::from_attributes(group.attributes())
}

/// Meters per unit. A missing unit is taken as meters.
pub fn unit_multiplier(unit: Option<&str>) -> Option<f64> {
    match unit {
        None | Some("meter") => Some(1.0),
        Some("micrometer") => Some(1e-6),
        Some("nanometer") => Some(1e-9),
        Some("angstrom") => Some(1e-10),
        Some("femtometer") => Some(1e-15),
        Some(_) => None,
    }
}

/// Size of one voxel in meters along each spatial axis of the base level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhysicalSizes {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

/// Convert the base scale of each spatial axis to meters.
///
/// Unknown units fail with [`crate::Error::UnknownUnit`] unless `ignore_unit_errors`,
/// in which case that axis is left out.
pub fn voxel_to_physical_factors(
    metadata: &NgffMetadata,
    ignore_unit_errors: bool,
) -> crate::Result<PhysicalSizes> {
    let multiscale = metadata.first_multiscale()?;
    let scale = metadata.base_scale()?;
    let mut sizes = PhysicalSizes::default();
    for (value, axis) in scale.iter().zip(&multiscale.axes) {
        if axis.kind != Some(AxisKind::Space) {
            continue;
        }
        let Some(multiplier) = unit_multiplier(axis.unit.as_deref()) else {
            if ignore_unit_errors {
                continue;
            }
            return Err(crate::Error::UnknownUnit {
                axis: axis.name.clone(),
                unit: axis.unit.clone().unwrap_or_default(),
            });
        };
        let size = Some(value * multiplier);
        match axis.name.as_str() {
            "x" => sizes.x = size,
            "y" => sizes.y = size,
            "z" => sizes.z = size,
            _ => {}
        }
    }
    Ok(sizes)
}

/// The base scale vector with spatial entries converted to meters.
pub fn base_scales_in_meters(metadata: &NgffMetadata) -> crate::Result<Vec<f64>> {
    let multiscale = metadata.first_multiscale()?;
    metadata
        .base_scale()?
        .iter()
        .zip(&multiscale.axes)
        .map(|(value, axis)| {
            if axis.kind != Some(AxisKind::Space) {
                return Ok(*value);
            }
            unit_multiplier(axis.unit.as_deref())
                .map(|m| value * m)
                .ok_or_else(|| crate::Error::UnknownUnit {
                    axis: axis.name.clone(),
                    unit: axis.unit.clone().unwrap_or_default(),
                })
        })
        .collect()
}

/// Scaling between the first two levels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaleFactors {
    pub n_scales: usize,
    pub xy_scaling: f64,
    pub z_scaling: f64,
}

pub fn scales_from_metadata(metadata: &NgffMetadata) -> crate::Result<ScaleFactors> {
    let datasets = &metadata.first_multiscale()?.datasets;
    let mut factors = ScaleFactors {
        n_scales: datasets.len(),
        xy_scaling: 1.0,
        z_scaling: 1.0,
    };
    if datasets.len() < 2 {
        return Ok(factors);
    }
    let scale_of = |dataset: &Dataset| -> crate::Result<[f64; 3]> {
        match dataset.scale() {
            Some([.., z, y, x]) => Ok([*z, *y, *x]),
            _ => Err(crate::Error::general(format!(
                "dataset {} has no z, y, x scale",
                dataset.path
            ))),
        }
    };
    let [z0, y0, x0] = scale_of(&datasets[0])?;
    let [z1, y1, x1] = scale_of(&datasets[1])?;
    let (x_scaling, y_scaling) = (x1 / x0, y1 / y0);
    if x_scaling != y_scaling {
        return Err(crate::Error::general(format!(
            "x scaling {x_scaling} differs from y scaling {y_scaling}"
        )));
    }
    factors.xy_scaling = x_scaling;
    factors.z_scaling = z1 / z0;
    Ok(factors)
}

/// Shape and chunk shape of one level of a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelInfo {
    pub path: String,
    pub shape: Vec<u64>,
    pub chunk_shape: Option<Vec<u64>>,
    pub data_type: String,
}

/// Describe the arrays `labels` of a group.
pub fn group_info<TStorage: ?Sized + ReadableStorageTraits + 'static>(
    store: &std::sync::Arc<TStorage>,
    labels: &[String],
) -> crate::Result<Vec<LevelInfo>> {
    labels
        .iter()
        .map(|label| {
            let array = Array::open(store.clone(), &node_path(label))?;
            let chunk_shape = array
                .chunk_shape(&vec![0; array.dimensionality()])
                .ok()
                .map(|shape| shape.iter().map(|n| n.get()).collect());
            Ok(LevelInfo {
                path: label.clone(),
                shape: array.shape().to_vec(),
                chunk_shape,
                data_type: crate::sample::data_type_name(array.data_type()),
            })
        })
        .collect()
}
