//! A read-side view of an existing OME-NGFF image: sizes, levels and physical scaling.
use std::path::Path;

use serde::Serialize;
use zarrs::array::Array;
use zarrs::storage::ReadableWritableListableStorage;

use crate::metadata::{
    NgffMetadata, PhysicalSizes, ScaleFactors, read_group_metadata, scales_from_metadata, tczyx,
    voxel_to_physical_factors,
};
use crate::pyramid::{LevelArray, node_path};
use crate::storage::open_existing_store;

/// Properties of an OME-NGFF image, taken from its metadata and its base level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NgffImage {
    pub size_t: u64,
    pub size_c: u64,
    pub size_z: u64,
    pub size_y: u64,
    pub size_x: u64,
    #[serde(flatten)]
    pub scale_factors: ScaleFactors,
    /// Dataset paths, finest first.
    pub path_keys: Vec<String>,
    /// Shape of each dataset, in `path_keys` order.
    pub level_shapes: Vec<Vec<u64>>,
    #[serde(flatten)]
    pub physical_sizes: PhysicalSizes,
    #[serde(skip)]
    pub metadata: NgffMetadata,
}

impl NgffImage {
    /// Read an image from the root group of `store`.
    ///
    /// Only 3D (`z, y, x`) and 5D (`t, c, z, y, x`) levels are supported.
    pub fn open(
        store: &ReadableWritableListableStorage,
        ignore_unit_errors: bool,
    ) -> crate::Result<Self> {
        let metadata = read_group_metadata(store, "/")?;
        let path_keys: Vec<String> = metadata
            .multiscales
            .first()
            .map(|m| m.datasets.iter().map(|d| d.path.clone()).collect())
            .unwrap_or_default();
        if path_keys.is_empty() {
            return Err(crate::Error::general("image metadata lists no datasets"));
        }
        let level_shapes = path_keys
            .iter()
            .map(|key| Ok(Array::open(store.clone(), &node_path(key))?.shape().to_vec()))
            .collect::<crate::Result<Vec<_>>>()?;
        let [size_t, size_c, size_z, size_y, size_x] = tczyx(&level_shapes[0])?;

        Ok(Self {
            size_t,
            size_c,
            size_z,
            size_y,
            size_x,
            scale_factors: scales_from_metadata(&metadata)?,
            physical_sizes: voxel_to_physical_factors(&metadata, ignore_unit_errors)?,
            path_keys,
            level_shapes,
            metadata,
        })
    }

    pub fn open_path(path: &Path, ignore_unit_errors: bool) -> crate::Result<Self> {
        Self::open(&open_existing_store(path)?, ignore_unit_errors)
    }

    pub fn n_levels(&self) -> usize {
        self.path_keys.len()
    }

    /// Open the array of one level.
    pub fn level(
        &self,
        store: &ReadableWritableListableStorage,
        index: usize,
    ) -> crate::Result<LevelArray> {
        let key = self.path_keys.get(index).ok_or_else(|| {
            crate::Error::general(format!(
                "level {index} out of range for {} levels",
                self.path_keys.len()
            ))
        })?;
        Ok(Array::open(store.clone(), &node_path(key))?)
    }

    /// Default T and Z from the display block, if present.
    pub fn default_t_z(&self) -> (Option<u64>, Option<u64>) {
        self.metadata
            .omero
            .as_ref()
            .map_or((None, None), |o| (o.rdefs.default_t, o.rdefs.default_z))
    }
}
