use std::sync::Arc;

use tempfile::TempDir;
use zarrs::array::{ArrayBuilder, data_type};
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::ReadableWritableListableStorage;
use zarrs_ngff::metadata::{
    AxisKind, CoordinateTransformation, NGFF_VERSION, NgffMetadata, base_scales_in_meters,
    create_ome_zarr_metadata, dimension_ratios, generate_axes, generate_datasets,
    read_group_metadata, write_group_metadata,
};
use zarrs_ngff::proxy::NgffImage;

fn temp_store() -> (TempDir, ReadableWritableListableStorage) {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir().expect("create temp dir");
    let store: ReadableWritableListableStorage =
        Arc::new(FilesystemStore::new(dir.path()).expect("create store"));
    (dir, store)
}

/// Write a level filled by `value(index)`.
fn write_level(
    store: &ReadableWritableListableStorage,
    label: &str,
    shape: Vec<u64>,
    value: impl Fn(usize) -> u8,
) {
    let n = shape.iter().product::<u64>() as usize;
    let values: Vec<u8> = (0..n).map(value).collect();
    let chunks = shape.clone();
    let array = ArrayBuilder::new(shape, chunks, data_type::uint8(), 0u8)
        .build(store.clone(), &format!("/{label}"))
        .expect("build level");
    array.store_metadata().expect("store metadata");
    array
        .store_array_subset(&array.subset_all(), &values)
        .expect("store values");
}

fn labels(n: usize) -> Vec<String> {
    (0..n).map(|i| i.to_string()).collect()
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= expected.abs() * 1e-12,
        "{actual} != {expected}"
    );
}

#[test]
fn test_ratio_for_halved_last_axis() {
    let ratios =
        dimension_ratios(&[vec![1, 1, 1, 1, 1024], vec![1, 1, 1, 1, 512]]).expect("ratios");
    assert_eq!(ratios[0], vec![1.0; 5]);
    assert_eq!(ratios[1], vec![1.0, 1.0, 1.0, 1.0, 0.5]);

    let datasets = generate_datasets(&[1.0, 1.0, 1.0, 1.0, 2e-7], &ratios, &labels(2));
    assert_eq!(
        datasets[1].coordinate_transformations,
        vec![CoordinateTransformation::Scale {
            scale: vec![1.0, 1.0, 1.0, 1.0, 4e-7]
        }]
    );
}

#[test]
fn test_ratios_sorted_largest_first() {
    let ratios = dimension_ratios(&[vec![2, 4], vec![4, 8], vec![1, 2]]).expect("ratios");
    assert_eq!(ratios, vec![vec![1.0, 1.0], vec![0.5, 0.5], vec![0.25, 0.25]]);
}

#[test]
fn test_canonical_axes() {
    let axes = generate_axes("tczyx").expect("axes");
    let names: Vec<_> = axes.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["t", "c", "z", "y", "x"]);
    assert_eq!(axes[0].kind, Some(AxisKind::Time));
    assert_eq!(axes[1].kind, Some(AxisKind::Channel));
    assert_eq!(axes[1].unit, None);
    assert!(axes[2..].iter().all(|a| a.kind == Some(AxisKind::Space)
        && a.unit.as_deref() == Some("meter")));
    assert!(generate_axes("tq").is_err());
}

#[test]
fn test_metadata_for_pyramid() {
    let (_dir, store) = temp_store();
    write_level(&store, "0", vec![3, 2, 5, 8, 8], |i| (i % 200) as u8);
    write_level(&store, "1", vec![3, 2, 3, 4, 4], |i| {
        if i < 48 { 10 + (i % 5) as u8 } else { 100 }
    });

    let base_scales = [1.0, 1.0, 2e-8, 1e-8, 1e-8];
    let metadata = create_ome_zarr_metadata(&store, &labels(2), "cells", &base_scales)
        .expect("create metadata");
    write_group_metadata(&store, &metadata).expect("write metadata");
    let read = read_group_metadata(&store, "/").expect("read metadata");
    assert_eq!(read.version.as_deref(), Some(NGFF_VERSION));
    assert_eq!(read.omero, metadata.omero);
    assert_eq!(read.multiscales[0].axes, metadata.multiscales[0].axes);

    let multiscale = &metadata.multiscales[0];
    assert_eq!(multiscale.name.as_deref(), Some("cells"));
    let scales: Vec<_> = multiscale
        .datasets
        .iter()
        .map(|d| d.scale().expect("scale").to_vec())
        .collect();
    assert_eq!(scales[0], vec![1.0, 1.0, 2e-8, 1e-8, 1e-8]);
    assert_eq!(scales[1], vec![1.0, 1.0, 3.33e-8, 2e-8, 2e-8]);

    let omero = read.omero.as_ref().expect("omero block");
    assert_eq!(omero.rdefs.default_t, Some(1));
    assert_eq!(omero.rdefs.default_z, Some(2));
    assert_eq!(omero.channels.len(), 2);
    assert_eq!(omero.channels[0].color, "FF0000");
    assert_eq!(omero.channels[1].color, "00FF00");
    // the coarsest level decides the window: channel 0 spans 10..=14 at t=0 and 100 later
    assert_eq!(omero.channels[0].window.start, 10.0);
    assert_eq!(omero.channels[0].window.end, 100.0);
    assert_eq!(omero.channels[0].window.max, 255.0);
}

#[test]
fn test_proxy_reads_written_pyramid() {
    let (dir, store) = temp_store();
    write_level(&store, "0", vec![1, 1, 4, 16, 12], |i| i as u8);
    write_level(&store, "1", vec![1, 1, 2, 8, 6], |i| i as u8);
    let base_scales = [1.0, 1.0, 2e-6, 5e-7, 5e-7];
    let metadata = create_ome_zarr_metadata(&store, &labels(2), "proxy", &base_scales)
        .expect("create metadata");
    write_group_metadata(&store, &metadata).expect("write metadata");

    let image = NgffImage::open_path(dir.path(), false).expect("open image");
    assert_eq!(
        (image.size_t, image.size_c, image.size_z, image.size_y, image.size_x),
        (1, 1, 4, 16, 12)
    );
    assert_eq!(image.path_keys, labels(2));
    assert_eq!(image.scale_factors.n_scales, 2);
    assert_close(image.scale_factors.xy_scaling, 2.0);
    assert_close(image.scale_factors.z_scaling, 2.0);
    assert_close(image.physical_sizes.x.expect("x size"), 5e-7);
    assert_close(image.physical_sizes.z.expect("z size"), 2e-6);
    assert_eq!(image.default_t_z(), (Some(0), Some(2)));
}

#[test]
fn test_three_dimensional_levels() {
    let (_dir, store) = temp_store();
    write_level(&store, "0", vec![4, 6, 6], |i| i as u8);
    let metadata = create_ome_zarr_metadata(&store, &labels(1), "3d", &[1.0, 1.0, 3e-6, 1e-6, 1e-6])
        .expect("create metadata");
    let multiscale = &metadata.multiscales[0];
    assert_eq!(multiscale.axes.len(), 3);
    assert_eq!(multiscale.datasets[0].scale(), Some(&[3e-6, 1e-6, 1e-6][..]));
    let omero = metadata.omero.expect("omero block");
    assert_eq!(omero.channels.len(), 1);
    assert_eq!(omero.channels[0].color, "FFFFFF");
    assert_eq!(omero.rdefs.default_z, Some(2));
}

#[test]
fn test_parse_v04_attributes() {
    let attributes = serde_json::json!({
        "multiscales": [{
            "version": "0.4",
            "axes": [
                {"name": "t", "type": "time"},
                {"name": "c", "type": "channel"},
                {"name": "z", "type": "space", "unit": "micrometer"},
                {"name": "y", "type": "space", "unit": "micrometer"},
                {"name": "x", "type": "space", "unit": "micrometer"}
            ],
            "datasets": [
                {
                    "path": "0",
                    "coordinateTransformations": [
                        {"type": "scale", "scale": [1.0, 1.0, 0.5, 0.25, 0.25]}
                    ]
                }
            ]
        }]
    });
    let metadata = NgffMetadata::from_attributes(attributes.as_object().expect("object"))
        .expect("parse metadata");
    let scales = base_scales_in_meters(&metadata).expect("scales");
    for (actual, expected) in scales.iter().zip([1.0, 1.0, 0.5e-6, 0.25e-6, 0.25e-6]) {
        assert_close(*actual, expected);
    }
}
