use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use tempfile::TempDir;
use zarrs::array::{Array, ArrayBuilder, data_type};
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::ReadableWritableListableStorage;
use zarrs_ngff::config::PyramidSettings;
use zarrs_ngff::pyramid::{
    ChunkLayout, DownsampleMethod, LevelArray, PyramidBuilder, downsample, level_is_complete,
    node_path, rechunk, transpose_levels,
};

fn temp_store() -> (TempDir, ReadableWritableListableStorage) {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir().expect("create temp dir");
    let store: ReadableWritableListableStorage =
        Arc::new(FilesystemStore::new(dir.path()).expect("create store"));
    (dir, store)
}

/// Write a uint16 array with distinct values at `path`.
fn write_array(
    store: &ReadableWritableListableStorage,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
) -> (LevelArray, Vec<u16>) {
    let n = shape.iter().product::<u64>() as usize;
    let values: Vec<u16> = (0..n).map(|i| (i * 7 % 1009) as u16).collect();
    let array = ArrayBuilder::new(shape, chunks, data_type::uint16(), 0u16)
        .build(store.clone(), path)
        .expect("build array");
    array.store_metadata().expect("store metadata");
    array
        .store_array_subset(&array.subset_all(), &values)
        .expect("store values");
    (array, values)
}

fn read_all(store: &ReadableWritableListableStorage, label: &str) -> (Vec<u64>, Vec<u16>) {
    let array = Array::open(store.clone(), &node_path(label)).expect("open level");
    let values: Vec<u16> = array
        .retrieve_array_subset(&array.subset_all())
        .expect("read level");
    (array.shape().to_vec(), values)
}

fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .expect("metadata modification time")
}

fn small_settings() -> PyramidSettings {
    PyramidSettings {
        target_chunks: vec![1, 1, 4, 4, 4],
        downsample_factors: vec![1, 1, 2, 2, 2],
        n_levels: 3,
        processing_block: vec![1, 1, 3, 5, 5],
        downsample_method: DownsampleMethod::Mean,
        compression_level: None,
        ..Default::default()
    }
}

#[test]
fn test_rechunk_round_trip() {
    let (_dir, store) = temp_store();
    let (source, values) = write_array(&store, "/source", vec![2, 1, 5, 9, 7], vec![1, 1, 2, 3, 3]);

    let there = ChunkLayout::new(vec![1, 1, 4, 4, 4], vec![1, 1, 3, 4, 2]);
    let rechunked = rechunk(&source, &store, "there", &there).expect("rechunk");
    let back = ChunkLayout::new(vec![1, 1, 2, 3, 3], vec![2, 1, 8, 8, 8])
        .with_compression_level(Some(3));
    rechunk(&rechunked, &store, "back", &back).expect("rechunk back");

    assert_eq!(read_all(&store, "there"), (vec![2, 1, 5, 9, 7], values.clone()));
    assert_eq!(read_all(&store, "back"), (vec![2, 1, 5, 9, 7], values));
}

#[test]
fn test_downsample_partial_windows() {
    let (_dir, store) = temp_store();
    let (source, _) = write_array(&store, "/source", vec![3, 3], vec![2, 2]);
    let layout = ChunkLayout::new(vec![2, 2], vec![1, 1]);
    downsample(&source, &store, "max", &[2, 2], &layout, DownsampleMethod::Max)
        .expect("downsample");

    // values are i * 7 for i in 0..9
    let (shape, values) = read_all(&store, "max");
    assert_eq!(shape, vec![2, 2]);
    assert_eq!(values, vec![28, 35, 49, 56]);
}

#[test]
fn test_build_levels() {
    let (_dir, store) = temp_store();
    let (base, _) = write_array(&store, "/base", vec![1, 2, 5, 9, 8], vec![1, 1, 5, 5, 5]);

    let report = PyramidBuilder::new(small_settings())
        .build(&base, &store)
        .expect("build pyramid");
    assert_eq!(report.levels, vec!["0", "1", "2"]);
    assert_eq!(report.built, report.levels);
    assert!(report.skipped.is_empty());

    assert!(level_is_complete(&store, "1", &[1, 2, 3, 5, 4]));
    assert!(level_is_complete(&store, "2", &[1, 2, 2, 3, 2]));
    assert!(!level_is_complete(&store, "2", &[1, 2, 2, 3, 3]));
}

#[test]
fn test_resume_skips_complete_levels() {
    let (dir, store) = temp_store();
    let (base, _) = write_array(&store, "/base", vec![1, 1, 4, 8, 8], vec![1, 1, 4, 4, 4]);
    let builder = PyramidBuilder::new(small_settings());
    builder.build(&base, &store).expect("first build");

    let level_1_metadata = dir.path().join("1").join("zarr.json");
    let before = modified(&level_1_metadata);
    std::fs::remove_dir_all(dir.path().join("2")).expect("remove level 2");

    let report = builder.build(&base, &store).expect("second build");
    assert_eq!(report.skipped, vec!["0", "1"]);
    assert_eq!(report.built, vec!["2"]);
    assert_eq!(modified(&level_1_metadata), before);
    assert!(level_is_complete(&store, "2", &[1, 1, 1, 2, 2]));
}

#[test]
fn test_partial_level_is_rebuilt() {
    let (dir, store) = temp_store();
    let (base, _) = write_array(&store, "/base", vec![1, 1, 4, 8, 8], vec![1, 1, 4, 4, 4]);
    let builder = PyramidBuilder::new(small_settings());
    builder.build(&base, &store).expect("first build");
    let (_, expected) = read_all(&store, "2");

    // a crash after writing chunks but before metadata
    std::fs::remove_file(dir.path().join("2").join("zarr.json")).expect("drop level metadata");

    let report = builder.build(&base, &store).expect("resume");
    assert_eq!(report.built, vec!["2"]);
    assert_eq!(read_all(&store, "2").1, expected);
}

#[test]
fn test_transpose_t_z() {
    let (_dir, store) = temp_store();
    let (_, values) = write_array(&store, "/0", vec![2, 1, 3, 2, 2], vec![1, 1, 2, 2, 2]);
    let (_out_dir, out) = temp_store();

    let layout = ChunkLayout::new(vec![1, 1, 2, 2, 2], vec![1, 1, 2, 1, 2]);
    transpose_levels(&store, &out, &["0".to_string()], (0, 2), &layout).expect("transpose");

    let (shape, transposed) = read_all(&out, "0");
    assert_eq!(shape, vec![3, 1, 2, 2, 2]);
    // element (t, 0, z, y, x) moves to (z, 0, t, y, x)
    for t in 0..2 {
        for z in 0..3 {
            for yx in 0..4 {
                assert_eq!(transposed[(z * 2 + t) * 4 + yx], values[(t * 3 + z) * 4 + yx]);
            }
        }
    }
}
