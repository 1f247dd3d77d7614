use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;
use zarrs::array::{Array, ArrayBuilder, data_type};
use zarrs_ngff::Error;
use zarrs_ngff::archive::{ArchiveStore, MemoryArchive};
use zarrs_ngff::config::{
    ConversionOptions, ImageToConvert, PyramidSettings, RenderSettings, Settings,
};
use zarrs_ngff::convert::{ExternalConverter, Pipeline};
use zarrs_ngff::model::{FileReference, Image, ImageRepresentation, RepresentationKind, Study};
use zarrs_ngff::pyramid::{DownsampleMethod, LevelArray};
use zarrs_ngff::storage::{LocalObjectStorage, ObjectStorage, open_filesystem_store};

const STUDY_ID: &str = "study-1";
const BASE_URI: &str = "https://bucket.test";

/// Writes a `(1, 2, 2, 16, 16)` base array where a real converter would write its output.
#[derive(Default)]
struct FakeConverter {
    calls: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl FakeConverter {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ExternalConverter for FakeConverter {
    fn convert(&self, input: &Path, destination: &Path) -> zarrs_ngff::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let contents = std::fs::read_to_string(input)?;
        self.inputs.lock().expect("inputs lock").push(contents);

        let array = create_base(destination)?;
        array.store_array_subset(&array.subset_all(), &base_values())?;
        Ok(())
    }
}

/// Dies after writing the base array's metadata but before any of its chunks.
struct CrashingConverter;

impl ExternalConverter for CrashingConverter {
    fn convert(&self, _input: &Path, destination: &Path) -> zarrs_ngff::Result<()> {
        create_base(destination)?;
        Err(Error::general("converter killed"))
    }
}

fn base_values() -> Vec<u8> {
    (0..1024).map(|i| (i % 251) as u8).collect()
}

/// Create the base array of a converter output and store its metadata.
fn create_base(destination: &Path) -> zarrs_ngff::Result<LevelArray> {
    let store = open_filesystem_store(destination)?;
    let array = ArrayBuilder::new(
        vec![1, 2, 2, 16, 16],
        vec![1, 1, 1, 16, 16],
        data_type::uint8(),
        0u8,
    )
    .build(store, "/0/0")?;
    array.store_metadata()?;
    Ok(array)
}

/// Object storage that is down.
struct UnavailableStorage;

impl ObjectStorage for UnavailableStorage {
    fn uri(&self, key: &str) -> String {
        format!("{BASE_URI}/{key}")
    }

    fn put(&self, _local_path: &Path, _key: &str) -> zarrs_ngff::Result<String> {
        Err(Error::general("object storage unavailable"))
    }

    fn exists(&self, _uri: &str) -> zarrs_ngff::Result<bool> {
        Ok(false)
    }
}

/// Object storage that accepts uploads which then never appear.
struct VanishingStorage;

impl ObjectStorage for VanishingStorage {
    fn uri(&self, key: &str) -> String {
        format!("{BASE_URI}/{key}")
    }

    fn put(&self, _local_path: &Path, key: &str) -> zarrs_ngff::Result<String> {
        Ok(self.uri(key))
    }

    fn exists(&self, _uri: &str) -> zarrs_ngff::Result<bool> {
        Ok(false)
    }
}

struct Fixture {
    _sources: TempDir,
    cache: TempDir,
    bucket: TempDir,
    archive: MemoryArchive,
}

impl Fixture {
    fn new() -> Self {
        env_logger::try_init().ok();
        let sources = tempfile::tempdir().expect("create source dir");
        let mut file_references = Vec::new();
        for (id, name) in [("f1", "T1_C1.tif"), ("f2", "T1_C2.tif"), ("f3", "single.tif")] {
            let path = sources.path().join(name);
            std::fs::write(&path, name).expect("write source file");
            file_references.push(FileReference {
                id: id.to_string(),
                name: name.to_string(),
                uri: path.display().to_string(),
                size_in_bytes: name.len() as u64,
                attributes: Default::default(),
            });
        }
        let archive = MemoryArchive::new();
        archive
            .insert_study(
                Study {
                    id: STUDY_ID.to_string(),
                    accession_id: "S-BIAD9".to_string(),
                    title: None,
                },
                file_references,
            )
            .expect("insert study");
        Self {
            _sources: sources,
            cache: tempfile::tempdir().expect("create cache dir"),
            bucket: tempfile::tempdir().expect("create bucket dir"),
            archive,
        }
    }

    fn settings(&self) -> Settings {
        Settings {
            cache_root: self.cache.path().to_path_buf(),
            pyramid: PyramidSettings {
                target_chunks: vec![1, 1, 2, 8, 8],
                downsample_factors: vec![1, 1, 1, 2, 2],
                n_levels: 2,
                processing_block: vec![1, 1, 2, 16, 16],
                downsample_method: DownsampleMethod::Mean,
                compression_level: None,
                ..Default::default()
            },
            render: RenderSettings {
                thumbnail_size: (32, 32),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn object_storage(&self) -> LocalObjectStorage {
        LocalObjectStorage::new(self.bucket.path(), BASE_URI)
    }

    fn bucket_path(&self, uri: &str) -> PathBuf {
        let key = uri
            .strip_prefix(BASE_URI)
            .expect("uri under bucket")
            .trim_start_matches('/');
        self.bucket.path().join(key)
    }

    fn image(&self, image_id: &str) -> Image {
        self.archive
            .get_image(image_id)
            .expect("lookup image")
            .expect("image exists")
    }
}

fn fileset_request() -> ImageToConvert {
    ImageToConvert {
        label: Some("two channels".to_string()),
        pattern: Some("T{t}_C{c}.tif".to_string()),
        ..Default::default()
    }
}

fn count_of(image: &Image, use_type: &str) -> usize {
    image
        .representations
        .iter()
        .filter(|r| r.kind.use_type() == use_type)
        .count()
}

#[test]
fn test_repeated_runs_register_one_pyramid() {
    let fixture = Fixture::new();
    let converter = FakeConverter::default();
    let storage = fixture.object_storage();
    let pipeline = Pipeline::new(fixture.settings(), &fixture.archive, &storage, &converter);

    let first = pipeline.convert_images(STUDY_ID, &[fileset_request()]);
    let second = pipeline.convert_images(STUDY_ID, &[fileset_request()]);
    let first = first[0].result.as_ref().expect("first conversion");
    let second = &second[0];
    assert_eq!(second.result.as_ref().expect("second conversion"), first);

    assert_eq!(converter.calls(), 1);
    assert_eq!(
        converter.inputs.lock().expect("inputs lock").as_slice(),
        ["T<0001-0001>_C<0001-0002>_Z<0000-0000>.tif"]
    );

    let image_id = second.image_id.as_deref().expect("image id");
    let image = fixture.image(image_id);
    assert_eq!(image.representations.len(), 2);
    assert_eq!(count_of(&image, "ome_ngff"), 1);
    assert!(first.uri[0].starts_with(&format!("{BASE_URI}/S-BIAD9/{image_id}/")));
    assert!(first.uri[0].ends_with(".ome.zarr"));
    assert!(first.size_in_bytes > 0);

    let uploaded = fixture.bucket_path(&first.uri[0]);
    assert!(uploaded.join("zarr.json").is_file());
    let uploaded_store = open_filesystem_store(&uploaded).expect("open uploaded pyramid");
    let level = Array::open(uploaded_store, "/1").expect("open level 1");
    assert_eq!(level.shape(), &[1, 2, 2, 8, 8]);
}

#[test]
fn test_failed_upload_resumes_from_cache() {
    let fixture = Fixture::new();
    let converter = FakeConverter::default();

    let unavailable = UnavailableStorage;
    let pipeline = Pipeline::new(fixture.settings(), &fixture.archive, &unavailable, &converter);
    let outcome = pipeline.convert_images(STUDY_ID, &[fileset_request()]);
    assert!(outcome[0].result.is_err());
    let image_id = outcome[0].image_id.clone().expect("image assigned");
    assert_eq!(count_of(&fixture.image(&image_id), "ome_ngff"), 0);
    let level_metadata = fixture
        .settings()
        .pyramid_path(&image_id)
        .join("1")
        .join("zarr.json");
    let built_at = std::fs::metadata(&level_metadata)
        .and_then(|m| m.modified())
        .expect("level 1 built");

    let storage = fixture.object_storage();
    let pipeline = Pipeline::new(fixture.settings(), &fixture.archive, &storage, &converter);
    pipeline
        .convert_image(&image_id, &ConversionOptions::default())
        .expect("resumed conversion");

    assert_eq!(converter.calls(), 1);
    assert_eq!(
        std::fs::metadata(&level_metadata)
            .and_then(|m| m.modified())
            .expect("level 1 kept"),
        built_at
    );
    assert_eq!(count_of(&fixture.image(&image_id), "ome_ngff"), 1);
}

#[test]
fn test_image_without_convertible_representation() {
    let fixture = Fixture::new();
    let converter = FakeConverter::default();
    let storage = fixture.object_storage();
    let pipeline = Pipeline::new(fixture.settings(), &fixture.archive, &storage, &converter);
    fixture
        .archive
        .create_image(Image {
            id: "preview-only".to_string(),
            study_id: STUDY_ID.to_string(),
            name: "preview".to_string(),
            representations: vec![ImageRepresentation {
                id: "thumb".to_string(),
                uri: vec![format!("{BASE_URI}/thumb.png")],
                size_in_bytes: 10,
                kind: RepresentationKind::Thumbnail {
                    size_x: 256,
                    size_y: 256,
                },
            }],
        })
        .expect("create image");

    let result = pipeline.convert_image("preview-only", &ConversionOptions::default());
    assert!(matches!(
        result,
        Err(Error::NoConvertibleRepresentation { image_id }) if image_id == "preview-only"
    ));
    assert_eq!(converter.calls(), 0);
}

#[test]
fn test_single_file_with_transpose_and_thumbnail() {
    let fixture = Fixture::new();
    let converter = FakeConverter::default();
    let storage = fixture.object_storage();
    let pipeline = Pipeline::new(fixture.settings(), &fixture.archive, &storage, &converter);

    let request = ImageToConvert {
        name: Some("single.tif".to_string()),
        options: ConversionOptions {
            transpose_t_z: true,
        },
        ..Default::default()
    };
    let outcome = pipeline.convert_images(STUDY_ID, &[request]);
    let pyramid = outcome[0].result.as_ref().expect("conversion");
    let image_id = outcome[0].image_id.clone().expect("image id");
    assert_eq!(
        converter.inputs.lock().expect("inputs lock").as_slice(),
        ["single.tif"]
    );

    let uploaded = open_filesystem_store(&fixture.bucket_path(&pyramid.uri[0]))
        .expect("open uploaded pyramid");
    let base = Array::open(uploaded, "/0").expect("open level 0");
    assert_eq!(base.shape(), &[2, 2, 1, 16, 16]);

    let thumbnail = pipeline.create_thumbnail(&image_id).expect("thumbnail");
    let again = pipeline.create_thumbnail(&image_id).expect("thumbnail again");
    assert_eq!(thumbnail, again);
    assert_eq!(count_of(&fixture.image(&image_id), "thumbnail"), 1);
    assert!(thumbnail.uri[0].ends_with(".png"));

    let png = image::open(fixture.bucket_path(&thumbnail.uri[0])).expect("read thumbnail");
    assert_eq!((png.width(), png.height()), (32, 32));
}

#[test]
fn test_crashed_converter_output_is_not_reused() {
    let fixture = Fixture::new();
    let storage = fixture.object_storage();
    let settings = fixture.settings();

    let crashing = CrashingConverter;
    let pipeline = Pipeline::new(settings.clone(), &fixture.archive, &storage, &crashing);
    let outcome = pipeline.convert_images(STUDY_ID, &[fileset_request()]);
    assert!(outcome[0].result.is_err());
    let image_id = outcome[0].image_id.clone().expect("image assigned");
    assert!(!settings.converter_output_path(&image_id).exists());
    assert!(!settings.converter_partial_path(&image_id).exists());

    let converter = FakeConverter::default();
    let pipeline = Pipeline::new(settings.clone(), &fixture.archive, &storage, &converter);
    pipeline
        .convert_image(&image_id, &ConversionOptions::default())
        .expect("conversion after crash");
    assert_eq!(converter.calls(), 1);

    let pyramid = open_filesystem_store(&settings.pyramid_path(&image_id)).expect("open pyramid");
    let level = Array::open(pyramid, "/0").expect("open level 0");
    let values: Vec<u8> = level
        .retrieve_array_subset(&level.subset_all())
        .expect("read level 0");
    assert_eq!(values, base_values());
    assert_eq!(count_of(&fixture.image(&image_id), "ome_ngff"), 1);
}

#[test]
fn test_unverified_upload_is_not_registered() {
    let fixture = Fixture::new();
    let converter = FakeConverter::default();
    let storage = VanishingStorage;
    let pipeline = Pipeline::new(fixture.settings(), &fixture.archive, &storage, &converter);

    let outcome = pipeline.convert_images(STUDY_ID, &[fileset_request()]);
    match &outcome[0].result {
        Err(Error::UploadVerificationFailed { uri }) => {
            assert!(uri.starts_with(&format!("{BASE_URI}/S-BIAD9/")));
            assert!(uri.ends_with(".ome.zarr/zarr.json"));
        }
        other => panic!("expected failed upload verification, got {other:?}"),
    }
    let image_id = outcome[0].image_id.as_deref().expect("image assigned");
    assert_eq!(count_of(&fixture.image(image_id), "ome_ngff"), 0);
}
