//! Converting registered images into uploaded OME-NGFF pyramids and 2D previews.
//!
//! Every step checks for its own finished output first, so a run can be repeated after a
//! failure and only redoes what is missing. At most one run per image identity may be active
//! at a time; nothing here takes a lock.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use image::ImageFormat;
use zarrs::array::Array;
use zarrs::storage::{ReadableStorageTraits, ReadableWritableListableStorage};

use crate::archive::ArchiveStore;
use crate::config::{
    ConversionOptions, ConverterSettings, ImageToConvert, PyramidSettings, Settings,
};
use crate::identity::{assign_image, representation_identifier};
use crate::metadata::{
    base_scales_in_meters, create_ome_zarr_metadata, read_group_metadata, write_group_metadata,
};
use crate::model::{Image, ImageRepresentation, RepresentationKind, StructuredFileset};
use crate::proxy::NgffImage;
use crate::pyramid::{BuildReport, ChunkLayout, PyramidBuilder, node_path, transpose_levels};
use crate::render::render_thumbnail;
use crate::storage::{
    ObjectStorage, ROOT_METADATA, directory_size, open_existing_store, open_filesystem_store,
};

/// Format suffix of uploaded pyramids.
pub const OME_ZARR_FORMAT: &str = ".ome.zarr";
/// Format suffix of uploaded 2D renderings.
pub const PNG_FORMAT: &str = ".png";

/// Name of the pattern file handed to the converter for structured filesets.
const PATTERN_FILE_NAME: &str = "files.pattern";

/// An external program turning raw microscopy files into a base-resolution zarr hierarchy.
pub trait ExternalConverter {
    /// Convert `input` (a single file, or a pattern file naming many) into a new hierarchy at
    /// `destination`.
    fn convert(&self, input: &Path, destination: &Path) -> crate::Result<()>;
}

/// Runs the `bioformats2raw` command line tool.
#[derive(Debug, Clone)]
pub struct Bioformats2Raw {
    settings: ConverterSettings,
}

impl Bioformats2Raw {
    pub fn new(settings: ConverterSettings) -> Self {
        Self { settings }
    }
}

impl ExternalConverter for Bioformats2Raw {
    fn convert(&self, input: &Path, destination: &Path) -> crate::Result<()> {
        let mut command = Command::new(&self.settings.bin);
        command.arg(input).arg(destination);
        if let Some(java_home) = &self.settings.java_home {
            command.env("JAVA_HOME", java_home);
        }
        let rendered = format!(
            "{} {} {}",
            self.settings.bin.display(),
            input.display(),
            destination.display()
        );
        log::info!("running {rendered}");
        let status = command.status()?;
        if !status.success() {
            return Err(crate::Error::ExternalConversion {
                command: rendered,
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

/// Object key of a derived representation: `<accession>/<image>/<representation><format>`.
pub fn object_key(
    accession_id: &str,
    image_id: &str,
    representation_id: &str,
    image_format: &str,
) -> String {
    format!("{accession_id}/{image_id}/{representation_id}{image_format}")
}

/// Resolve a representation URI to a local path. Only plain paths and `file://` URIs are
/// supported.
fn local_source_path(uri: &str) -> crate::Result<PathBuf> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if uri.contains("://") {
        return Err(crate::Error::general(format!(
            "cannot stage non-local source {uri}"
        )));
    }
    Ok(PathBuf::from(uri))
}

fn stage_file(source: &Path, target: &Path) -> crate::Result<()> {
    #[cfg(unix)]
    std::os::unix::fs::symlink(source, target)?;
    #[cfg(not(unix))]
    std::fs::copy(source, target)?;
    Ok(())
}

/// Rechunk `base` into a pyramid in `store` and describe it with NGFF metadata.
///
/// Group metadata is written last, and only if a level was (re)built or it is missing.
pub fn build_ome_zarr<TStorage: ?Sized + ReadableStorageTraits + 'static>(
    base: &Array<TStorage>,
    store: &ReadableWritableListableStorage,
    settings: &PyramidSettings,
    name: &str,
    base_scales: &[f64],
) -> crate::Result<BuildReport> {
    let builder = PyramidBuilder::new(settings.clone());
    let report = builder.build(base, store)?;
    if report.built.is_empty() && read_group_metadata(store, "/").is_ok() {
        log::info!("pyramid {name} already complete");
        return Ok(report);
    }
    let metadata = create_ome_zarr_metadata(store, &report.levels, name, base_scales)?;
    write_group_metadata(store, &metadata)?;
    log::info!("wrote metadata for {} levels of {name}", report.levels.len());
    Ok(report)
}

/// Result of converting one image of a batch.
#[derive(Debug)]
pub struct ConversionOutcome {
    pub name: String,
    pub image_id: Option<String>,
    pub result: crate::Result<ImageRepresentation>,
}

/// Drives conversions against the archive, local cache, converter and object storage.
pub struct Pipeline<'a> {
    settings: Settings,
    archive: &'a dyn ArchiveStore,
    object_storage: &'a dyn ObjectStorage,
    converter: &'a dyn ExternalConverter,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        settings: Settings,
        archive: &'a dyn ArchiveStore,
        object_storage: &'a dyn ObjectStorage,
        converter: &'a dyn ExternalConverter,
    ) -> Self {
        Self {
            settings,
            archive,
            object_storage,
            converter,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn get_image(&self, image_id: &str) -> crate::Result<Image> {
        self.archive
            .get_image(image_id)?
            .ok_or_else(|| crate::Error::general(format!("no image with id {image_id}")))
    }

    /// Whether the converter output for an image holds a readable base array.
    ///
    /// Output only appears at this path once the converter has succeeded, see
    /// [`Pipeline::run_converter`].
    fn base_is_ready(&self, image_id: &str) -> bool {
        let path = self.settings.converter_output_path(image_id);
        open_existing_store(&path).is_ok_and(|store| {
            Array::open(store, &node_path(&self.settings.converter.base_array_path)).is_ok()
        })
    }

    /// Stage the source files of `representation` in `dir`, returning the converter input.
    fn stage(
        &self,
        image: &Image,
        representation: &ImageRepresentation,
        dir: &Path,
    ) -> crate::Result<PathBuf> {
        match &representation.kind {
            RepresentationKind::StructuredFileset(fileset) => {
                self.stage_fileset(image, fileset, dir)
            }
            RepresentationKind::SingleFile => {
                let uri = representation.uri.first().ok_or_else(|| {
                    crate::Error::general(format!(
                        "representation {} has no uri",
                        representation.id
                    ))
                })?;
                let source = local_source_path(uri)?;
                let file_name = source.file_name().ok_or_else(|| {
                    crate::Error::general(format!("source {uri} has no file name"))
                })?;
                let target = dir.join(file_name);
                stage_file(&source, &target)?;
                Ok(target)
            }
            RepresentationKind::OmeNgff
            | RepresentationKind::Thumbnail { .. }
            | RepresentationKind::Representative
            | RepresentationKind::StaticDisplay { .. } => {
                Err(crate::Error::NoConvertibleRepresentation {
                    image_id: image.id.clone(),
                })
            }
        }
    }

    fn stage_fileset(
        &self,
        image: &Image,
        fileset: &StructuredFileset,
        dir: &Path,
    ) -> crate::Result<PathBuf> {
        let uris: BTreeMap<String, String> = self
            .archive
            .get_file_references(&image.study_id)?
            .into_iter()
            .map(|f| (f.id, f.uri))
            .collect();
        for (fileref_id, position) in &fileset.position_map {
            let uri = uris.get(fileref_id).ok_or_else(|| {
                crate::Error::general(format!("file reference {fileref_id} not found"))
            })?;
            let target = dir.join(position.staged_file_name(&fileset.extension));
            stage_file(&local_source_path(uri)?, &target)?;
        }
        let pattern_file = dir.join(PATTERN_FILE_NAME);
        std::fs::write(&pattern_file, fileset.canonical_pattern()?)?;
        log::debug!(
            "staged {} files for {} in {}",
            fileset.position_map.len(),
            image.id,
            dir.display()
        );
        Ok(pattern_file)
    }

    /// Physical scale of the converter's base level, or the configured default.
    fn base_scales(&self, converter_store: &ReadableWritableListableStorage) -> Vec<f64> {
        let base_path = &self.settings.converter.base_array_path;
        let series = base_path.rsplit_once('/').map_or("", |(parent, _)| parent);
        match read_group_metadata(converter_store, series)
            .and_then(|metadata| base_scales_in_meters(&metadata))
        {
            Ok(scales) => scales,
            Err(e) => {
                log::warn!("using default coordinate scales: {e}");
                self.settings.pyramid.default_coordinate_scales.clone()
            }
        }
    }

    /// Convert `input` into a sibling of the image's converter output and move it into place
    /// once the converter succeeds. Whatever a failed or interrupted run wrote is discarded.
    fn run_converter(&self, image_id: &str, input: &Path) -> crate::Result<()> {
        let partial = self.settings.converter_partial_path(image_id);
        if partial.exists() {
            log::warn!("removing interrupted conversion at {}", partial.display());
            std::fs::remove_dir_all(&partial)?;
        }
        if let Some(parent) = partial.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(e) = self.converter.convert(input, &partial) {
            if partial.exists() {
                std::fs::remove_dir_all(&partial)?;
            }
            return Err(e);
        }
        std::fs::rename(&partial, self.settings.converter_output_path(image_id))?;
        Ok(())
    }

    /// Convert an image into a pyramid, upload it and register it, doing only what is missing.
    ///
    /// Returns the image's pyramid representation.
    pub fn convert_image(
        &self,
        image_id: &str,
        options: &ConversionOptions,
    ) -> crate::Result<ImageRepresentation> {
        let image = self.get_image(image_id)?;
        if let Some(existing) = image.pyramid_representation() {
            log::info!("image {image_id} already has pyramid {}", existing.id);
            return Ok(existing.clone());
        }
        let source = image.convertible_representation().ok_or_else(|| {
            crate::Error::NoConvertibleRepresentation {
                image_id: image_id.to_string(),
            }
        })?;

        let converter_output = self.settings.converter_output_path(image_id);
        if self.base_is_ready(image_id) {
            log::info!("using cached conversion at {}", converter_output.display());
        } else {
            if converter_output.exists() {
                log::warn!("removing incomplete conversion at {}", converter_output.display());
                std::fs::remove_dir_all(&converter_output)?;
            }
            let staging = tempfile::tempdir()?;
            let input = self.stage(&image, source, staging.path())?;
            self.run_converter(image_id, &input)?;
        }

        let converter_store = open_existing_store(&converter_output)?;
        let base = Array::open(
            converter_store.clone(),
            &node_path(&self.settings.converter.base_array_path),
        )?;
        let base_scales = self.base_scales(&converter_store);

        let pyramid_path = self.settings.pyramid_path(image_id);
        let store = open_filesystem_store(&pyramid_path)?;
        let report = build_ome_zarr(
            &base,
            &store,
            &self.settings.pyramid,
            &image.name,
            &base_scales,
        )?;

        let upload_path = if options.transpose_t_z {
            let transposed_path = self.settings.transposed_pyramid_path(image_id);
            let transposed = open_filesystem_store(&transposed_path)?;
            let layout = ChunkLayout::from(&self.settings.pyramid);
            transpose_levels(&store, &transposed, &report.levels, (0, 2), &layout)?;
            let mut scales = base_scales.clone();
            if scales.len() >= 3 {
                scales.swap(0, 2);
            }
            let metadata =
                create_ome_zarr_metadata(&transposed, &report.levels, &image.name, &scales)?;
            write_group_metadata(&transposed, &metadata)?;
            transposed_path
        } else {
            pyramid_path
        };

        let accession_id = self.archive.get_study(&image.study_id)?.accession_id;
        let kind = RepresentationKind::OmeNgff;
        let representation_id =
            representation_identifier(image_id, OME_ZARR_FORMAT, kind.use_type());
        let key = object_key(&accession_id, image_id, &representation_id, OME_ZARR_FORMAT);
        let uri = self.object_storage.uri(&key);
        let metadata_uri = format!("{uri}/{ROOT_METADATA}");
        if self.object_storage.exists(&metadata_uri)? {
            log::info!("pyramid already uploaded to {uri}");
        } else {
            self.object_storage.put(&upload_path, &key)?;
            if !self.object_storage.exists(&metadata_uri)? {
                return Err(crate::Error::UploadVerificationFailed { uri: metadata_uri });
            }
            log::info!("uploaded pyramid to {uri}");
        }

        let representation = ImageRepresentation {
            id: representation_id,
            uri: vec![uri],
            size_in_bytes: directory_size(&upload_path)?,
            kind,
        };
        self.archive.add_representation(image_id, representation.clone())?;
        Ok(representation)
    }

    /// Assign and convert each image, recording failures without stopping the batch.
    pub fn convert_images(
        &self,
        study_id: &str,
        images: &[ImageToConvert],
    ) -> Vec<ConversionOutcome> {
        images
            .iter()
            .map(|image_to_convert| {
                let name = image_to_convert
                    .name
                    .clone()
                    .or_else(|| image_to_convert.label.clone())
                    .or_else(|| image_to_convert.pattern.clone())
                    .unwrap_or_default();
                let mut image_id = None;
                let result = assign_image(self.archive, study_id, image_to_convert).and_then(
                    |assignment| {
                        image_id = Some(assignment.image.id.clone());
                        self.convert_image(&assignment.image.id, &image_to_convert.options)
                    },
                );
                match &result {
                    Ok(representation) => {
                        log::info!("converted {name}: {}", representation.uri.join(", "))
                    }
                    Err(e) => log::warn!("skipping {name}: {e}"),
                }
                ConversionOutcome {
                    name,
                    image_id,
                    result,
                }
            })
            .collect()
    }

    /// Render, upload and register a 256x256 (by default) thumbnail.
    pub fn create_thumbnail(&self, image_id: &str) -> crate::Result<ImageRepresentation> {
        let (size_x, size_y) = self.settings.render.thumbnail_size;
        self.create_2d_representation(image_id, RepresentationKind::Thumbnail { size_x, size_y })
    }

    /// Render, upload and register a 512x512 (by default) static display image.
    pub fn create_static_display(&self, image_id: &str) -> crate::Result<ImageRepresentation> {
        let (size_x, size_y) = self.settings.render.static_display_size;
        self.create_2d_representation(
            image_id,
            RepresentationKind::StaticDisplay { size_x, size_y },
        )
    }

    fn create_2d_representation(
        &self,
        image_id: &str,
        kind: RepresentationKind,
    ) -> crate::Result<ImageRepresentation> {
        let dims = match kind {
            RepresentationKind::Thumbnail { size_x, size_y }
            | RepresentationKind::StaticDisplay { size_x, size_y } => (size_x, size_y),
            _ => {
                return Err(crate::Error::general(format!(
                    "{} is not a 2D representation",
                    kind.use_type()
                )));
            }
        };
        let image = self.get_image(image_id)?;
        if let Some(existing) = image.find_representation(|k| k.use_type() == kind.use_type()) {
            log::info!("image {image_id} already has {} {}", kind.use_type(), existing.id);
            return Ok(existing.clone());
        }

        let transposed = self.settings.transposed_pyramid_path(image_id);
        let pyramid_path = if transposed.is_dir() {
            transposed
        } else {
            self.settings.pyramid_path(image_id)
        };
        let store = open_existing_store(&pyramid_path)?;
        let ngff_image = NgffImage::open(&store, true)?;
        let rendered = render_thumbnail(&store, &ngff_image, dims, &self.settings.render)?;

        let file = tempfile::Builder::new().suffix(PNG_FORMAT).tempfile()?;
        rendered.save_with_format(file.path(), ImageFormat::Png)?;
        let size_in_bytes = std::fs::metadata(file.path())?.len();

        let accession_id = self.archive.get_study(&image.study_id)?.accession_id;
        let representation_id = representation_identifier(image_id, PNG_FORMAT, kind.use_type());
        let key = object_key(&accession_id, image_id, &representation_id, PNG_FORMAT);
        let uri = self.object_storage.put(file.path(), &key)?;
        if !self.object_storage.exists(&uri)? {
            return Err(crate::Error::UploadVerificationFailed { uri });
        }
        log::info!("wrote {} to {uri}", kind.use_type());

        let representation = ImageRepresentation {
            id: representation_id,
            uri: vec![uri],
            size_in_bytes,
            kind,
        };
        self.archive.add_representation(image_id, representation.clone())?;
        Ok(representation)
    }
}
