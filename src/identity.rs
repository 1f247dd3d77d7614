//! Deterministic, content-derived identities and idempotent image registration.
use md5::{Digest, Md5};

use crate::archive::ArchiveStore;
use crate::config::ImageToConvert;
use crate::fileset::{NamingPattern, resolve_fileset};
use crate::model::{Image, ImageRepresentation, RepresentationKind};

/// Derive an image identifier from its constituent file identifiers.
///
/// The identifiers are concatenated in order without a separator and hashed with MD5;
/// the 128-bit digest is presented as a version 4 UUID. The result depends on order but
/// is stable for a fixed ordered input.
pub fn identifier_from_fileref_ids<S: AsRef<str>>(ids: impl IntoIterator<Item = S>) -> String {
    let mut hasher = Md5::new();
    for id in ids {
        hasher.update(id.as_ref().as_bytes());
    }
    let digest: [u8; 16] = hasher.finalize().into();
    uuid::Builder::from_random_bytes(digest)
        .into_uuid()
        .to_string()
}

/// Identifier of a derived representation of an image.
pub fn representation_identifier(image_id: &str, image_format: &str, use_type: &str) -> String {
    identifier_from_fileref_ids([image_id, image_format, use_type])
}

/// Outcome of [`assign_image`].
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub image: Image,
    /// False if the image was already registered.
    pub created: bool,
}

/// Register the image described by `image_to_convert`, unless it already exists.
///
/// Structured filesets (a `pattern` is given) are looked up by derived identity; single
/// files are also looked up by name within the study. A newly created image carries exactly
/// one representation describing how it was assembled.
pub fn assign_image(
    archive: &dyn ArchiveStore,
    study_id: &str,
    image_to_convert: &ImageToConvert,
) -> crate::Result<Assignment> {
    let name = image_to_convert
        .name
        .as_deref()
        .or(image_to_convert.label.as_deref())
        .or(image_to_convert.pattern.as_deref())
        .ok_or_else(|| crate::Error::general("image to convert has no name, label or pattern"))?
        .to_string();
    let file_references = archive.get_file_references(study_id)?;

    let (image_id, representation) = match &image_to_convert.pattern {
        Some(template) => {
            let pattern = NamingPattern::new(template)?;
            let resolved = resolve_fileset(&file_references, &pattern)?;
            let image_id = identifier_from_fileref_ids(resolved.file_ids());
            if let Some(image) = archive.get_image(&image_id)? {
                return Ok(Assignment {
                    image,
                    created: false,
                });
            }
            let kind = RepresentationKind::StructuredFileset(resolved.fileset.clone());
            let representation = ImageRepresentation {
                id: representation_identifier(&image_id, "", kind.use_type()),
                uri: resolved.selected.iter().map(|f| f.uri.clone()).collect(),
                size_in_bytes: resolved.total_size(),
                kind,
            };
            (image_id, representation)
        }
        None => {
            let fileref = file_references
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| {
                    crate::Error::general(format!(
                        "no file named {name:?} in study {study_id}"
                    ))
                })?;
            let image_id = identifier_from_fileref_ids([&fileref.id]);
            let existing = match archive.get_image(&image_id)? {
                Some(image) => Some(image),
                None => archive.get_image_by_name(study_id, &name)?,
            };
            if let Some(image) = existing {
                return Ok(Assignment {
                    image,
                    created: false,
                });
            }
            let kind = RepresentationKind::SingleFile;
            let representation = ImageRepresentation {
                id: representation_identifier(&image_id, "", kind.use_type()),
                uri: vec![fileref.uri.clone()],
                size_in_bytes: fileref.size_in_bytes,
                kind,
            };
            (image_id, representation)
        }
    };

    let image = Image {
        id: image_id,
        study_id: study_id.to_string(),
        name,
        representations: vec![representation],
    };
    log::info!("registering image {} ({})", image.id, image.name);
    archive.create_image(image.clone())?;
    Ok(Assignment {
        image,
        created: true,
    })
}
