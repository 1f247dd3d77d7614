//! The remote archive's object and metadata store, as seen by the converter.
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::model::{FileReference, Image, ImageRepresentation, Study};

/// Query and update operations the pipeline needs from the archive.
pub trait ArchiveStore {
    fn get_study(&self, study_id: &str) -> crate::Result<Study>;

    fn get_file_references(&self, study_id: &str) -> crate::Result<Vec<FileReference>>;

    fn get_image(&self, image_id: &str) -> crate::Result<Option<Image>>;

    fn get_image_by_name(&self, study_id: &str, name: &str) -> crate::Result<Option<Image>>;

    fn create_image(&self, image: Image) -> crate::Result<()>;

    fn add_representation(
        &self,
        image_id: &str,
        representation: ImageRepresentation,
    ) -> crate::Result<()>;
}

#[derive(Debug, Default)]
struct Contents {
    studies: BTreeMap<String, Study>,
    file_references: BTreeMap<String, Vec<FileReference>>,
    images: BTreeMap<String, Image>,
}

/// An archive held in memory, for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    contents: Mutex<Contents>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> crate::Result<std::sync::MutexGuard<'_, Contents>> {
        self.contents
            .lock()
            .map_err(|_| crate::Error::general("archive lock poisoned"))
    }

    pub fn insert_study(
        &self,
        study: Study,
        file_references: Vec<FileReference>,
    ) -> crate::Result<()> {
        let mut contents = self.lock()?;
        contents
            .file_references
            .insert(study.id.clone(), file_references);
        contents.studies.insert(study.id.clone(), study);
        Ok(())
    }

    /// Every image in the archive, ordered by id.
    pub fn images(&self) -> crate::Result<Vec<Image>> {
        Ok(self.lock()?.images.values().cloned().collect())
    }
}

impl ArchiveStore for MemoryArchive {
    fn get_study(&self, study_id: &str) -> crate::Result<Study> {
        self.lock()?
            .studies
            .get(study_id)
            .cloned()
            .ok_or_else(|| crate::Error::general(format!("no study with id {study_id}")))
    }

    fn get_file_references(&self, study_id: &str) -> crate::Result<Vec<FileReference>> {
        Ok(self
            .lock()?
            .file_references
            .get(study_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_image(&self, image_id: &str) -> crate::Result<Option<Image>> {
        Ok(self.lock()?.images.get(image_id).cloned())
    }

    fn get_image_by_name(&self, study_id: &str, name: &str) -> crate::Result<Option<Image>> {
        Ok(self
            .lock()?
            .images
            .values()
            .find(|image| image.study_id == study_id && image.name == name)
            .cloned())
    }

    fn create_image(&self, image: Image) -> crate::Result<()> {
        let mut contents = self.lock()?;
        if contents.images.contains_key(&image.id) {
            return Err(crate::Error::general(format!(
                "image {} already exists",
                image.id
            )));
        }
        contents.images.insert(image.id.clone(), image);
        Ok(())
    }

    fn add_representation(
        &self,
        image_id: &str,
        representation: ImageRepresentation,
    ) -> crate::Result<()> {
        let mut contents = self.lock()?;
        let image = contents
            .images
            .get_mut(image_id)
            .ok_or_else(|| crate::Error::general(format!("no image with id {image_id}")))?;
        image.representations.push(representation);
        Ok(())
    }
}
