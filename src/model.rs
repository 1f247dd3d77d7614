//! Archive objects: studies, file references, images and their representations.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Position of one file of a structured fileset along time, channel and depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub t: u32,
    pub c: u32,
    pub z: u32,
}

impl Position {
    pub fn new(t: u32, c: u32, z: u32) -> Self {
        Self { t, c, z }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub id: String,
    pub accession_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// A raw file in the archive. Supplied by the archive store and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub size_in_bytes: u64,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl FileReference {
    /// The final `.suffix` of the file name, including the dot, or `""` if there is none.
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default()
    }
}

/// Many files positioned along t, c and z which together make up one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredFileset {
    pub position_map: BTreeMap<String, Position>,
    pub extension: String,
}

/// What a representation holds and how it was produced.
///
/// The orchestrator matches on this exhaustively to decide which conversion applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepresentationKind {
    /// A single raw source file.
    SingleFile,
    StructuredFileset(StructuredFileset),
    /// A multiscale OME-NGFF pyramid.
    OmeNgff,
    Thumbnail { size_x: u32, size_y: u32 },
    Representative,
    StaticDisplay { size_x: u32, size_y: u32 },
}

impl RepresentationKind {
    /// Name used when deriving representation identifiers and logging.
    pub fn use_type(&self) -> &'static str {
        match self {
            RepresentationKind::SingleFile => "single_file",
            RepresentationKind::StructuredFileset(_) => "structured_fileset",
            RepresentationKind::OmeNgff => "ome_ngff",
            RepresentationKind::Thumbnail { .. } => "thumbnail",
            RepresentationKind::Representative => "representative",
            RepresentationKind::StaticDisplay { .. } => "static_display",
        }
    }

    /// Whether this representation can be fed to the external converter.
    pub fn is_convertible(&self) -> bool {
        matches!(
            self,
            RepresentationKind::SingleFile | RepresentationKind::StructuredFileset(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRepresentation {
    pub id: String,
    pub uri: Vec<String>,
    pub size_in_bytes: u64,
    #[serde(flatten)]
    pub kind: RepresentationKind,
}

/// A logical image. Its `id` is always derived, see [`crate::identity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub study_id: String,
    pub name: String,
    pub representations: Vec<ImageRepresentation>,
}

impl Image {
    /// First representation matching the predicate.
    pub fn find_representation(
        &self,
        predicate: impl Fn(&RepresentationKind) -> bool,
    ) -> Option<&ImageRepresentation> {
        self.representations.iter().find(|r| predicate(&r.kind))
    }

    pub fn pyramid_representation(&self) -> Option<&ImageRepresentation> {
        self.find_representation(|k| matches!(k, RepresentationKind::OmeNgff))
    }

    pub fn convertible_representation(&self) -> Option<&ImageRepresentation> {
        self.find_representation(RepresentationKind::is_convertible)
    }
}
