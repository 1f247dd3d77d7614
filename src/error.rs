pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    General(String),
    #[error("structured fileset must share exactly one file extension, found {extensions:?}")]
    HeterogeneousExtension { extensions: Vec<String> },
    #[error("file references {first} and {second} both resolve to position {position:?}")]
    DuplicatePosition {
        first: String,
        second: String,
        position: crate::model::Position,
    },
    #[error("pyramid levels must share one rank, found ranks {ranks:?}")]
    RankMismatch { ranks: Vec<usize> },
    #[error("unknown unit {unit:?} on axis {axis}")]
    UnknownUnit { axis: String, unit: String },
    #[error("no metadata found at {uri} after upload")]
    UploadVerificationFailed { uri: String },
    #[error("can only handle 3D (z, y, x) or 5D (t, c, z, y, x) arrays, got shape {shape:?}")]
    UnsupportedArrayShape { shape: Vec<u64> },
    #[error("image {image_id} has no representation that can be converted")]
    NoConvertibleRepresentation { image_id: String },
    #[error("unsupported data type: {data_type}")]
    UnsupportedDataType { data_type: String },
    #[error("invalid naming pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("external conversion `{command}` failed with {status}")]
    ExternalConversion { command: String, status: String },
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Array(#[from] zarrs::array::ArrayError),
    #[error(transparent)]
    ArrayCreate(#[from] zarrs::array::ArrayCreateError),
    #[error(transparent)]
    GroupCreate(#[from] zarrs::group::GroupCreateError),
    #[error(transparent)]
    Storage(#[from] zarrs::storage::StorageError),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error>),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn wrap(error: impl std::error::Error + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }
}
