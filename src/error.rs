use thiserror::Error;

pub type ScxResult<T> = Result<T, ScxError>;

#[derive(Debug, Error)]
pub enum ScxError {
    #[error("input error: {0}")]
    Input(#[from] InputError),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ScxError {
    pub fn is_input(&self) -> bool {
        matches!(self, ScxError::Input(_))
    }

    pub fn is_format(&self) -> bool {
        matches!(self, ScxError::Format(_))
    }
}

/// Rejected tensor data, detected before quantization begins.
#[derive(Debug, Error, PartialEq)]
pub enum InputError {
    #[error("tensor name must not be empty")]
    EmptyName,

    #[error("duplicate tensor name '{0}'")]
    DuplicateName(String),

    #[error("tensor '{name}' has shape {shape:?} (size {expected}), but data length {actual}")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("tensor '{name}' has shape {shape:?} whose element count overflows")]
    ShapeOverflow { name: String, shape: Vec<usize> },

    #[error("tensor '{name}' has a non-finite value at index {index}")]
    NonFinite { name: String, index: usize },

    #[error("tensor '{name}' has max |value| {max_abs}, beyond the f16 scale range")]
    ScaleOverflow { name: String, max_abs: f32 },

    #[error("tensor '{name}': {field} of {len} bytes does not fit a u32 length prefix")]
    FieldTooLarge {
        name: String,
        field: &'static str,
        len: usize,
    },

    #[error("tensor '{name}': {reason}")]
    Malformed { name: String, reason: String },

    #[error("invalid block size {0}")]
    InvalidBlockSize(usize),

    #[error("{0} tensors exceed the u32 record count")]
    TooManyTensors(usize),

    #[error("shard '{0}' has no tensors")]
    EmptyShard(String),

    #[error("tensors '{first}' and '{second}' both map to shard '{shard}'")]
    DuplicateShard {
        shard: String,
        first: String,
        second: String,
    },
}

/// Corrupt or unsupported serialized data. Any of these fails the whole read.
#[derive(Debug, Error, PartialEq)]
pub enum FormatError {
    #[error("truncated stream: {needed} bytes needed at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },

    #[error("record '{name}' is malformed: {reason}")]
    MalformedRecord { name: String, reason: String },

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("duplicate record name '{0}'")]
    DuplicateRecord(String),

    #[error("shard index: {0}")]
    BadIndex(String),

    #[error("manifest: {0}")]
    BadManifest(String),

    #[error("inconsistent quantized layout: {0}")]
    Layout(String),

    #[error("packed payload holds {capacity} values, {requested} requested")]
    PayloadTooShort { capacity: usize, requested: usize },
}
