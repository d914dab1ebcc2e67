//! Caller-visible errors.
//!
//! Only precondition violations and map (de)serialization failures are
//! reported. Degenerate data, divergence and accelerator problems are handled
//! inside the engine and surface as warnings in the log.

use std::io;

use thiserror::Error;

/// Errors returned by the public engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No images provided")]
    EmptyImageList,

    #[error("Dimension mismatch for image {index}: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        index: usize,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Image {index} must be mono, got {channels} channels")]
    NotMono { index: usize, channels: usize },

    #[error("Consensus dedistortion requires at least one image tagged as consensus keyframe")]
    MissingConsensusKeyframe,

    #[error("Image {index} has no distortion maps")]
    MissingDistortionMaps { index: usize },

    #[error("Invalid tile size {0}: must be at least 16 pixels")]
    InvalidTileSize(usize),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("No image matches manual reference '{0}'")]
    ManualReferenceNotFound(String),

    #[error("Malformed distortion map data: {0}")]
    MalformedDistortionMap(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_message() {
        let err = Error::DimensionMismatch {
            index: 3,
            expected: (256, 256),
            actual: (128, 256),
        };
        assert_eq!(
            err.to_string(),
            "Dimension mismatch for image 3: expected (256, 256), got (128, 256)"
        );
    }

    #[test]
    fn test_not_mono_message() {
        let err = Error::NotMono {
            index: 0,
            channels: 3,
        };
        assert_eq!(err.to_string(), "Image 0 must be mono, got 3 channels");
    }

    #[test]
    fn test_invalid_parameter_message() {
        let err = Error::invalid("sampling", "must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid parameter 'sampling': must be positive"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("short read"));
    }
}
