//! lookout-core: Face detection, embedding and matching engine.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime. The [`matcher`] module turns a set of reference
//! images and a set of candidate images into a lazy sequence of matches.

pub mod alignment;
pub mod detector;
pub mod matcher;
pub mod oracle;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use matcher::{FaceMatcher, MatchError, Matches, MatcherOptions, ScanCandidates, ScannedImage};
pub use oracle::{FaceOracle, OnnxOracle, OracleError};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, DetectionModel, Embedding, DEFAULT_TOLERANCE};

use std::path::PathBuf;

/// Default directory holding the ONNX model files.
///
/// `$XDG_DATA_HOME/lookout/models`, falling back to `~/.local/share/lookout/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("lookout/models")
}
