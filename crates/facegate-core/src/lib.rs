//! facegate-core: face signature extraction and matching.
//!
//! Detects faces with SCRFD via ONNX Runtime, reduces the most prominent
//! face to a normalized bounding-box signature, and scores signatures
//! against an enrolled gallery.

pub mod detector;
pub mod extractor;
pub mod types;

use std::path::PathBuf;

pub use detector::{FaceDetector, ModelVariant, ScrfdDetector};
pub use extractor::{Extraction, ExtractError, SignatureExtractor};
pub use types::{
    BoundingBox, EnrolledFace, GeometryMatcher, MatchResult, Matcher, Signature, SignatureError,
    MATCHABILITY_THRESHOLD, STRICT_THRESHOLD,
};

/// Default directory for ONNX models: `$XDG_DATA_HOME/facegate/models`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// Per-user data directory: `$XDG_DATA_HOME/facegate`, falling back to
/// `~/.local/share/facegate`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}
