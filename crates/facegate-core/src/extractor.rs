//! Signature extraction: base64 payload → decoded image → most prominent face.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::Signature;
use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has no pixels")]
    EmptyImage,
    #[error("face detection failed: {0}")]
    Detector(#[from] DetectorError),
}

/// Outcome of a successful extraction pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Face(Signature),
    /// The detector ran and found nothing. Not an error.
    NoFaceDetected,
}

/// Decode a base64 image payload, dropping any `data:<mime>;base64,` header.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, ExtractError> {
    let trimmed = payload.trim();
    let body = match trimmed.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => trimmed,
    };
    Ok(general_purpose::STANDARD.decode(body.trim())?)
}

/// Runs a [`FaceDetector`] over submitted images and reduces the first
/// detection to a normalized [`Signature`].
pub struct SignatureExtractor<D> {
    detector: D,
}

impl<D: FaceDetector> SignatureExtractor<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    pub fn algorithm(&self) -> &str {
        self.detector.algorithm()
    }

    /// Extract the signature of the most prominent face in `payload`.
    ///
    /// The decoded image lives only for the duration of this call.
    pub fn extract(&mut self, payload: &str) -> Result<Extraction, ExtractError> {
        let bytes = decode_payload(payload)?;
        let image = image::load_from_memory(&bytes)?.to_rgb8();
        drop(bytes);

        if image.width() == 0 || image.height() == 0 {
            return Err(ExtractError::EmptyImage);
        }

        let faces = self.detector.detect(&image)?;
        let Some(face) = faces.first() else {
            tracing::debug!(
                width = image.width(),
                height = image.height(),
                "no face detected"
            );
            return Ok(Extraction::NoFaceDetected);
        };

        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), "multiple faces; using the most confident");
        }

        Ok(Extraction::Face(Signature::from_detection(
            face,
            image.width(),
            image.height(),
        )))
    }
}
