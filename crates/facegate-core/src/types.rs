use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum similarity a candidate must strictly exceed to be considered a match at all.
pub const MATCHABILITY_THRESHOLD: f64 = 0.7;

/// Minimum similarity a match must strictly exceed to be accepted.
pub const STRICT_THRESHOLD: f64 = 0.8;

/// Face bounding box in pixel coordinates, as produced by a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("malformed stored signature: {0}")]
    Malformed(String),
}

/// Geometric face signature: a bounding box relative to the image, plus the
/// detector's confidence. Every field lies in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signature {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
}

impl Signature {
    /// Normalize a pixel-space detection against the dimensions of its image.
    pub fn from_detection(face: &BoundingBox, image_width: u32, image_height: u32) -> Self {
        let w = image_width.max(1) as f64;
        let h = image_height.max(1) as f64;
        Self {
            x: unit(face.x as f64 / w),
            y: unit(face.y as f64 / h),
            width: unit(face.width as f64 / w),
            height: unit(face.height as f64 / h),
            confidence: unit(face.confidence as f64),
        }
    }

    /// Geometric similarity in [0, 1]. 1.0 means identical boxes.
    ///
    /// `1 - 2 * (|dx| + |dy| + |dw| + |dh|)`, floored at zero. Symmetric in
    /// its arguments; any non-finite coordinate scores 0.0.
    pub fn similarity(&self, other: &Signature) -> f64 {
        if !self.is_finite() || !other.is_finite() {
            return 0.0;
        }
        let pos_diff = (self.x - other.x).abs() + (self.y - other.y).abs();
        let size_diff = (self.width - other.width).abs() + (self.height - other.height).abs();
        (1.0 - 2.0 * (pos_diff + size_diff)).max(0.0)
    }

    fn is_finite(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Encode as the fixed-schema JSON object kept in the store.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "x": self.x,
            "y": self.y,
            "width": self.width,
            "height": self.height,
            "confidence": self.confidence,
        })
        .to_string()
    }

    /// Decode a stored signature. Anything but the exact schema, with every
    /// field in [0, 1], fails closed.
    pub fn from_json(raw: &str) -> Result<Self, SignatureError> {
        let sig: Signature =
            serde_json::from_str(raw).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let fields = [sig.x, sig.y, sig.width, sig.height, sig.confidence];
        if !fields.iter().all(|v| (0.0..=1.0).contains(v)) {
            return Err(SignatureError::Malformed(format!(
                "field outside [0, 1]: {fields:?}"
            )));
        }
        Ok(sig)
    }
}

fn unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// An enrolled signature paired with the employee that owns it.
#[derive(Debug, Clone)]
pub struct EnrolledFace {
    pub employee_id: i64,
    pub signature: Signature,
}

/// Result of matching a probe signature against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// True when some candidate strictly exceeded the threshold.
    pub matched: bool,
    /// Similarity of the best match; 0.0 when unmatched.
    pub similarity: f64,
    /// Highest similarity seen over the whole gallery, matched or not.
    /// For diagnostics only; never report it to the person being checked.
    pub closest: f64,
    /// Owner of the best match (if any).
    pub employee_id: Option<i64>,
}

/// Strategy for comparing a probe signature against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Signature, gallery: &[EnrolledFace], threshold: f64) -> MatchResult;
}

/// Matcher over bounding-box geometry.
///
/// Visits every gallery entry. Only candidates strictly above the threshold
/// can become the best match.
pub struct GeometryMatcher;

impl Matcher for GeometryMatcher {
    fn compare(&self, probe: &Signature, gallery: &[EnrolledFace], threshold: f64) -> MatchResult {
        let mut closest = 0.0f64;
        let mut best: Option<(usize, f64)> = None;

        for (i, face) in gallery.iter().enumerate() {
            let sim = probe.similarity(&face.signature);
            closest = closest.max(sim);
            if sim > threshold && best.map_or(true, |(_, b)| sim > b) {
                best = Some((i, sim));
            }
        }

        match best {
            Some((idx, sim)) => MatchResult {
                matched: true,
                similarity: sim,
                closest,
                employee_id: Some(gallery[idx].employee_id),
            },
            None => MatchResult {
                matched: false,
                similarity: 0.0,
                closest,
                employee_id: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(x: f64, y: f64, width: f64, height: f64) -> Signature {
        Signature { x, y, width, height, confidence: 0.9 }
    }

    fn face(id: i64, signature: Signature) -> EnrolledFace {
        EnrolledFace { employee_id: id, signature }
    }

    #[test]
    fn test_similarity_identical() {
        let a = sig(0.31, 0.22, 0.4, 0.45);
        assert_eq!(a.similarity(&a), 1.0);
    }

    #[test]
    fn test_similarity_known_value() {
        // total diff 0.125 → 1 - 0.25
        let a = sig(0.25, 0.25, 0.5, 0.5);
        let b = sig(0.375, 0.25, 0.5, 0.5);
        assert!((a.similarity(&b) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_similarity_clamped_at_zero() {
        let a = sig(0.0, 0.0, 0.1, 0.1);
        let b = sig(1.0, 1.0, 0.9, 0.9);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_similarity_commutative_and_bounded() {
        let samples = [
            sig(0.1, 0.2, 0.3, 0.4),
            sig(0.15, 0.18, 0.33, 0.41),
            sig(0.9, 0.05, 0.05, 0.7),
            sig(0.5, 0.5, 0.0, 0.0),
        ];
        for a in &samples {
            for b in &samples {
                let ab = a.similarity(b);
                assert_eq!(ab, b.similarity(a));
                assert!((0.0..=1.0).contains(&ab), "out of range: {ab}");
            }
        }
    }

    #[test]
    fn test_similarity_non_finite_is_zero() {
        let a = sig(f64::NAN, 0.2, 0.3, 0.4);
        let b = sig(0.1, 0.2, 0.3, 0.4);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(b.similarity(&a), 0.0);
    }

    #[test]
    fn test_from_detection_normalizes_and_clamps() {
        let bbox = BoundingBox { x: 50.0, y: -10.0, width: 100.0, height: 300.0, confidence: 0.93 };
        let s = Signature::from_detection(&bbox, 200, 200);
        assert!((s.x - 0.25).abs() < 1e-9);
        assert_eq!(s.y, 0.0);
        assert!((s.width - 0.5).abs() < 1e-9);
        assert_eq!(s.height, 1.0);
        assert!((s.confidence - 0.93).abs() < 1e-6);
    }

    #[test]
    fn test_json_schema() {
        let s = sig(0.1, 0.2, 0.3, 0.4);
        let decoded = Signature::from_json(&s.to_json()).unwrap();
        assert_eq!(decoded, s);

        let value: serde_json::Value = serde_json::from_str(&s.to_json()).unwrap();
        for key in ["x", "y", "width", "height", "confidence"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_from_json_rejects_malformed() {
        assert!(Signature::from_json("{\"x\": 0.1, \"y\": 0.2}").is_err());
        assert!(Signature::from_json("(0.1, 0.2, 0.3, 0.4)").is_err());
        assert!(Signature::from_json("__import__('os')").is_err());
        assert!(Signature::from_json("").is_err());
    }

    #[test]
    fn test_from_json_rejects_extra_keys_and_out_of_range() {
        let extra = r#"{"x":0.1,"y":0.2,"width":0.3,"height":0.4,"confidence":0.9,"label":"admin"}"#;
        assert!(matches!(Signature::from_json(extra), Err(SignatureError::Malformed(_))));

        let wide = r#"{"x":0.1,"y":0.2,"width":1.5,"height":0.4,"confidence":0.9}"#;
        assert!(matches!(Signature::from_json(wide), Err(SignatureError::Malformed(_))));

        let negative = r#"{"x":-0.1,"y":0.2,"width":0.3,"height":0.4,"confidence":0.9}"#;
        assert!(Signature::from_json(negative).is_err());

        let edges = r#"{"x":0.0,"y":1.0,"width":0.0,"height":1.0,"confidence":1.0}"#;
        assert!(Signature::from_json(edges).is_ok());
    }

    #[test]
    fn test_matcher_picks_highest_above_threshold() {
        let probe = sig(0.25, 0.25, 0.5, 0.5);
        let gallery = vec![
            face(1, sig(0.0, 0.0, 0.1, 0.1)),
            face(2, sig(0.3, 0.25, 0.5, 0.5)),
            face(3, sig(0.25, 0.25, 0.5, 0.5)),
        ];
        let result = GeometryMatcher.compare(&probe, &gallery, MATCHABILITY_THRESHOLD);
        assert!(result.matched);
        assert_eq!(result.employee_id, Some(3));
        assert_eq!(result.similarity, 1.0);
    }

    #[test]
    fn test_matcher_threshold_is_strict() {
        // similarity exactly 0.75 against a 0.75 threshold is not a match
        let probe = sig(0.25, 0.25, 0.5, 0.5);
        let gallery = vec![face(7, sig(0.375, 0.25, 0.5, 0.5))];
        let result = GeometryMatcher.compare(&probe, &gallery, 0.75);
        assert!(!result.matched);
        assert_eq!(result.employee_id, None);
        assert_eq!(result.similarity, 0.0);
        assert!((result.closest - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_matcher_unmatched_similarity_is_zero() {
        let probe = sig(0.25, 0.25, 0.5, 0.5);
        let gallery = vec![
            face(1, sig(0.45, 0.25, 0.5, 0.5)), // 0.6
            face(2, sig(0.5, 0.25, 0.5, 0.5)),  // 0.5
        ];
        let result = GeometryMatcher.compare(&probe, &gallery, MATCHABILITY_THRESHOLD);
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
        assert!((result.closest - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let probe = sig(0.25, 0.25, 0.5, 0.5);
        let result = GeometryMatcher.compare(&probe, &[], MATCHABILITY_THRESHOLD);
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }
}
