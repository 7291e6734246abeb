use std::fmt;
use std::str::FromStr;

/// Maximum embedding distance for two faces to count as the same person.
///
/// Embeddings are L2-normalized, so a distance `d` is a cosine similarity of
/// `1 - d²/2`: 0.6 means cosine ≥ 0.82, and a cosine threshold of 0.40 would
/// be a distance of about 1.10.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance between two embeddings.
    pub fn distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// True if `other` lies within `tolerance` of this embedding (inclusive).
    pub fn matches(&self, other: &Embedding, tolerance: f32) -> bool {
        self.distance(other) <= tolerance
    }
}

/// True if `candidate` is within `tolerance` of any of the `references`.
pub fn matches_any(candidate: &Embedding, references: &[Embedding], tolerance: f32) -> bool {
    references.iter().any(|r| r.matches(candidate, tolerance))
}

/// Which face detection model to run on candidate images.
///
/// `Fast` is the small SCRFD export, usable on any CPU. `Accurate` is the
/// 10 GFLOP export: better recall on small or angled faces, several times
/// slower, and worth running on an accelerated ONNX Runtime build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DetectionModel {
    #[default]
    Fast,
    Accurate,
}

impl DetectionModel {
    /// ONNX file name inside the model directory.
    pub fn file_name(self) -> &'static str {
        match self {
            DetectionModel::Fast => "det_500m.onnx",
            DetectionModel::Accurate => "det_10g.onnx",
        }
    }

    pub(crate) fn intra_threads(self) -> usize {
        match self {
            DetectionModel::Fast => 2,
            DetectionModel::Accurate => 4,
        }
    }
}

impl fmt::Display for DetectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionModel::Fast => f.write_str("fast"),
            DetectionModel::Accurate => f.write_str("accurate"),
        }
    }
}

impl FromStr for DetectionModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "hog" => Ok(DetectionModel::Fast),
            "accurate" | "cnn" => Ok(DetectionModel::Accurate),
            other => Err(format!("unknown detection model '{other}' (expected fast or accurate)")),
        }
    }
}
