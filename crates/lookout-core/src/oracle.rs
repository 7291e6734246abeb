//! Detection/embedding oracle used by the matcher.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_FILE};
use crate::types::{BoundingBox, DetectionModel, Embedding};
use image::RgbImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Locates faces in a photo and turns each location into an embedding.
pub trait FaceOracle {
    /// Face locations found by `model`, strongest first.
    fn locate(&mut self, image: &RgbImage, model: DetectionModel) -> Result<Vec<BoundingBox>, OracleError>;

    /// One embedding per entry of `faces`, in the same order.
    fn encode(&mut self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<Embedding>, OracleError>;
}

/// SCRFD + ArcFace running on ONNX Runtime.
///
/// The recognizer is loaded up front; each detector is loaded the first time
/// its model is requested.
pub struct OnnxOracle {
    model_dir: PathBuf,
    detectors: HashMap<DetectionModel, FaceDetector>,
    recognizer: FaceRecognizer,
}

impl OnnxOracle {
    pub fn load(model_dir: &Path) -> Result<Self, OracleError> {
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            detectors: HashMap::new(),
            recognizer,
        })
    }

    fn detector(&mut self, model: DetectionModel) -> Result<&mut FaceDetector, DetectorError> {
        if !self.detectors.contains_key(&model) {
            let detector = FaceDetector::load(&self.model_dir.join(model.file_name()), model)?;
            self.detectors.insert(model, detector);
        }
        self.detectors
            .get_mut(&model)
            .ok_or_else(|| DetectorError::InferenceFailed(format!("{model} detector missing after load")))
    }
}

impl FaceOracle for OnnxOracle {
    fn locate(&mut self, image: &RgbImage, model: DetectionModel) -> Result<Vec<BoundingBox>, OracleError> {
        Ok(self.detector(model)?.detect(image)?)
    }

    fn encode(&mut self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<Embedding>, OracleError> {
        faces
            .iter()
            .map(|face| self.recognizer.extract(image, face).map_err(OracleError::from))
            .collect()
    }
}
