//! Reference-face matching over a set of candidate photos.
//!
//! [`FaceMatcher::find_matches`] embeds the reference faces once, then walks
//! the candidates lazily: each candidate is loaded, detected and embedded only
//! when the caller pulls the next match. The returned iterator is single-pass.

use crate::oracle::{FaceOracle, OracleError};
use crate::types::{matches_any, DetectionModel, Embedding, DEFAULT_TOLERANCE};
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Candidates larger than this (on either side) are downscaled before detection.
pub const MAX_CANDIDATE_DIMENSION: u32 = 1600;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("no reference images given")]
    NoReferences,
    #[error("cannot read reference image {path}: {source}")]
    ReferenceUnreadable {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("no face detected in reference image {0}")]
    NoReferenceFace(PathBuf),
    #[error("face analysis failed on {path}: {source}")]
    Oracle {
        path: PathBuf,
        #[source]
        source: OracleError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct MatcherOptions {
    pub model: DetectionModel,
    /// Maximum Euclidean distance for a match (inclusive).
    pub tolerance: f32,
}

impl Default for MatcherOptions {
    fn default() -> Self {
        Self {
            model: DetectionModel::Fast,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// A candidate photo with at least one detected face.
#[derive(Debug, Clone)]
pub struct ScannedImage {
    pub path: PathBuf,
    /// One embedding per detected face.
    pub embeddings: Vec<Embedding>,
}

pub struct FaceMatcher<O> {
    oracle: O,
    options: MatcherOptions,
}

impl<O: FaceOracle> FaceMatcher<O> {
    pub fn new(oracle: O, options: MatcherOptions) -> Self {
        Self { oracle, options }
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Embed the first detected face of every reference image.
    ///
    /// Reference photos are expected to show exactly one face; extra faces
    /// are ignored.
    pub fn train_references<P: AsRef<Path>>(&mut self, images: &[P]) -> Result<Vec<Embedding>, MatchError> {
        if images.is_empty() {
            return Err(MatchError::NoReferences);
        }

        let mut embeddings = Vec::with_capacity(images.len());
        for path in images {
            let path = path.as_ref();
            let image = load_rgb(path).map_err(|source| MatchError::ReferenceUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
            let oracle_err = |source| MatchError::Oracle {
                path: path.to_path_buf(),
                source,
            };

            let faces = self.oracle.locate(&image, self.options.model).map_err(oracle_err)?;
            let first = faces
                .into_iter()
                .next()
                .ok_or_else(|| MatchError::NoReferenceFace(path.to_path_buf()))?;
            let embedding = self
                .oracle
                .encode(&image, std::slice::from_ref(&first))
                .map_err(oracle_err)?
                .into_iter()
                .next()
                .ok_or_else(|| MatchError::NoReferenceFace(path.to_path_buf()))?;

            tracing::debug!(path = %path.display(), confidence = first.confidence, "reference face embedded");
            embeddings.push(embedding);
        }

        tracing::info!(count = embeddings.len(), "reference faces trained");
        Ok(embeddings)
    }

    /// Lazily detect and embed every face on each candidate.
    ///
    /// Candidates without faces, and files that cannot be decoded, are
    /// skipped rather than yielded.
    pub fn scan_candidates<I>(&mut self, images: I) -> ScanCandidates<'_, O, I::IntoIter>
    where
        I: IntoIterator,
        I::Item: AsRef<Path>,
    {
        ScanCandidates {
            oracle: &mut self.oracle,
            model: self.options.model,
            images: images.into_iter(),
        }
    }

    /// Candidates containing a face within tolerance of any reference face.
    ///
    /// Each candidate is yielded at most once, in candidate order.
    pub fn find_matches<P, I>(
        &mut self,
        references: &[P],
        candidates: I,
    ) -> Result<Matches<'_, O, I::IntoIter>, MatchError>
    where
        P: AsRef<Path>,
        I: IntoIterator,
        I::Item: AsRef<Path>,
    {
        let references = self.train_references(references)?;
        let tolerance = self.options.tolerance;
        Ok(Matches {
            scan: self.scan_candidates(candidates),
            references,
            tolerance,
        })
    }
}

/// Iterator returned by [`FaceMatcher::scan_candidates`].
pub struct ScanCandidates<'m, O, I> {
    oracle: &'m mut O,
    model: DetectionModel,
    images: I,
}

impl<O, I> Iterator for ScanCandidates<'_, O, I>
where
    O: FaceOracle,
    I: Iterator,
    I::Item: AsRef<Path>,
{
    type Item = Result<ScannedImage, MatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let path = self.images.next()?.as_ref().to_path_buf();

            let image = match load_candidate(&path) {
                Ok(image) => image,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable candidate");
                    continue;
                }
            };

            let located = self
                .oracle
                .locate(&image, self.model)
                .and_then(|faces| self.oracle.encode(&image, &faces));
            match located {
                Ok(embeddings) if embeddings.is_empty() => {
                    tracing::debug!(path = %path.display(), "no face detected");
                }
                Ok(embeddings) => return Some(Ok(ScannedImage { path, embeddings })),
                Err(source) => return Some(Err(MatchError::Oracle { path, source })),
            }
        }
    }
}

/// Iterator returned by [`FaceMatcher::find_matches`].
pub struct Matches<'m, O, I> {
    scan: ScanCandidates<'m, O, I>,
    references: Vec<Embedding>,
    tolerance: f32,
}

impl<O, I> Iterator for Matches<'_, O, I>
where
    O: FaceOracle,
    I: Iterator,
    I::Item: AsRef<Path>,
{
    type Item = Result<PathBuf, MatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let scanned = match self.scan.next()? {
                Ok(scanned) => scanned,
                Err(err) => return Some(Err(err)),
            };
            let hit = scanned
                .embeddings
                .iter()
                .any(|face| matches_any(face, &self.references, self.tolerance));
            if hit {
                return Some(Ok(scanned.path));
            }
        }
    }
}

/// Decode by content rather than extension; downloads are all named `.jpeg`.
fn open_image(path: &Path) -> Result<DynamicImage, ImageError> {
    ImageReader::open(path)?.with_guessed_format()?.decode()
}

fn load_rgb(path: &Path) -> Result<RgbImage, ImageError> {
    Ok(open_image(path)?.to_rgb8())
}

fn load_candidate(path: &Path) -> Result<RgbImage, ImageError> {
    let image = open_image(path)?;
    if image.width().max(image.height()) > MAX_CANDIDATE_DIMENSION {
        let resized = image.resize(MAX_CANDIDATE_DIMENSION, MAX_CANDIDATE_DIMENSION, FilterType::Lanczos3);
        tracing::debug!(
            path = %path.display(),
            from = ?(image.width(), image.height()),
            to = ?(resized.width(), resized.height()),
            "downscaled candidate"
        );
        return Ok(resized.to_rgb8());
    }
    Ok(image.to_rgb8())
}
