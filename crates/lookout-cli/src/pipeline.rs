//! The search run: authenticate, enumerate, download, match, clean up.

use crate::config::{self, Config};
use anyhow::{bail, Context, Result};
use lookout_core::{DetectionModel, FaceMatcher, MatcherOptions, OnnxOracle};
use lookout_remote::download::post_url;
use lookout_remote::{
    DownloadCoordinator, DownloadOptions, FeedPaginator, HttpPhotoService, SessionConfig, SessionManager,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RunArgs {
    pub known_faces_dir: PathBuf,
    pub target: String,
    pub limit: i64,
    pub model: DetectionModel,
    pub tolerance: Option<f32>,
    pub keep: bool,
}

/// Regular files directly inside `dir`, sorted by name.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("cannot list {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Candidates for matching: the photos this run stored, sorted by name.
fn run_candidates(stored: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates: Vec<_> = stored
        .iter()
        .filter(|path| path_post_url(path).is_some())
        .cloned()
        .collect();
    candidates.sort();
    candidates
}

/// Remove the photos this run stored, then the directory if nothing else
/// is left in it.
async fn remove_run_files(dir: &Path, stored: &[PathBuf]) {
    for path in stored {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove downloaded photo");
        }
    }
    if tokio::fs::remove_dir(dir).await.is_err() {
        info!(path = %dir.display(), "download directory not empty; leaving it");
    }
}

fn path_post_url(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).and_then(post_url)
}

/// Match `candidates` against the known faces on a blocking thread,
/// printing each match as it is found. Returns the matched post URLs.
async fn match_photos(
    model_dir: PathBuf,
    references: Vec<PathBuf>,
    candidates: Vec<PathBuf>,
    options: MatcherOptions,
) -> Result<Vec<String>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let oracle = OnnxOracle::load(&model_dir)
            .with_context(|| format!("cannot load face models from {}", model_dir.display()))?;
        let mut matcher = FaceMatcher::new(oracle, options);
        let mut found = Vec::new();
        for result in matcher.find_matches(&references, &candidates)? {
            match result {
                Ok(path) => {
                    let url = path_post_url(&path).unwrap_or_else(|| path.display().to_string());
                    println!("Possible match [{url}]");
                    found.push(url);
                }
                Err(e) => warn!(error = %e, "skipping candidate"),
            }
        }
        Ok(found)
    })
    .await
    .context("face matching task failed")?
}

pub async fn run(config: &Config, args: RunArgs) -> Result<()> {
    if !args.known_faces_dir.is_dir() {
        bail!("known faces directory {} does not exist", args.known_faces_dir.display());
    }
    let target_dir = config.target_dir(&args.target)?;
    let references = list_files(&args.known_faces_dir)?;
    let credentials = config::load_credentials(&config.credentials_path())?;

    let service = Arc::new(HttpPhotoService::new(&config.api_url).context("cannot create API client")?);
    let manager = SessionManager::new(
        SessionConfig {
            credentials,
            settings_path: config.settings_path(),
        },
        service,
    )?;
    let mut session = manager.authenticate().await?;
    info!(user_id = %session.user_id(), "authenticated");

    let target = session.resolve_target(&args.target).await?;
    if !target.is_visible() {
        println!("+ {} is a private account you do not follow; nothing to search.", target.handle);
        return Ok(());
    }

    let photos = FeedPaginator::new(&mut session)
        .with_max_pages(config.max_pages)
        .list_photos(&target)
        .await?;
    println!("+ Found {} photos on {}", photos.len(), target.handle);

    let client = reqwest::Client::builder()
        .timeout(config.download_timeout())
        .build()
        .context("cannot create download client")?;
    let coordinator = DownloadCoordinator::new(
        client,
        DownloadOptions {
            concurrency: config.download_concurrency,
            timeout: config.download_timeout(),
        },
    );
    let report = coordinator
        .download_all(&photos, &target_dir, args.limit, |p| {
            println!("+ Downloaded instagram photo {}/{}", p.completed, p.total);
        })
        .await?;
    println!(
        "+ Downloaded {} photos ({} failed). Saved in {}",
        report.downloaded,
        report.failed,
        report.directory.display()
    );

    let options = MatcherOptions {
        model: args.model,
        tolerance: args.tolerance.unwrap_or(config.tolerance),
    };
    let candidates = run_candidates(&report.stored);
    let outcome = match_photos(config.model_dir.clone(), references, candidates, options).await;

    if args.keep {
        info!(path = %report.directory.display(), "keeping downloaded photos");
    } else {
        remove_run_files(&report.directory, &report.stored).await;
    }

    let found = outcome?;
    println!("+ {} possible match(es) among {} photos", found.len(), report.downloaded);
    Ok(())
}
