mod config;
mod pipeline;

use clap::{Parser, Subcommand};
use lookout_core::DetectionModel;
use lookout_remote::ServiceError;
use pipeline::RunArgs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "lookout", about = "Find photos of a known person in an account's feed")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a target's photos and report those showing a known face
    Run {
        /// Directory of reference photos, one known face each
        known_faces_dir: PathBuf,
        /// Account handle to search
        target_handle: String,
        /// Maximum photos to download (-1 for all)
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        limit: i64,
        /// Face detection model: fast or accurate
        #[arg(short, long, default_value_t = DetectionModel::Fast)]
        model: DetectionModel,
        /// Match tolerance; lower is stricter (default: LOOKOUT_TOLERANCE or 0.6)
        ///
        /// Euclidean distance between L2-normalized ArcFace embeddings. The
        /// default 0.6 equals a cosine similarity of at least 0.82. A cosine
        /// threshold of 0.40 corresponds to a distance of about 1.10.
        #[arg(short, long)]
        tolerance: Option<f32>,
        /// Keep the downloaded photos instead of deleting them
        #[arg(long)]
        keep: bool,
    },
}

/// Print an error, plus the challenge link and title when the service sent them.
fn report(err: &anyhow::Error) {
    eprintln!("error: {err:#}");
    let api = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ServiceError>())
        .and_then(ServiceError::api);
    if let Some(api) = api {
        if let Some(url) = &api.challenge_url {
            eprintln!("Please follow this link to complete the challenge: {url}");
        }
        if let Some(title) = &api.error_title {
            eprintln!("{title}");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::Config::from_env();

    let result = match cli.command {
        Commands::Run {
            known_faces_dir,
            target_handle,
            limit,
            model,
            tolerance,
            keep,
        } => {
            let args = RunArgs {
                known_faces_dir,
                target: target_handle,
                limit,
                model,
                tolerance,
                keep,
            };
            pipeline::run(&config, args).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
