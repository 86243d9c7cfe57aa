use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use idcheck_session::Config;

mod document;
mod setup;
mod verify;

#[derive(Parser)]
#[command(name = "idcheck", version, about = "Identity document reading and selfie verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    /// Camera frame, cropped to the capture guide
    Capture,
    /// Uploaded photo, cropped toward the ID-1 card ratio
    Upload,
}

impl From<SourceArg> for document::Source {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Capture => document::Source::Capture,
            SourceArg::Upload => document::Source::Upload,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Download and verify the face models listed in the model manifest
    Setup {
        /// Model directory (defaults to IDCHECK_MODEL_DIR or the per-user data dir)
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Manifest to install; defaults to models.toml inside the model directory
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Read the fields of an identity document image
    Extract {
        image: PathBuf,
        #[arg(long, value_enum, default_value = "upload")]
        source: SourceArg,
        /// JSON file with manually entered fields, replacing extraction
        #[arg(long)]
        manual: Option<PathBuf>,
    },
    /// Run the head-turn challenge over recorded frames and match against the document
    Verify {
        document: PathBuf,
        /// Directory of frames, replayed in file-name order
        frames: PathBuf,
        #[arg(long, value_enum, default_value = "upload")]
        source: SourceArg,
        #[arg(long)]
        manual: Option<PathBuf>,
        /// Frame rate the sequence was recorded at
        #[arg(long, default_value_t = 10)]
        fps: u32,
        /// Let the user proceed with at least three passed checks
        #[arg(long)]
        accept_partial: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let today = chrono::Local::now().date_naive();

    match cli.command {
        Command::Setup {
            model_dir,
            manifest,
        } => {
            let dir = model_dir.unwrap_or_else(|| config.model_dir.clone());
            tokio::task::spawn_blocking(move || setup::run(dir, manifest)).await??;
        }
        Command::Extract {
            image,
            source,
            manual,
        } => {
            document::run(&config, &image, source.into(), manual.as_deref(), today).await?;
        }
        Command::Verify {
            document,
            frames,
            source,
            manual,
            fps,
            accept_partial,
        } => {
            let args = verify::VerifyArgs {
                document: &document,
                source: source.into(),
                frames: &frames,
                manual: manual.as_deref(),
                fps,
                accept_partial,
            };
            if !verify::run(&config, args, today).await? {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
