//! chroma: offline analysis, frame extraction, mirror export and model setup.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod analyze;
mod frames;
mod remote;
mod setup;

#[derive(Parser, Debug)]
#[command(name = "chroma")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base URL of the chromad HTTP API
    #[arg(long, global = true, env = "CHROMA_URL", default_value = "http://127.0.0.1:8600")]
    url: String,

    /// API key sent as X-API-Key
    #[arg(long, global = true, env = "CHROMA_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze still frames named `{timestamp}_{color}.png` against a reference
    Analyze {
        /// Reference frame (no color shown)
        #[arg(long)]
        reference: PathBuf,

        /// Colored frames
        #[arg(required = true)]
        frames: Vec<PathBuf>,

        /// SCRFD detector model [default: $XDG_DATA_HOME/chroma/models/det_10g.onnx]
        #[arg(long, env = "CHROMA_DETECTOR_MODEL")]
        model: Option<PathBuf>,

        /// TOML file overriding the heuristic tables
        #[arg(long)]
        heuristics: Option<PathBuf>,

        /// Summed channel difference above which a pixel counts as reflected
        #[arg(long, default_value_t = 20)]
        threshold: u32,

        /// Region statistics are computed over (full, face, forehead, cheeks)
        #[arg(long, default_value = "full")]
        region: String,
    },

    /// Extract the frame under each color event of a recorded video
    Frames {
        /// Session video
        video: PathBuf,

        /// Color event log (`color_data` JSON array)
        color_data: PathBuf,

        /// Output directory for `{timestamp}_{color}.png`
        #[arg(long, default_value = "frames")]
        out: PathBuf,
    },

    /// Download every mirrored blob of a session
    Export {
        /// Session id
        session: String,

        /// Output directory; blobs land at `{out}/{key}`
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Show daemon status
    Status,

    /// Download and verify the face detector model
    Setup {
        /// Directory to install into [default: $XDG_DATA_HOME/chroma/models]
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = remote::Client::new(&cli.url, cli.api_key.clone());

    match cli.command {
        Commands::Analyze {
            reference,
            frames,
            model,
            heuristics,
            threshold,
            region,
        } => {
            let model = model.unwrap_or_else(setup::default_model_path);
            analyze::run(
                &reference,
                &frames,
                &model,
                heuristics.as_deref(),
                threshold,
                &region,
            )
        }
        Commands::Frames {
            video,
            color_data,
            out,
        } => frames::run(&video, &color_data, &out),
        Commands::Export { session, out } => client.export(&session, &out),
        Commands::Status => client.status(),
        Commands::Setup { model_dir } => setup::run(model_dir),
    }
}
