//! DuoCam CLI: merge front and back camera recordings side by side.
//!
//! Usage:
//!   duocam merge <FRONT> <BACK>   Merge two recordings into one video
//!   duocam probe <PATH>           List a recording's tracks
//!   duocam check                  Check codec backend availability

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod backend;
mod commands;

use backend::Backend;

#[derive(Parser)]
#[command(
    name = "duocam",
    about = "Side-by-side merging of dual-camera recordings",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the per-user config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge a front and a back recording
    Merge {
        /// Front camera recording (left half)
        front: PathBuf,

        /// Back camera recording (right half)
        back: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Codec backend
        #[arg(long, value_enum, default_value_t = Backend::Gst)]
        backend: Backend,

        /// Output width
        #[arg(long)]
        width: Option<u32>,

        /// Output height
        #[arg(long)]
        height: Option<u32>,

        /// Target bitrate in bits per second
        #[arg(long)]
        bitrate: Option<u32>,

        /// Output frame rate
        #[arg(long)]
        fps: Option<u32>,

        /// Seconds between key frames
        #[arg(long)]
        keyframe_interval: Option<u32>,

        /// Publish the merged video into this library directory
        #[arg(long)]
        publish_dir: Option<PathBuf>,
    },

    /// List the tracks of a recording
    Probe {
        /// Path to the recording
        path: PathBuf,

        /// Codec backend
        #[arg(long, value_enum, default_value_t = Backend::Gst)]
        backend: Backend,
    },

    /// Check codec backend availability
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => duocam_common::config::AppConfig::load_from(path),
        None => duocam_common::config::AppConfig::load(),
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    duocam_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Merge {
            front,
            back,
            output,
            backend,
            width,
            height,
            bitrate,
            fps,
            keyframe_interval,
            publish_dir,
        } => {
            let overrides = commands::merge::EncoderOverrides {
                width,
                height,
                bit_rate: bitrate,
                frame_rate: fps,
                key_frame_interval_secs: keyframe_interval,
            };
            commands::merge::run(
                config,
                front,
                back,
                output,
                backend,
                overrides,
                publish_dir,
            )
            .await
        }
        Commands::Probe { path, backend } => commands::probe::run(path, backend),
        Commands::Check => commands::check::run(),
    }
}
