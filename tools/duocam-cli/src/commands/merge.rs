//! Merge two recordings.

use std::path::PathBuf;
use std::sync::Arc;

use duocam_common::AppConfig;
use duocam_merge_engine::{
    merge_and_publish, CancelToken, LocalDirectoryPublisher, MergePipeline, MergeProgress,
    MergeRequest, MergeStage, ProgressCallback,
};

use crate::backend::Backend;

/// Command-line replacements for the configured encoder values.
#[derive(Debug, Default)]
pub struct EncoderOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bit_rate: Option<u32>,
    pub frame_rate: Option<u32>,
    pub key_frame_interval_secs: Option<u32>,
}

impl EncoderOverrides {
    fn apply(&self, config: &mut AppConfig) {
        let enc = &mut config.encoder;
        if let Some(v) = self.width {
            enc.width = v;
        }
        if let Some(v) = self.height {
            enc.height = v;
        }
        if let Some(v) = self.bit_rate {
            enc.bit_rate = v;
        }
        if let Some(v) = self.frame_rate {
            enc.frame_rate = v;
        }
        if let Some(v) = self.key_frame_interval_secs {
            enc.key_frame_interval_secs = v;
        }
    }
}

pub async fn run(
    mut config: AppConfig,
    front: PathBuf,
    back: PathBuf,
    output: Option<PathBuf>,
    backend: Backend,
    overrides: EncoderOverrides,
    publish_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    overrides.apply(&mut config);
    backend.adapt(&mut config.encoder);
    let codecs = backend.codecs()?;
    let gpu = backend.gpu()?;

    let output = output
        .unwrap_or_else(|| config.output_path())
        .with_extension(backend.container().extension());
    let request = MergeRequest::new(front, back, output);
    tracing::debug!(encoder = ?config.encoder, pipeline = ?config.pipeline, "Resolved merge settings");

    println!("Merging recordings");
    println!("  Front: {}", request.front.display());
    println!("  Back: {}", request.back.display());
    println!("  Output: {}", request.output.display());
    println!(
        "  Encoder: {} {}x{} @ {}fps, {} kbps ({} backend, {} renderer)",
        config.encoder.mime,
        config.encoder.width,
        config.encoder.height,
        config.encoder.frame_rate,
        config.encoder.bit_rate / 1000,
        codecs.name(),
        gpu.name(),
    );

    let pipeline = Arc::new(MergePipeline::new(codecs, gpu, &config));

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, cancelling merge...");
            on_interrupt.cancel();
        }
    });

    let progress_cb: ProgressCallback = Box::new(|p: MergeProgress| {
        if p.stage != MergeStage::Compositing || p.frames_composited % 15 == 0 {
            print!(
                "\r  Progress: {:.1}% ({}/{} frames, {:?})  ",
                p.progress * 100.0,
                p.frames_composited,
                p.estimated_total_frames,
                p.stage,
            );
        }
    });

    match publish_dir {
        Some(dir) => {
            let publisher = LocalDirectoryPublisher::new(dir);
            let outcome = tokio::task::spawn_blocking(move || {
                merge_and_publish(&pipeline, &request, &publisher, &cancel, Some(progress_cb))
            })
            .await?;
            println!("\n{}", outcome.message);
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        None => match pipeline.merge_async(request, cancel, Some(progress_cb)).await {
            Ok(artifact) => {
                println!(
                    "\nMerge complete: {} ({} frames, {:.2}s, {} bytes)",
                    artifact.path.display(),
                    artifact.frames,
                    artifact.duration_secs,
                    artifact.bytes,
                );
            }
            Err(e) => {
                println!("\nMerge failed: {}", e.user_message());
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_only_given_values() {
        let mut config = AppConfig::default();
        EncoderOverrides {
            width: Some(1280),
            frame_rate: Some(24),
            ..EncoderOverrides::default()
        }
        .apply(&mut config);
        assert_eq!(config.encoder.width, 1280);
        assert_eq!(config.encoder.height, 1080);
        assert_eq!(config.encoder.frame_rate, 24);
        assert_eq!(config.encoder.bit_rate, 5_000_000);
    }
}
