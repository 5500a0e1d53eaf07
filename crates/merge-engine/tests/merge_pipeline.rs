use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use duocam_codec_core::{CodecFactory, GpuDevice, VideoFrame, MIME_RAW_VIDEO};
use duocam_common::{DuocamError, EncoderSettings, FailureKind, PipelineSettings};
use duocam_merge_engine::{
    merge_and_publish, CancelToken, LocalDirectoryPublisher, MergePipeline, MergeProgress,
    MergeRequest, MergeStage, ProgressCallback,
};
use duocam_software::{read_clip, write_clip, SoftwareCodecFactory, SoftwareGpu};

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

fn clip(dir: &Path, name: &str, seconds: u32, color: [u8; 4]) -> PathBuf {
    let path = dir.join(name);
    let frames = (0..seconds * 30).map(|_| VideoFrame::filled(16, 8, 0, color));
    write_clip(&path, 16, 8, 30, frames).expect("clip should be written");
    path
}

fn wav(dir: &Path, name: &str) -> PathBuf {
    let samples = [0u8; 64];
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + samples.len() as u32).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&8_000u32.to_le_bytes());
    bytes.extend_from_slice(&16_000u32.to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&samples);
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

struct Harness {
    codecs: SoftwareCodecFactory,
    gpu: Arc<SoftwareGpu>,
    pipeline: MergePipeline,
}

fn harness() -> Harness {
    let codecs = SoftwareCodecFactory::new();
    let gpu = Arc::new(SoftwareGpu::new());
    let encoder = EncoderSettings {
        mime: MIME_RAW_VIDEO.to_string(),
        width: 16,
        height: 8,
        ..EncoderSettings::default()
    };
    let pipeline = MergePipeline::with_settings(
        Arc::new(codecs.clone()),
        gpu.clone(),
        encoder,
        PipelineSettings::default(),
    );
    Harness {
        codecs,
        gpu,
        pipeline,
    }
}

fn assert_nothing_leaked(h: &Harness) {
    assert_eq!(h.codecs.resources().total(), 0, "codec sessions leaked");
    assert!(h.gpu.object_counts().is_empty(), "GPU objects leaked");
}

#[test]
fn shorter_input_bounds_output() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness();
    let request = MergeRequest::new(
        clip(dir.path(), "front.y4m", 5, RED),
        clip(dir.path(), "back.y4m", 3, BLUE),
        dir.path().join("out").join("merged_output.y4m"),
    );

    let artifact = h
        .pipeline
        .merge(&request, &CancelToken::new(), None)
        .expect("merge should succeed");

    assert_eq!(artifact.frames, 90);
    assert!((artifact.duration_secs - 3.0).abs() <= 1.0 / 30.0);
    assert_eq!((artifact.width, artifact.height), (16, 8));
    assert!(artifact.bytes > 0);

    let mut extractor = h.codecs.create_extractor(&artifact.path).unwrap();
    assert_eq!(extractor.track_count(), 1);
    extractor.release();

    let (header, frames) = read_clip(&artifact.path).unwrap();
    assert_eq!((header.width, header.height), (16, 8));
    assert_eq!(frames.len(), 90);
    assert!((header.frame_rate() - 30.0).abs() < 1e-9);

    let first = &frames[0];
    let left = first.pixel(3, 4);
    let right = first.pixel(12, 4);
    assert!(left[0] > 200 && left[2] < 60, "left half should be red: {left:?}");
    assert!(right[2] > 200 && right[0] < 60, "right half should be blue: {right:?}");

    assert_nothing_leaked(&h);
}

#[test]
fn missing_front_fails_setup_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness();
    let output = dir.path().join("merged_output.y4m");
    let request = MergeRequest::new(
        dir.path().join("does-not-exist.y4m"),
        clip(dir.path(), "back.y4m", 1, BLUE),
        &output,
    );

    let err = h
        .pipeline
        .merge(&request, &CancelToken::new(), None)
        .unwrap_err();

    assert!(matches!(err, DuocamError::FileNotFound { .. }), "{err}");
    assert_eq!(err.kind(), FailureKind::Setup);
    assert!(!output.exists());
    assert_eq!(h.codecs.ledger().acquired_total(), 0, "back must never be opened");
    assert_nothing_leaked(&h);
}

#[test]
fn input_without_video_fails_before_encoder_exists() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness();
    let output = dir.path().join("merged_output.y4m");
    let request = MergeRequest::new(
        clip(dir.path(), "front.y4m", 1, RED),
        wav(dir.path(), "back.wav"),
        &output,
    );

    let err = h
        .pipeline
        .merge(&request, &CancelToken::new(), None)
        .unwrap_err();

    assert!(matches!(err, DuocamError::NoVideoTrack { .. }), "{err}");
    assert_eq!(err.kind(), FailureKind::Setup);
    // Two extractors, nothing else.
    assert_eq!(h.codecs.ledger().acquired_total(), 2);
    assert_eq!(h.gpu.object_counts().contexts, 0);
    assert!(!output.exists());
    assert_nothing_leaked(&h);
}

#[test]
fn cancellation_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness();
    let output = dir.path().join("merged_output.y4m");
    let request = MergeRequest::new(
        clip(dir.path(), "front.y4m", 2, RED),
        clip(dir.path(), "back.y4m", 2, BLUE),
        &output,
    );

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let progress: ProgressCallback = Box::new(move |p: MergeProgress| {
        if p.frames_composited >= 10 {
            trigger.cancel();
        }
    });

    let err = h
        .pipeline
        .merge(&request, &cancel, Some(progress))
        .unwrap_err();

    assert!(matches!(err, DuocamError::Cancelled));
    assert_eq!(err.kind(), FailureKind::Cancelled);
    assert!(!output.exists());
    assert_nothing_leaked(&h);
}

#[test]
fn progress_walks_through_stages() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness();
    let request = MergeRequest::new(
        clip(dir.path(), "front.y4m", 1, RED),
        clip(dir.path(), "back.y4m", 1, BLUE),
        dir.path().join("merged_output.y4m"),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress: ProgressCallback = Box::new(move |p: MergeProgress| sink.lock().unwrap().push(p));
    h.pipeline
        .merge(&request, &CancelToken::new(), Some(progress))
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first().unwrap().stage, MergeStage::Preparing);
    let last = seen.last().unwrap();
    assert_eq!(last.stage, MergeStage::Complete);
    assert_eq!(last.frames_composited, 30);
    assert_eq!(last.estimated_total_frames, 30);
    assert!(seen.iter().any(|p| p.stage == MergeStage::Finalizing));
    let compositing: Vec<_> = seen
        .iter()
        .filter(|p| p.stage == MergeStage::Compositing)
        .collect();
    assert_eq!(compositing.len(), 30);
    assert!(compositing.windows(2).all(|w| w[0].progress <= w[1].progress));
}

#[test]
fn invalid_settings_are_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let codecs = SoftwareCodecFactory::new();
    let pipeline = MergePipeline::with_settings(
        Arc::new(codecs.clone()),
        Arc::new(SoftwareGpu::new()),
        EncoderSettings {
            mime: MIME_RAW_VIDEO.to_string(),
            width: 15,
            height: 8,
            ..EncoderSettings::default()
        },
        PipelineSettings::default(),
    );
    let request = MergeRequest::new(
        clip(dir.path(), "front.y4m", 1, RED),
        clip(dir.path(), "back.y4m", 1, BLUE),
        dir.path().join("merged_output.y4m"),
    );
    let err = pipeline
        .merge(&request, &CancelToken::new(), None)
        .unwrap_err();
    assert!(matches!(err, DuocamError::Config { .. }));
    assert_eq!(codecs.ledger().acquired_total(), 0);
}

#[test]
fn merge_then_publish() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness();
    let request = MergeRequest::new(
        clip(dir.path(), "front.y4m", 1, RED),
        clip(dir.path(), "back.y4m", 1, BLUE),
        dir.path().join("merged_output.y4m"),
    );
    let publisher = LocalDirectoryPublisher::new(dir.path().join("library"));

    let outcome = merge_and_publish(
        &h.pipeline,
        &request,
        &publisher,
        &CancelToken::new(),
        None,
    );
    assert!(outcome.is_success(), "{}", outcome.message);
    assert!(outcome.message.starts_with("✅ Uploaded"));
    assert_eq!(publisher.records().unwrap().len(), 1);

    let failed = merge_and_publish(
        &h.pipeline,
        &MergeRequest::new(
            dir.path().join("missing.y4m"),
            dir.path().join("back.y4m"),
            dir.path().join("second.y4m"),
        ),
        &publisher,
        &CancelToken::new(),
        None,
    );
    assert!(!failed.is_success());
    assert!(failed.message.starts_with("❌ Merge failed"));
    assert_eq!(publisher.records().unwrap().len(), 1);
}

#[tokio::test]
async fn merge_runs_on_blocking_pool() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness();
    let request = MergeRequest::new(
        clip(dir.path(), "front.y4m", 1, RED),
        clip(dir.path(), "back.y4m", 1, BLUE),
        dir.path().join("merged_output.y4m"),
    );
    let pipeline = Arc::new(h.pipeline);
    let artifact = pipeline
        .merge_async(request, CancelToken::new(), None)
        .await
        .unwrap();
    assert_eq!(artifact.frames, 30);
    assert_eq!(h.codecs.resources().total(), 0);
}
