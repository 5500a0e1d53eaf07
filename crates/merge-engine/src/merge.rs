//! Merge orchestration.
//!
//! Pipeline:
//! 1. Open both recordings (container only, nothing decoded yet)
//! 2. Start the encode session and point a render context at its surface
//! 3. Build the compositor and one external texture per recording
//! 4. Pair one decoded picture from each side, draw them side by side,
//!    present at the output cadence and drain the encoder
//! 5. Release sources, finish the encoder, release GPU objects, in that
//!    order, on every exit path

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use duocam_codec_core::{CodecFactory, GpuDevice, TextureId};
use duocam_common::{
    AppConfig, DriftMeasurement, DuocamError, DuocamResult, EncoderSettings, FrameCadence,
    PipelineSettings, StallWatchdog,
};

use crate::compositor::{create_external_texture, Compositor};
use crate::decode_source::DecodeSource;
use crate::encode_sink::EncodeSink;
use crate::render_context::{Current, RenderContext};

/// Progress callback for merges.
pub type ProgressCallback = Box<dyn Fn(MergeProgress) + Send>;

/// Merge progress report.
#[derive(Debug, Clone, Serialize)]
pub struct MergeProgress {
    /// Frames drawn and handed to the encoder so far.
    pub frames_composited: u64,

    /// Expected output length, from the shorter recording's duration.
    /// Zero when neither container reports one.
    pub estimated_total_frames: u64,

    /// Current progress [0.0, 1.0].
    pub progress: f64,

    pub stage: MergeStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MergeStage {
    Preparing,
    Compositing,
    Finalizing,
    Complete,
    Failed,
}

/// Cooperative cancellation flag shared with the merge task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which recordings to merge and where to write the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeRequest {
    /// Drawn into the left half.
    pub front: PathBuf,
    /// Drawn into the right half.
    pub back: PathBuf,
    pub output: PathBuf,
}

impl MergeRequest {
    pub fn new(front: impl Into<PathBuf>, back: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            front: front.into(),
            back: back.into(),
            output: output.into(),
        }
    }

    /// Write to the configured output location.
    pub fn from_config(front: impl Into<PathBuf>, back: impl Into<PathBuf>, config: &AppConfig) -> Self {
        Self::new(front, back, config.output_path())
    }
}

/// The finished merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputArtifact {
    pub path: PathBuf,
    pub frames: u64,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
}

/// Compositor plus one external texture per recording.
struct Scene {
    compositor: Compositor,
    front: TextureId,
    back: TextureId,
}

impl Scene {
    fn init(current: &Current<'_>, clear_color: [f32; 4]) -> DuocamResult<Self> {
        let compositor = Compositor::init(current, clear_color)?;
        let front = match create_external_texture(current) {
            Ok(texture) => texture,
            Err(e) => {
                let _ = compositor.release(current);
                return Err(e);
            }
        };
        let back = match create_external_texture(current) {
            Ok(texture) => texture,
            Err(e) => {
                let _ = current.gpu().delete_texture(current.id(), front);
                let _ = compositor.release(current);
                return Err(e);
            }
        };
        Ok(Self {
            compositor,
            front,
            back,
        })
    }

    fn release(&self, current: &Current<'_>) {
        for texture in [self.front, self.back] {
            if let Err(e) = current.gpu().delete_texture(current.id(), texture) {
                tracing::warn!(error = %e, "Failed to delete texture");
            }
        }
        if let Err(e) = self.compositor.release(current) {
            tracing::warn!(error = %e, "Failed to delete shader program");
        }
    }
}

struct Reporter {
    callback: Option<ProgressCallback>,
    estimated_total_frames: u64,
}

impl Reporter {
    fn report(&self, frames_composited: u64, stage: MergeStage) {
        let Some(cb) = &self.callback else {
            return;
        };
        let progress = match stage {
            MergeStage::Complete => 1.0,
            _ if self.estimated_total_frames == 0 => 0.0,
            _ => (frames_composited as f64 / self.estimated_total_frames as f64).clamp(0.0, 1.0),
        };
        cb(MergeProgress {
            frames_composited,
            estimated_total_frames: self.estimated_total_frames,
            progress,
            stage,
        });
    }
}

/// Merges a front and a back recording into one side-by-side video.
pub struct MergePipeline {
    codecs: Arc<dyn CodecFactory>,
    gpu: Arc<dyn GpuDevice>,
    encoder: EncoderSettings,
    pipeline: PipelineSettings,
}

impl std::fmt::Debug for MergePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergePipeline")
            .field("codecs", &self.codecs.name())
            .field("gpu", &self.gpu.name())
            .field("encoder", &self.encoder)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl MergePipeline {
    pub fn new(codecs: Arc<dyn CodecFactory>, gpu: Arc<dyn GpuDevice>, config: &AppConfig) -> Self {
        Self::with_settings(codecs, gpu, config.encoder.clone(), config.pipeline.clone())
    }

    pub fn with_settings(
        codecs: Arc<dyn CodecFactory>,
        gpu: Arc<dyn GpuDevice>,
        encoder: EncoderSettings,
        pipeline: PipelineSettings,
    ) -> Self {
        Self {
            codecs,
            gpu,
            encoder,
            pipeline,
        }
    }

    pub fn encoder_settings(&self) -> &EncoderSettings {
        &self.encoder
    }

    pub fn codecs(&self) -> &Arc<dyn CodecFactory> {
        &self.codecs
    }

    /// Run a merge to completion on the calling thread.
    ///
    /// On failure nothing is left at `request.output`, and every codec
    /// session and GPU object opened along the way has been released.
    pub fn merge(
        &self,
        request: &MergeRequest,
        cancel: &CancelToken,
        progress: Option<ProgressCallback>,
    ) -> DuocamResult<OutputArtifact> {
        let started = Instant::now();
        let mut reporter = Reporter {
            callback: progress,
            estimated_total_frames: 0,
        };
        reporter.report(0, MergeStage::Preparing);
        tracing::info!(
            front = %request.front.display(),
            back = %request.back.display(),
            output = %request.output.display(),
            backend = self.codecs.name(),
            gpu = self.gpu.name(),
            "Starting merge"
        );

        match self.run(request, cancel, &mut reporter) {
            Ok(artifact) => {
                reporter.report(artifact.frames, MergeStage::Complete);
                tracing::info!(
                    output = %artifact.path.display(),
                    frames = artifact.frames,
                    duration_secs = artifact.duration_secs,
                    bytes = artifact.bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Merge complete"
                );
                Ok(artifact)
            }
            Err(e) => {
                remove_partial_output(&request.output);
                reporter.report(0, MergeStage::Failed);
                match e {
                    DuocamError::Cancelled => tracing::warn!("Merge cancelled"),
                    ref other => tracing::error!(
                        error = %other,
                        kind = ?other.kind(),
                        "Merge failed"
                    ),
                }
                Err(e)
            }
        }
    }

    /// Run [`MergePipeline::merge`] on tokio's blocking pool.
    pub async fn merge_async(
        self: Arc<Self>,
        request: MergeRequest,
        cancel: CancelToken,
        progress: Option<ProgressCallback>,
    ) -> DuocamResult<OutputArtifact> {
        tokio::task::spawn_blocking(move || self.merge(&request, &cancel, progress))
            .await
            .map_err(|e| DuocamError::Other(anyhow::anyhow!("merge task failed: {e}")))?
    }

    fn run(
        &self,
        request: &MergeRequest,
        cancel: &CancelToken,
        reporter: &mut Reporter,
    ) -> DuocamResult<OutputArtifact> {
        self.encoder.validate()?;
        if cancel.is_cancelled() {
            return Err(DuocamError::Cancelled);
        }

        // Both inputs are vetted before any encoder or GPU session exists.
        let timeout = self.pipeline.codec_timeout();
        let mut front = DecodeSource::open(self.codecs.as_ref(), &request.front, timeout)?;
        let mut back = DecodeSource::open(self.codecs.as_ref(), &request.back, timeout)?;

        let cadence = FrameCadence::new(self.encoder.frame_rate);
        reporter.estimated_total_frames = match (front.duration_us(), back.duration_us()) {
            (Some(a), Some(b)) => cadence.frames_for_duration_us(a.min(b)),
            (Some(d), None) | (None, Some(d)) => cadence.frames_for_duration_us(d),
            (None, None) => 0,
        };

        let sink = EncodeSink::new(
            self.codecs.clone(),
            &request.output,
            self.encoder.clone(),
            &self.pipeline,
        );
        let surface = sink.init()?;

        let mut render = match RenderContext::init(self.gpu.clone(), &surface) {
            Ok(render) => render,
            Err(e) => {
                front.release();
                back.release();
                sink.finish();
                return Err(e);
            }
        };

        let mut scene = None;
        let composited = self.composite(
            &mut front,
            &mut back,
            &sink,
            &render,
            &mut scene,
            cancel,
            reporter,
        );

        reporter.report(*composited.as_ref().unwrap_or(&0), MergeStage::Finalizing);
        front.release();
        back.release();
        sink.finish();
        if let Some(scene) = scene.take() {
            match render.make_current() {
                Ok(current) => scene.release(&current),
                Err(e) => tracing::warn!(error = %e, "Could not bind context to release GPU objects"),
            }
        }
        render.release();

        let frames = composited?;
        if let Some(failure) = sink.failure() {
            return Err(DuocamError::encoder_session(failure));
        }
        if frames == 0 {
            return Err(DuocamError::NoFramesComposited);
        }

        let bytes = std::fs::metadata(&request.output)?.len();
        Ok(OutputArtifact {
            path: request.output.clone(),
            frames,
            duration_secs: cadence.duration_secs(frames),
            width: self.encoder.width,
            height: self.encoder.height,
            bytes,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn composite(
        &self,
        front: &mut DecodeSource,
        back: &mut DecodeSource,
        sink: &EncodeSink,
        render: &RenderContext,
        scene: &mut Option<Scene>,
        cancel: &CancelToken,
        reporter: &Reporter,
    ) -> DuocamResult<u64> {
        let scene = {
            let current = render.make_current()?;
            &*scene.insert(Scene::init(&current, self.pipeline.clear_color)?)
        };
        front.start(self.codecs.as_ref())?;
        back.start(self.codecs.as_ref())?;

        let cadence = FrameCadence::new(self.encoder.frame_rate);
        let mut watchdog = StallWatchdog::new(self.pipeline.stall_timeout());
        let mut drift_warned = false;
        let mut frames = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(DuocamError::Cancelled);
            }

            let activity = front.activity() + back.activity();
            let front_live = pull(front)?;
            let back_live = pull(back)?;
            if front.activity() + back.activity() != activity {
                watchdog.progressed();
            }

            if front.has_pending_frame() && back.has_pending_frame() {
                let current = render.make_current()?;
                let gpu = current.gpu();
                let front_pts = gpu.update_tex_image(current.id(), scene.front, front.surface_texture())?;
                let back_pts = gpu.update_tex_image(current.id(), scene.back, back.surface_texture())?;

                if let (Some(reference_us), Some(measured_us)) = (front_pts, back_pts) {
                    let drift = DriftMeasurement {
                        reference_us,
                        measured_us,
                    };
                    if !drift_warned && drift.exceeds_threshold_ms(self.pipeline.drift_warn_ms) {
                        drift_warned = true;
                        tracing::warn!(
                            frame = frames,
                            drift_ms = drift.drift_ms(),
                            threshold_ms = self.pipeline.drift_warn_ms,
                            "Front and back recordings have drifted apart"
                        );
                    }
                }

                scene.compositor.clear(&current)?;
                scene.compositor.draw_split(&current, scene.front, scene.back)?;
                render.present(cadence.pts_us(frames))?;

                // Presenting already wrote into the encoder's surface.
                sink.encode_frame(|_| {});
                if sink.is_failed() {
                    return Err(DuocamError::encoder_session(
                        sink.failure()
                            .unwrap_or_else(|| "encoder session failed".to_string()),
                    ));
                }

                frames += 1;
                watchdog.progressed();
                reporter.report(frames, MergeStage::Compositing);
                tracing::trace!(frame = frames, ?front_pts, ?back_pts, "Composited frame");
                continue;
            }

            if !front_live || !back_live {
                tracing::info!(
                    frames,
                    front_exhausted = !front_live,
                    back_exhausted = !back_live,
                    "Input exhausted; stopping at the shorter recording"
                );
                return Ok(frames);
            }

            if watchdog.is_stalled() {
                return Err(DuocamError::codec(format!(
                    "decoders made no progress for {:?}",
                    watchdog.idle()
                )));
            }
            if activity == front.activity() + back.activity() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Advance `source` unless it already holds an unlatched picture. Returns
/// whether the source can still contribute a picture.
fn pull(source: &mut DecodeSource) -> DuocamResult<bool> {
    if source.has_pending_frame() {
        return Ok(true);
    }
    let more = source.has_next_frame()?;
    Ok(more || source.has_pending_frame())
}

fn remove_partial_output(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial output"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_request_from_config_uses_output_path() {
        let config = AppConfig {
            output_dir: PathBuf::from("/tmp/duocam"),
            ..AppConfig::default()
        };
        let request = MergeRequest::from_config("front.mp4", "back.mp4", &config);
        assert_eq!(request.output, PathBuf::from("/tmp/duocam/merged_output.mp4"));
    }

    #[test]
    fn test_progress_is_clamped() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = Reporter {
            callback: Some(Box::new(move |p: MergeProgress| {
                sink.lock().unwrap().push((p.progress, p.stage));
            })),
            estimated_total_frames: 10,
        };
        reporter.report(5, MergeStage::Compositing);
        reporter.report(12, MergeStage::Compositing);
        reporter.report(12, MergeStage::Complete);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (0.5, MergeStage::Compositing));
        assert_eq!(seen[1], (1.0, MergeStage::Compositing));
        assert_eq!(seen[2], (1.0, MergeStage::Complete));
    }
}
