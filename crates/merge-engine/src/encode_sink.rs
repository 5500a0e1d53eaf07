//! Encoder + muxer session consuming frames from a shared input surface.
//!
//! ```text
//! Uninitialized ──init──▶ Started ──finish──▶ Finished ──▶ Released
//!                            │                    │
//!                            └──── codec error ───┴──▶ Failed
//! ```
//!
//! Transitions and drains happen under one lock; the per-frame render
//! callback runs with it released. Calls that do not fit the current state
//! are logged and ignored. A codec or muxer error during
//! a drain tears the session down and parks it in `Failed`; the merge
//! pipeline checks for that state itself.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use duocam_codec_core::{
    CodecFactory, ContainerFormat, MediaFormat, MediaMuxer, OutputEvent, Surface, VideoEncoder,
};
use duocam_common::{DuocamError, DuocamResult, EncoderSettings, PipelineSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Uninitialized,
    Started,
    Finished,
    Released,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkStats {
    pub samples_written: u64,
    pub bytes_written: u64,
    pub buffers_released: u64,
}

struct Inner {
    state: SinkState,
    encoder: Option<Box<dyn VideoEncoder>>,
    muxer: Option<Box<dyn MediaMuxer>>,
    surface: Option<Surface>,
    track: Option<usize>,
    muxer_started: bool,
    failure: Option<String>,
    stats: SinkStats,
}

pub struct EncodeSink {
    codecs: Arc<dyn CodecFactory>,
    output: PathBuf,
    container: ContainerFormat,
    settings: EncoderSettings,
    eos_poll: Duration,
    eos_deadline: Duration,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for EncodeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeSink")
            .field("output", &self.output)
            .field("container", &self.container)
            .field("state", &self.state())
            .finish()
    }
}

impl EncodeSink {
    pub fn new(
        codecs: Arc<dyn CodecFactory>,
        output: &Path,
        settings: EncoderSettings,
        pipeline: &PipelineSettings,
    ) -> Self {
        Self {
            codecs,
            output: output.to_path_buf(),
            container: ContainerFormat::from_path(output),
            settings,
            eos_poll: pipeline.eos_poll(),
            eos_deadline: pipeline.eos_drain_timeout(),
            inner: Mutex::new(Inner {
                state: SinkState::Uninitialized,
                encoder: None,
                muxer: None,
                surface: None,
                track: None,
                muxer_started: false,
                failure: None,
                stats: SinkStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    pub fn state(&self) -> SinkState {
        self.lock().state
    }

    pub fn is_failed(&self) -> bool {
        self.state() == SinkState::Failed
    }

    /// Why the session failed, if it did.
    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    pub fn stats(&self) -> SinkStats {
        self.lock().stats
    }

    /// Surface the render context should draw into. `None` before `init`
    /// and after the session ends.
    pub fn input_surface(&self) -> Option<Surface> {
        self.lock().surface.clone()
    }

    /// Format handed to the encoder.
    pub fn encoder_format(&self) -> MediaFormat {
        let s = &self.settings;
        MediaFormat::video(s.mime.clone(), s.width, s.height)
            .with_frame_rate(s.frame_rate as f64)
            .with_bit_rate(s.bit_rate)
            .with_key_frame_interval(s.key_frame_interval_secs)
    }

    /// Configure and start the encoder and open the muxer. Returns the
    /// encoder's input surface.
    pub fn init(&self) -> DuocamResult<Surface> {
        let mut inner = self.lock();
        if inner.state != SinkState::Uninitialized {
            tracing::warn!(state = ?inner.state, "init() called in invalid state");
            return Err(DuocamError::encoder_session(format!(
                "init while {:?}",
                inner.state
            )));
        }

        let format = self.encoder_format();
        let mut encoder = self.codecs.create_encoder(&format.mime)?;
        let surface = match Self::start_encoder(encoder.as_mut(), &format) {
            Ok(surface) => surface,
            Err(e) => {
                encoder.release();
                return Err(e);
            }
        };
        let muxer = match self.codecs.create_muxer(&self.output, self.container) {
            Ok(muxer) => muxer,
            Err(e) => {
                let _ = encoder.stop();
                encoder.release();
                surface.release();
                return Err(e);
            }
        };

        tracing::info!(
            output = %self.output.display(),
            mime = %format.mime,
            width = self.settings.width,
            height = self.settings.height,
            bit_rate = self.settings.bit_rate,
            frame_rate = self.settings.frame_rate,
            "Encode session started"
        );
        inner.encoder = Some(encoder);
        inner.muxer = Some(muxer);
        inner.surface = Some(surface.clone());
        inner.state = SinkState::Started;
        Ok(surface)
    }

    fn start_encoder(encoder: &mut dyn VideoEncoder, format: &MediaFormat) -> DuocamResult<Surface> {
        encoder.configure(format)?;
        let surface = encoder.create_input_surface()?;
        encoder.start()?;
        Ok(surface)
    }

    /// Run `render` against the input surface, then drain whatever the
    /// encoder has produced without waiting for more. Skipped, without
    /// calling `render`, unless the session is started. `render` may call
    /// back into the sink. Returns whether the frame was accepted.
    pub fn encode_frame<F>(&self, render: F) -> bool
    where
        F: FnOnce(&Surface),
    {
        let surface = {
            let inner = self.lock();
            if inner.state != SinkState::Started {
                tracing::warn!(state = ?inner.state, "encode_frame() called in invalid state, skipping");
                return false;
            }
            inner.surface.clone()
        };
        if let Some(surface) = &surface {
            render(surface);
        }

        let mut inner = self.lock();
        if inner.state != SinkState::Started {
            tracing::warn!(state = ?inner.state, "Session ended while rendering, skipping drain");
            return false;
        }
        self.drain(&mut inner, false);
        inner.state == SinkState::Started
    }

    /// Signal end of input, drain everything, then shut the encoder and
    /// muxer down. A second call is a logged no-op.
    pub fn finish(&self) {
        let mut inner = self.lock();
        match inner.state {
            SinkState::Started | SinkState::Finished => {}
            SinkState::Released => {
                tracing::warn!("finish() called after already released");
                return;
            }
            other => {
                tracing::warn!(state = ?other, "finish() called in invalid state");
                return;
            }
        }
        inner.state = SinkState::Finished;

        if let Some(encoder) = inner.encoder.as_mut() {
            if let Err(e) = encoder.signal_end_of_input_stream() {
                tracing::error!(error = %e, "Failed to signal end of input stream");
            }
        }

        self.drain(&mut inner, true);
        if inner.state == SinkState::Failed {
            return;
        }

        if let Some(mut encoder) = inner.encoder.take() {
            if let Err(e) = encoder.stop() {
                tracing::error!(error = %e, "Error stopping encoder");
            }
            encoder.release();
        }
        let mut muxer_failure = None;
        if let Some(mut muxer) = inner.muxer.take() {
            if inner.muxer_started {
                if let Err(e) = muxer.stop() {
                    tracing::error!(error = %e, "Error stopping muxer");
                    muxer_failure = Some(e.to_string());
                }
            }
            muxer.release();
        }
        inner.surface = None;

        if let Some(message) = muxer_failure {
            inner.failure = Some(message);
            inner.state = SinkState::Failed;
            return;
        }
        inner.state = SinkState::Released;
        tracing::info!(
            output = %self.output.display(),
            samples = inner.stats.samples_written,
            bytes = inner.stats.bytes_written,
            "Encode session finished"
        );
    }

    /// Tear the session down without draining. Used when a merge is
    /// abandoned before `finish`.
    pub fn abort(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, SinkState::Released | SinkState::Failed) {
            return;
        }
        Self::teardown(&mut inner);
        inner.state = SinkState::Released;
        tracing::debug!(output = %self.output.display(), "Encode session aborted");
    }

    fn teardown(inner: &mut Inner) {
        if let Some(mut encoder) = inner.encoder.take() {
            let _ = encoder.stop();
            encoder.release();
        }
        if let Some(mut muxer) = inner.muxer.take() {
            muxer.release();
        }
        if let Some(surface) = inner.surface.take() {
            surface.release();
        }
    }

    fn drain(&self, inner: &mut Inner, end_of_stream: bool) {
        if !matches!(inner.state, SinkState::Started | SinkState::Finished) {
            return;
        }
        if let Err(e) = self.try_drain(inner, end_of_stream) {
            tracing::error!(error = %e, end_of_stream, "Encoder drain failed; session released");
            inner.failure = Some(e.to_string());
            Self::teardown(inner);
            inner.state = SinkState::Failed;
        }
    }

    fn try_drain(&self, inner: &mut Inner, end_of_stream: bool) -> DuocamResult<()> {
        let Inner {
            encoder,
            muxer,
            track,
            muxer_started,
            stats,
            ..
        } = inner;
        let (Some(encoder), Some(muxer)) = (encoder.as_mut(), muxer.as_mut()) else {
            return Err(DuocamError::encoder_session("encoder or muxer missing"));
        };
        let timeout = if end_of_stream {
            self.eos_poll
        } else {
            Duration::ZERO
        };
        let deadline = Instant::now() + self.eos_deadline;

        loop {
            match encoder.dequeue_output_buffer(timeout)? {
                OutputEvent::TryAgainLater => {
                    if !end_of_stream {
                        break;
                    }
                    if Instant::now() >= deadline {
                        return Err(DuocamError::encoder_session(format!(
                            "encoder did not reach end of stream within {:?}",
                            self.eos_deadline
                        )));
                    }
                }
                OutputEvent::FormatChanged => {
                    if *muxer_started {
                        return Err(DuocamError::encoder_session(
                            "encoder output format changed twice",
                        ));
                    }
                    let format = encoder.output_format()?;
                    tracing::info!(mime = %format.mime, "Output format known; starting muxer");
                    *track = Some(muxer.add_track(&format)?);
                    muxer.start()?;
                    *muxer_started = true;
                }
                OutputEvent::Buffer { index, info } => {
                    if info.size != 0 && *muxer_started {
                        let track = track.ok_or_else(|| {
                            DuocamError::encoder_session("muxer started without a track")
                        })?;
                        let data = encoder.output_buffer(index)?;
                        muxer.write_sample_data(track, data, &info)?;
                        stats.samples_written += 1;
                        stats.bytes_written += info.size as u64;
                        tracing::trace!(
                            size = info.size,
                            pts_us = info.presentation_time_us,
                            "Wrote sample"
                        );
                    }
                    encoder.release_output_buffer(index)?;
                    stats.buffers_released += 1;
                    if info.is_end_of_stream() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for EncodeSink {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duocam_codec_core::{VideoFrame, MIME_RAW_VIDEO};
    use duocam_software::{read_clip, SoftwareCodecFactory};

    fn settings() -> EncoderSettings {
        EncoderSettings {
            mime: MIME_RAW_VIDEO.to_string(),
            width: 8,
            height: 4,
            ..EncoderSettings::default()
        }
    }

    fn sink(codecs: &SoftwareCodecFactory, path: &Path) -> EncodeSink {
        EncodeSink::new(
            Arc::new(codecs.clone()),
            path,
            settings(),
            &PipelineSettings::default(),
        )
    }

    #[test]
    fn test_frames_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.y4m");
        let codecs = SoftwareCodecFactory::new();
        let sink = sink(&codecs, &path);
        let surface = sink.init().unwrap();
        assert_eq!(sink.state(), SinkState::Started);
        assert!(sink.input_surface().unwrap().same_as(&surface));

        for i in 0..3 {
            let accepted = sink.encode_frame(|s| {
                s.queue_frame(VideoFrame::filled(8, 4, i * 33_333, [9, 9, 9, 255]))
                    .unwrap();
            });
            assert!(accepted);
        }
        sink.finish();
        assert_eq!(sink.state(), SinkState::Released);
        assert_eq!(sink.stats().samples_written, 3);
        assert_eq!(codecs.resources().total(), 0);

        let (header, frames) = read_clip(&path).unwrap();
        assert_eq!((header.width, header.height), (8, 4));
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn test_finish_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let codecs = SoftwareCodecFactory::new();
        let sink = sink(&codecs, &dir.path().join("out.y4m"));
        sink.init().unwrap();
        sink.finish();
        let acquired = codecs.ledger().acquired_total();
        sink.finish();
        assert_eq!(sink.state(), SinkState::Released);
        assert_eq!(codecs.ledger().acquired_total(), acquired);
        assert_eq!(codecs.resources().total(), 0);
    }

    #[test]
    fn test_render_callback_can_query_sink() {
        let dir = tempfile::tempdir().unwrap();
        let codecs = SoftwareCodecFactory::new();
        let sink = sink(&codecs, &dir.path().join("out.y4m"));
        sink.init().unwrap();

        let accepted = sink.encode_frame(|s| {
            assert_eq!(sink.state(), SinkState::Started);
            assert_eq!(sink.failure(), None);
            assert!(sink.input_surface().unwrap().same_as(s));
            s.queue_frame(VideoFrame::filled(8, 4, 0, [9, 9, 9, 255])).unwrap();
        });
        assert!(accepted);
        sink.finish();
        assert_eq!(sink.stats().samples_written, 1);
    }

    #[test]
    fn test_abort_from_render_callback_skips_drain() {
        let dir = tempfile::tempdir().unwrap();
        let codecs = SoftwareCodecFactory::new();
        let sink = sink(&codecs, &dir.path().join("out.y4m"));
        sink.init().unwrap();

        assert!(!sink.encode_frame(|_| sink.abort()));
        assert_eq!(sink.state(), SinkState::Released);
        assert_eq!(sink.stats().buffers_released, 0);
        assert_eq!(codecs.resources().total(), 0);
    }

    #[test]
    fn test_frame_drain_does_not_wait_for_output() {
        let dir = tempfile::tempdir().unwrap();
        let codecs = SoftwareCodecFactory::new();
        let pipeline = PipelineSettings {
            codec_timeout_ms: 5_000,
            eos_poll_ms: 5_000,
            ..PipelineSettings::default()
        };
        let sink = EncodeSink::new(
            Arc::new(codecs.clone()),
            &dir.path().join("out.y4m"),
            settings(),
            &pipeline,
        );
        sink.init().unwrap();

        let started = Instant::now();
        assert!(sink.encode_frame(|_| {}));
        assert!(started.elapsed() < Duration::from_secs(1));
        sink.abort();
    }

    #[test]
    fn test_encode_before_init_skips_render() {
        let dir = tempfile::tempdir().unwrap();
        let codecs = SoftwareCodecFactory::new();
        let sink = sink(&codecs, &dir.path().join("out.y4m"));
        let mut called = false;
        assert!(!sink.encode_frame(|_| called = true));
        assert!(!called);
        sink.finish();
        assert_eq!(sink.state(), SinkState::Uninitialized);
    }

    #[test]
    fn test_second_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let codecs = SoftwareCodecFactory::new();
        let sink = sink(&codecs, &dir.path().join("out.y4m"));
        sink.init().unwrap();
        assert!(sink.init().is_err());
        assert_eq!(codecs.resources().encoders, 1);
    }

    #[test]
    fn test_drop_releases_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let codecs = SoftwareCodecFactory::new();
        {
            let sink = sink(&codecs, &dir.path().join("out.y4m"));
            sink.init().unwrap();
            assert_eq!(codecs.resources().total(), 2);
        }
        assert_eq!(codecs.resources().total(), 0);
    }

    #[test]
    fn test_unsupported_container_fails_init_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let codecs = SoftwareCodecFactory::new();
        let sink = sink(&codecs, &dir.path().join("out.mp4"));
        assert!(sink.init().is_err());
        assert_eq!(sink.state(), SinkState::Uninitialized);
        assert_eq!(codecs.resources().total(), 0);
    }
}
