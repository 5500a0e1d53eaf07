//! One recording's demux + decode chain, feeding a [`SurfaceTexture`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use duocam_codec_core::{
    BufferFlags, CodecFactory, MediaExtractor, MediaFormat, OutputEvent, SurfaceTexture,
    VideoDecoder,
};
use duocam_common::{DuocamError, DuocamResult};

/// Demuxer and decoder for the first video track of a file.
///
/// [`DecodeSource::open`] only touches the container, so a bad input is
/// rejected before any decoder session exists. [`DecodeSource::start`]
/// creates the decoder; from then on [`DecodeSource::has_next_frame`]
/// advances the pipeline by at most one input sample and one output
/// picture per call.
pub struct DecodeSource {
    path: PathBuf,
    format: MediaFormat,
    extractor: Option<Box<dyn MediaExtractor>>,
    decoder: Option<Box<dyn VideoDecoder>>,
    texture: SurfaceTexture,
    timeout: Duration,
    input_done: bool,
    output_done: bool,
    samples_queued: u64,
    frames_rendered: u64,
    activity: u64,
}

impl std::fmt::Debug for DecodeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeSource")
            .field("path", &self.path)
            .field("mime", &self.format.mime)
            .field("started", &self.decoder.is_some())
            .field("input_done", &self.input_done)
            .field("output_done", &self.output_done)
            .field("frames_rendered", &self.frames_rendered)
            .finish()
    }
}

impl DecodeSource {
    /// Open `path` and select its first video track.
    pub fn open(codecs: &dyn CodecFactory, path: &Path, timeout: Duration) -> DuocamResult<Self> {
        let mut extractor = codecs.create_extractor(path)?;

        let mut video = None;
        let mut audio_tracks = 0;
        for index in 0..extractor.track_count() {
            let format = match extractor.track_format(index) {
                Ok(format) => format,
                Err(e) => {
                    extractor.release();
                    return Err(e);
                }
            };
            if format.is_video() && video.is_none() {
                video = Some((index, format));
            } else if format.is_audio() {
                audio_tracks += 1;
            }
        }

        let Some((track, format)) = video else {
            extractor.release();
            return Err(DuocamError::NoVideoTrack {
                path: path.to_path_buf(),
            });
        };
        if audio_tracks > 0 {
            tracing::info!(
                path = %path.display(),
                audio_tracks,
                "Audio is not carried into the merged output"
            );
        }
        if let Err(e) = extractor.select_track(track) {
            extractor.release();
            return Err(e);
        }

        tracing::debug!(
            path = %path.display(),
            track,
            mime = %format.mime,
            width = ?format.width,
            height = ?format.height,
            "Opened decode source"
        );
        Ok(Self {
            path: path.to_path_buf(),
            format,
            extractor: Some(extractor),
            decoder: None,
            texture: SurfaceTexture::new(),
            timeout,
            input_done: false,
            output_done: false,
            samples_queued: 0,
            frames_rendered: 0,
            activity: 0,
        })
    }

    /// Create and start the decoder, rendering into this source's texture.
    pub fn start(&mut self, codecs: &dyn CodecFactory) -> DuocamResult<()> {
        if self.decoder.is_some() {
            return Err(DuocamError::codec_setup(format!(
                "{} is already decoding",
                self.path.display()
            )));
        }
        if self.extractor.is_none() {
            return Err(DuocamError::codec_setup(format!(
                "{} has been released",
                self.path.display()
            )));
        }
        let mut decoder = codecs.create_decoder(&self.format.mime)?;
        let started = decoder
            .configure(&self.format, self.texture.clone())
            .and_then(|()| decoder.start());
        if let Err(e) = started {
            decoder.release();
            return Err(e);
        }
        self.decoder = Some(decoder);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &MediaFormat {
        &self.format
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.format.duration_us
    }

    /// Where decoded pictures land.
    pub fn surface_texture(&self) -> &SurfaceTexture {
        &self.texture
    }

    /// A decoded picture is waiting to be latched.
    pub fn has_pending_frame(&self) -> bool {
        self.texture.frame_available()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Increases whenever a call moved data through the decoder.
    pub fn activity(&self) -> u64 {
        self.activity
    }

    pub fn is_exhausted(&self) -> bool {
        self.output_done
    }

    /// Feed at most one sample and drain at most one picture. Returns
    /// `false` once the decoder has reported end of stream.
    pub fn has_next_frame(&mut self) -> DuocamResult<bool> {
        if self.output_done {
            return Ok(false);
        }
        let (Some(extractor), Some(decoder)) = (self.extractor.as_mut(), self.decoder.as_mut())
        else {
            return Err(DuocamError::codec(format!(
                "{} is not decoding",
                self.path.display()
            )));
        };

        if !self.input_done {
            if let Some(index) = decoder.dequeue_input_buffer(self.timeout)? {
                let buf = decoder.input_buffer(index)?;
                match extractor.read_sample_data(buf)? {
                    Some(size) => {
                        let pts_us = extractor.sample_time_us().unwrap_or(0);
                        let flags = extractor.sample_flags().without(BufferFlags::END_OF_STREAM);
                        decoder.queue_input_buffer(index, size, pts_us, flags)?;
                        extractor.advance();
                        self.samples_queued += 1;
                    }
                    None => {
                        decoder.queue_input_buffer(index, 0, 0, BufferFlags::END_OF_STREAM)?;
                        self.input_done = true;
                        tracing::debug!(
                            path = %self.path.display(),
                            samples = self.samples_queued,
                            "Decoder input complete"
                        );
                    }
                }
                self.activity += 1;
            }
        }

        match decoder.dequeue_output_buffer(self.timeout)? {
            OutputEvent::TryAgainLater => {}
            OutputEvent::FormatChanged => {
                self.activity += 1;
                tracing::debug!(path = %self.path.display(), "Decoder output format changed");
            }
            OutputEvent::Buffer { index, info } => {
                self.activity += 1;
                let render = info.size > 0;
                decoder.release_output_buffer(index, render)?;
                if render {
                    self.frames_rendered += 1;
                }
                if info.is_end_of_stream() {
                    self.output_done = true;
                    tracing::debug!(
                        path = %self.path.display(),
                        frames = self.frames_rendered,
                        "Decoder reached end of stream"
                    );
                }
            }
        }
        Ok(!self.output_done)
    }

    /// Stop the decoder and close the file. Idempotent.
    pub fn release(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            if let Err(e) = decoder.stop() {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to stop decoder");
            }
            decoder.release();
        }
        if let Some(mut extractor) = self.extractor.take() {
            extractor.release();
            self.texture.release();
            tracing::debug!(path = %self.path.display(), "Released decode source");
        }
    }
}

impl Drop for DecodeSource {
    fn drop(&mut self) {
        self.release();
    }
}
