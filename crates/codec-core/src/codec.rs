//! Codec traits.
//!
//! These mirror the buffer-queue model of platform media APIs: inputs and
//! outputs are addressed by slot index, dequeues take a bounded timeout,
//! and every dequeued output slot must be released back to its codec.

use std::path::Path;
use std::time::Duration;

use duocam_common::DuocamResult;

use crate::buffer::{BufferFlags, BufferInfo, OutputEvent};
use crate::format::{ContainerFormat, MediaFormat};
use crate::resources::ResourceSnapshot;
use crate::surface::{Surface, SurfaceTexture};

/// Demuxer over one container file.
pub trait MediaExtractor: Send {
    fn track_count(&self) -> usize;

    fn track_format(&self, index: usize) -> DuocamResult<MediaFormat>;

    /// Restrict reads to one track.
    fn select_track(&mut self, index: usize) -> DuocamResult<()>;

    /// Copy the current sample of the selected track into `buf`, replacing
    /// its contents. Returns `None` once the track is exhausted.
    fn read_sample_data(&mut self, buf: &mut Vec<u8>) -> DuocamResult<Option<usize>>;

    /// Presentation time of the current sample, `None` at end of stream.
    fn sample_time_us(&self) -> Option<i64>;

    fn sample_flags(&self) -> BufferFlags;

    /// Move to the next sample. Returns `false` when none is left.
    fn advance(&mut self) -> bool;

    /// Close the file. Idempotent.
    fn release(&mut self);
}

/// Video decoder rendering into a [`SurfaceTexture`].
pub trait VideoDecoder: Send {
    fn configure(&mut self, format: &MediaFormat, output: SurfaceTexture) -> DuocamResult<()>;

    fn start(&mut self) -> DuocamResult<()>;

    /// Free input slot, or `None` if none frees up within `timeout`.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> DuocamResult<Option<usize>>;

    /// Writable storage of a dequeued input slot.
    fn input_buffer(&mut self, index: usize) -> DuocamResult<&mut Vec<u8>>;

    /// Submit `size` bytes of slot `index`. An END_OF_STREAM flag with
    /// `size == 0` signals end of input.
    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> DuocamResult<()>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> DuocamResult<OutputEvent>;

    /// Return an output slot; with `render` the picture is posted to the
    /// configured surface texture first.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> DuocamResult<()>;

    fn stop(&mut self) -> DuocamResult<()>;

    /// Free the session. Idempotent.
    fn release(&mut self);
}

/// Video encoder fed through an input [`Surface`].
pub trait VideoEncoder: Send {
    fn configure(&mut self, format: &MediaFormat) -> DuocamResult<()>;

    /// Only valid between `configure` and `start`.
    fn create_input_surface(&mut self) -> DuocamResult<Surface>;

    fn start(&mut self) -> DuocamResult<()>;

    /// No more frames will arrive on the input surface.
    fn signal_end_of_input_stream(&mut self) -> DuocamResult<()>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> DuocamResult<OutputEvent>;

    /// Format of the encoded stream; valid after `FormatChanged`.
    fn output_format(&self) -> DuocamResult<MediaFormat>;

    fn output_buffer(&self, index: usize) -> DuocamResult<&[u8]>;

    fn release_output_buffer(&mut self, index: usize) -> DuocamResult<()>;

    fn stop(&mut self) -> DuocamResult<()>;

    /// Free the session. Idempotent.
    fn release(&mut self);
}

/// Container writer.
pub trait MediaMuxer: Send {
    fn add_track(&mut self, format: &MediaFormat) -> DuocamResult<usize>;

    fn start(&mut self) -> DuocamResult<()>;

    fn write_sample_data(
        &mut self,
        track: usize,
        data: &[u8],
        info: &BufferInfo,
    ) -> DuocamResult<()>;

    /// Finalize the container. Only valid after `start`.
    fn stop(&mut self) -> DuocamResult<()>;

    /// Close the output. Idempotent.
    fn release(&mut self);
}

/// Creates codec sessions for one backend.
pub trait CodecFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend can run on this host.
    fn is_available(&self) -> bool;

    fn create_extractor(&self, path: &Path) -> DuocamResult<Box<dyn MediaExtractor>>;

    fn create_decoder(&self, mime: &str) -> DuocamResult<Box<dyn VideoDecoder>>;

    fn create_encoder(&self, mime: &str) -> DuocamResult<Box<dyn VideoEncoder>>;

    fn create_muxer(
        &self,
        path: &Path,
        container: ContainerFormat,
    ) -> DuocamResult<Box<dyn MediaMuxer>>;

    /// Live sessions opened through this factory.
    fn resources(&self) -> ResourceSnapshot;
}
